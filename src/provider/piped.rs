//! Piped adapter - normalizes the Piped streams API response.
//!
//! Piped (`GET {base}/streams/{video_id}`) returns the richest format
//! listing of the supported upstreams: every audio rendition with its
//! bitrate, container, and a direct stream URL.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::error::AcquireError;
use crate::locator::VideoLocator;

use super::http::{build_provider_http_client, send_error, status_error};
use super::{AudioFormat, PreferredQuality, ProviderAdapter, ProviderResult};

// ==================== Piped API Response Types ====================

/// Top-level `/streams/{id}` response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PipedStreamsResponse {
    title: Option<String>,
    duration: Option<u32>,
    audio_streams: Option<Vec<PipedAudioStream>>,
}

/// One entry of the `audioStreams` array.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PipedAudioStream {
    url: Option<String>,
    /// Container tag, e.g. `"M4A"` or `"WEBMA_OPUS"`.
    format: Option<String>,
    /// Human-readable label, e.g. `"128 kbps"`.
    quality: Option<String>,
    /// Average bitrate in bits per second.
    bitrate: Option<u64>,
    /// Declared size in bytes; Piped reports -1 when unknown.
    content_length: Option<i64>,
    mime_type: Option<String>,
}

// ==================== PipedAdapter ====================

/// Adapter for Piped API instances.
pub struct PipedAdapter {
    client: Client,
    base_url: String,
}

impl PipedAdapter {
    /// Creates a new adapter against the given Piped instance.
    ///
    /// # Errors
    ///
    /// Returns [`AcquireError::ProviderUnavailable`] if HTTP client
    /// construction fails.
    pub fn new(
        base_url: impl Into<String>,
        connect_timeout_secs: u64,
    ) -> Result<Self, AcquireError> {
        Ok(Self {
            client: build_provider_http_client("piped", connect_timeout_secs)?,
            base_url: base_url.into(),
        })
    }
}

impl std::fmt::Debug for PipedAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipedAdapter")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ProviderAdapter for PipedAdapter {
    fn name(&self) -> &str {
        "piped"
    }

    #[tracing::instrument(skip(self, _quality), fields(provider = "piped", video_id = %locator.video_id()))]
    async fn fetch(
        &self,
        locator: &VideoLocator,
        _quality: PreferredQuality,
        timeout: Duration,
    ) -> Result<ProviderResult, AcquireError> {
        let url = format!("{}/streams/{}", self.base_url, locator.video_id());

        let response = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| send_error("piped", &e))?;

        if !response.status().is_success() {
            return Err(status_error("piped", &response));
        }

        let body = response
            .json::<PipedStreamsResponse>()
            .await
            .map_err(|e| AcquireError::malformed("piped", e.to_string()))?;

        let streams = body.audio_streams.unwrap_or_default();
        let candidate_formats: Vec<AudioFormat> = streams
            .into_iter()
            .filter_map(normalize_stream)
            .collect();

        if candidate_formats.is_empty() {
            return Err(AcquireError::no_formats("piped"));
        }

        debug!(formats = candidate_formats.len(), "piped formats normalized");

        Ok(ProviderResult {
            provider_name: "piped".to_string(),
            title: body.title.unwrap_or_default(),
            duration_seconds: body.duration.unwrap_or(0),
            candidate_formats,
        })
    }
}

/// Normalizes one Piped audio stream; drops entries without a URL.
fn normalize_stream(stream: PipedAudioStream) -> Option<AudioFormat> {
    let source_url = stream.url?;
    let extension = extension_from_format_tag(
        stream.format.as_deref(),
        stream.mime_type.as_deref(),
    );

    Some(AudioFormat {
        extension,
        quality_label: stream.quality.unwrap_or_default(),
        // Piped reports bits per second.
        bitrate_kbps: (stream.bitrate.unwrap_or(0) / 1000) as u32,
        source_url,
        approx_size_bytes: stream
            .content_length
            .filter(|len| *len > 0)
            .map(|len| len as u64),
    })
}

/// Maps Piped's format tag (or the mime type as fallback) to an extension.
fn extension_from_format_tag(format: Option<&str>, mime_type: Option<&str>) -> String {
    if let Some(tag) = format {
        let tag = tag.to_ascii_lowercase();
        if tag.starts_with("m4a") {
            return "m4a".to_string();
        }
        if tag.starts_with("webm") {
            return "webm".to_string();
        }
    }
    match mime_type {
        Some("audio/mp4") => "m4a".to_string(),
        Some("audio/webm") => "webm".to_string(),
        _ => "bin".to_string(),
    }
}
