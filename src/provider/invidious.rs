//! Invidious adapter - normalizes the Invidious videos API response.
//!
//! Invidious (`GET {base}/api/v1/videos/{video_id}`) lists every adaptive
//! format, audio and video mixed, with string-typed numeric fields. The
//! adapter filters down to audio renditions and parses the string fields.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::error::AcquireError;
use crate::locator::VideoLocator;

use super::http::{build_provider_http_client, send_error, status_error};
use super::{AudioFormat, PreferredQuality, ProviderAdapter, ProviderResult};

// ==================== Invidious API Response Types ====================

/// Top-level `/api/v1/videos/{id}` response, trimmed to the fields we use.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvidiousVideoResponse {
    title: Option<String>,
    length_seconds: Option<u32>,
    adaptive_formats: Option<Vec<InvidiousFormat>>,
}

/// One entry of the `adaptiveFormats` array.
///
/// Invidious serializes `bitrate` and `clen` as decimal strings, not
/// numbers.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvidiousFormat {
    url: Option<String>,
    /// Full mime type with codec parameters, e.g. `audio/mp4; codecs="mp4a"`.
    #[serde(rename = "type")]
    mime_type: Option<String>,
    /// Average bitrate in bits per second, as a decimal string.
    bitrate: Option<String>,
    container: Option<String>,
    /// Quality tier tag, e.g. `AUDIO_QUALITY_MEDIUM`.
    audio_quality: Option<String>,
    /// Content length in bytes, as a decimal string.
    clen: Option<String>,
}

// ==================== InvidiousAdapter ====================

/// Adapter for Invidious API instances.
pub struct InvidiousAdapter {
    client: Client,
    base_url: String,
}

impl InvidiousAdapter {
    /// Creates a new adapter against the given Invidious instance.
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
            client: build_provider_http_client("invidious", connect_timeout_secs)?,
            base_url: base_url.into(),
        })
    }
}

impl std::fmt::Debug for InvidiousAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvidiousAdapter")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ProviderAdapter for InvidiousAdapter {
    fn name(&self) -> &str {
        "invidious"
    }

    #[tracing::instrument(skip(self, _quality), fields(provider = "invidious", video_id = %locator.video_id()))]
    async fn fetch(
        &self,
        locator: &VideoLocator,
        _quality: PreferredQuality,
        timeout: Duration,
    ) -> Result<ProviderResult, AcquireError> {
        let url = format!(
            "{}/api/v1/videos/{}?fields=title,lengthSeconds,adaptiveFormats",
            self.base_url,
            locator.video_id()
        );

        let response = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| send_error("invidious", &e))?;

        if !response.status().is_success() {
            return Err(status_error("invidious", &response));
        }

        let body = response
            .json::<InvidiousVideoResponse>()
            .await
            .map_err(|e| AcquireError::malformed("invidious", e.to_string()))?;

        let formats = body.adaptive_formats.unwrap_or_default();
        let candidate_formats: Vec<AudioFormat> = formats
            .into_iter()
            .filter(is_audio_format)
            .filter_map(normalize_format)
            .collect();

        if candidate_formats.is_empty() {
            return Err(AcquireError::no_formats("invidious"));
        }

        debug!(
            formats = candidate_formats.len(),
            "invidious formats normalized"
        );

        Ok(ProviderResult {
            provider_name: "invidious".to_string(),
            title: body.title.unwrap_or_default(),
            duration_seconds: body.length_seconds.unwrap_or(0),
            candidate_formats,
        })
    }
}

/// Keeps only formats whose mime type marks them as audio.
fn is_audio_format(format: &InvidiousFormat) -> bool {
    format
        .mime_type
        .as_deref()
        .is_some_and(|t| t.starts_with("audio/"))
}

/// Normalizes one Invidious format; drops entries without a URL.
fn normalize_format(format: InvidiousFormat) -> Option<AudioFormat> {
    let source_url = format.url?;

    let extension = format
        .container
        .map(|c| normalize_container(&c))
        .or_else(|| {
            format
                .mime_type
                .as_deref()
                .and_then(extension_from_mime_type)
        })
        .unwrap_or_else(|| "bin".to_string());

    // Invidious reports bits per second, string-encoded.
    let bitrate_kbps = format
        .bitrate
        .and_then(|b| b.parse::<u64>().ok())
        .map_or(0, |bps| (bps / 1000) as u32);

    Some(AudioFormat {
        extension,
        quality_label: format
            .audio_quality
            .map(quality_tag_to_label)
            .unwrap_or_default(),
        bitrate_kbps,
        source_url,
        approx_size_bytes: format.clen.and_then(|c| c.parse::<u64>().ok()),
    })
}

/// Maps Invidious container names to file extensions.
fn normalize_container(container: &str) -> String {
    match container.to_ascii_lowercase().as_str() {
        "mp4" | "m4a" => "m4a".to_string(),
        "webm" => "webm".to_string(),
        other => other.to_string(),
    }
}

/// Derives an extension from the mime type when no container is reported.
fn extension_from_mime_type(mime_type: &str) -> Option<String> {
    let base = mime_type.split(';').next()?.trim();
    match base {
        "audio/mp4" => Some("m4a".to_string()),
        "audio/webm" => Some("webm".to_string()),
        _ => None,
    }
}

/// Turns `AUDIO_QUALITY_MEDIUM` style tags into lowercase labels.
fn quality_tag_to_label(tag: String) -> String {
    tag.strip_prefix("AUDIO_QUALITY_")
        .unwrap_or(&tag)
        .to_ascii_lowercase()
}
