//! Cobalt adapter - normalizes the Cobalt processing API response.
//!
//! Cobalt works differently from the direct-stream instances: a POST with
//! the canonical watch URL asks the service to prepare an audio download,
//! and the response carries exactly one URL (a tunnel through the Cobalt
//! instance or a redirect to the origin). There is no format listing to
//! choose from, so the quality preference shapes the request itself.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AcquireError;
use crate::locator::VideoLocator;

use super::http::{build_provider_http_client, send_error, status_error};
use super::{AudioFormat, PreferredQuality, ProviderAdapter, ProviderResult};

// ==================== Cobalt API Request/Response Types ====================

/// POST body for the Cobalt root endpoint.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CobaltRequest<'a> {
    url: &'a str,
    download_mode: &'static str,
    audio_format: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    audio_bitrate: Option<&'static str>,
}

/// Cobalt response envelope; `url`/`filename` are present for tunnel and
/// redirect statuses, `error` for the error status.
#[derive(Debug, Deserialize)]
struct CobaltResponse {
    status: String,
    url: Option<String>,
    filename: Option<String>,
    error: Option<CobaltErrorBody>,
}

#[derive(Debug, Deserialize)]
struct CobaltErrorBody {
    code: String,
}

/// Maps the quality preference onto Cobalt's request knobs.
fn request_options(quality: PreferredQuality) -> (&'static str, Option<&'static str>) {
    match quality {
        PreferredQuality::Low => ("mp3", Some("64")),
        PreferredQuality::Medium => ("mp3", Some("128")),
        PreferredQuality::High => ("mp3", Some("256")),
        PreferredQuality::Best => ("best", None),
    }
}

// ==================== CobaltAdapter ====================

/// Adapter for Cobalt API instances.
pub struct CobaltAdapter {
    client: Client,
    base_url: String,
}

impl CobaltAdapter {
    /// Creates a new adapter against the given Cobalt instance.
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
            client: build_provider_http_client("cobalt", connect_timeout_secs)?,
            base_url: base_url.into(),
        })
    }
}

impl std::fmt::Debug for CobaltAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CobaltAdapter")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ProviderAdapter for CobaltAdapter {
    fn name(&self) -> &str {
        "cobalt"
    }

    #[tracing::instrument(skip(self), fields(provider = "cobalt", video_id = %locator.video_id()))]
    async fn fetch(
        &self,
        locator: &VideoLocator,
        quality: PreferredQuality,
        timeout: Duration,
    ) -> Result<ProviderResult, AcquireError> {
        let canonical = locator.canonical_url();
        let (audio_format, audio_bitrate) = request_options(quality);
        let request = CobaltRequest {
            url: &canonical,
            download_mode: "audio",
            audio_format,
            audio_bitrate,
        };

        let response = self
            .client
            .post(&self.base_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&request)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| send_error("cobalt", &e))?;

        if !response.status().is_success() {
            return Err(status_error("cobalt", &response));
        }

        let body = response
            .json::<CobaltResponse>()
            .await
            .map_err(|e| AcquireError::malformed("cobalt", e.to_string()))?;

        normalize_response(body, locator, audio_format, audio_bitrate)
    }
}

/// Turns the Cobalt envelope into a single-format [`ProviderResult`].
fn normalize_response(
    body: CobaltResponse,
    locator: &VideoLocator,
    requested_format: &str,
    requested_bitrate: Option<&str>,
) -> Result<ProviderResult, AcquireError> {
    match body.status.as_str() {
        "tunnel" | "redirect" | "stream" => {
            let source_url = body.url.ok_or_else(|| {
                AcquireError::malformed("cobalt", format!("{} response without url", body.status))
            })?;

            let extension = body
                .filename
                .as_deref()
                .and_then(extension_from_filename)
                .unwrap_or_else(|| {
                    if requested_format == "best" {
                        "m4a".to_string()
                    } else {
                        requested_format.to_string()
                    }
                });
            let title = body
                .filename
                .as_deref()
                .map(title_from_filename)
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| locator.video_id().to_string());

            let bitrate_kbps = requested_bitrate
                .and_then(|b| b.parse::<u32>().ok())
                .unwrap_or(0);

            debug!(status = %body.status, extension = %extension, "cobalt response normalized");

            Ok(ProviderResult {
                provider_name: "cobalt".to_string(),
                title,
                // Cobalt does not report duration.
                duration_seconds: 0,
                candidate_formats: vec![AudioFormat {
                    extension,
                    quality_label: requested_bitrate
                        .map(|b| format!("{b} kbps"))
                        .unwrap_or_else(|| "best".to_string()),
                    bitrate_kbps,
                    source_url,
                    approx_size_bytes: None,
                }],
            })
        }
        "error" => {
            let code = body
                .error
                .map_or_else(|| "unknown error".to_string(), |e| e.code);
            // Content-level codes mean this item has nothing for us; anything
            // else is an instance problem worth retrying elsewhere.
            if code.contains("content") {
                Err(AcquireError::no_formats("cobalt"))
            } else {
                Err(AcquireError::provider_unavailable(
                    "cobalt",
                    format!("upstream reported: {code}"),
                ))
            }
        }
        other => Err(AcquireError::malformed(
            "cobalt",
            format!("unexpected status `{other}`"),
        )),
    }
}

/// Extracts a lowercase extension from a reported filename.
fn extension_from_filename(filename: &str) -> Option<String> {
    let (_, ext) = filename.rsplit_once('.')?;
    (!ext.is_empty() && ext.len() <= 5).then(|| ext.to_ascii_lowercase())
}

/// Uses the filename stem as the content title.
fn title_from_filename(filename: &str) -> String {
    filename
        .rsplit_once('.')
        .map_or(filename, |(stem, _)| stem)
        .to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json_string, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn locator() -> VideoLocator {
        VideoLocator::parse("dQw4w9WgXcQ").unwrap()
    }

    #[tokio::test]
    async fn test_cobalt_fetch_tunnel_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "tunnel",
                "url": "https://cobalt.example/tunnel?id=abc",
                "filename": "Test Track.mp3"
            })))
            .mount(&server)
            .await;

        let adapter = CobaltAdapter::new(server.uri(), 10).unwrap();
        let result = adapter
            .fetch(&locator(), PreferredQuality::Medium, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(result.provider_name, "cobalt");
        assert_eq!(result.title, "Test Track");
        assert_eq!(result.candidate_formats.len(), 1);

        let format = &result.candidate_formats[0];
        assert_eq!(format.extension, "mp3");
        assert_eq!(format.bitrate_kbps, 128);
        assert_eq!(format.source_url, "https://cobalt.example/tunnel?id=abc");
    }

    #[tokio::test]
    async fn test_cobalt_fetch_sends_audio_request() {
        let server = MockServer::start().await;
        let expected_body = serde_json::json!({
            "url": "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "downloadMode": "audio",
            "audioFormat": "best"
        });
        Mock::given(method("POST"))
            .and(path("/"))
            .and(body_json_string(expected_body.to_string()))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "redirect",
                "url": "https://origin.example/audio.m4a",
                "filename": "track.m4a"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = CobaltAdapter::new(server.uri(), 10).unwrap();
        let result = adapter
            .fetch(&locator(), PreferredQuality::Best, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(result.candidate_formats[0].extension, "m4a");
        assert_eq!(result.candidate_formats[0].quality_label, "best");
    }

    #[tokio::test]
    async fn test_cobalt_fetch_content_error_is_no_formats() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "error",
                "error": { "code": "error.api.content.video.unavailable" }
            })))
            .mount(&server)
            .await;

        let adapter = CobaltAdapter::new(server.uri(), 10).unwrap();
        let result = adapter
            .fetch(&locator(), PreferredQuality::Medium, Duration::from_secs(5))
            .await;

        assert!(matches!(result, Err(AcquireError::NoFormatsAvailable { .. })));
    }

    #[tokio::test]
    async fn test_cobalt_fetch_instance_error_is_provider_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "error",
                "error": { "code": "error.api.rate_exceeded" }
            })))
            .mount(&server)
            .await;

        let adapter = CobaltAdapter::new(server.uri(), 10).unwrap();
        let result = adapter
            .fetch(&locator(), PreferredQuality::Medium, Duration::from_secs(5))
            .await;

        assert!(matches!(
            result,
            Err(AcquireError::ProviderUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_cobalt_fetch_tunnel_without_url_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "tunnel"
            })))
            .mount(&server)
            .await;

        let adapter = CobaltAdapter::new(server.uri(), 10).unwrap();
        let result = adapter
            .fetch(&locator(), PreferredQuality::Medium, Duration::from_secs(5))
            .await;

        assert!(matches!(
            result,
            Err(AcquireError::ProviderMalformedResponse { .. })
        ));
    }

    #[test]
    fn test_extension_from_filename() {
        assert_eq!(extension_from_filename("track.MP3"), Some("mp3".to_string()));
        assert_eq!(extension_from_filename("no extension"), None);
        assert_eq!(extension_from_filename("weird.reallylongext"), None);
    }

    #[test]
    fn test_request_options_by_quality() {
        assert_eq!(request_options(PreferredQuality::Low), ("mp3", Some("64")));
        assert_eq!(request_options(PreferredQuality::Best), ("best", None));
    }
}
