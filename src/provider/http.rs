//! Shared HTTP client construction policy for provider adapters.
//!
//! Centralizes networking defaults so adapters stay consistent on connect
//! timeout, user-agent, and compression. Per-call timeouts are deliberately
//! NOT configured here: the caller supplies each fetch's timeout through
//! `RequestBuilder::timeout`, keeping budget accounting in the retry layer.

use std::time::Duration;

use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response};
use tracing::{debug, warn};

use crate::error::AcquireError;

/// Maximum honoured Retry-After value (1 hour) to prevent excessive delays.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Builds the shared provider user-agent string.
///
/// All adapters share one UA so traffic is not trivially fingerprintable per
/// upstream instance.
#[must_use]
pub fn default_provider_user_agent() -> String {
    format!(
        "tunevault/{} (+https://github.com/tunevault/tunevault)",
        env!("CARGO_PKG_VERSION")
    )
}

/// Builds a provider HTTP client using shared project policy.
///
/// `provider_name` is used only for error messages and logging, not in the
/// User-Agent header.
///
/// # Errors
///
/// Returns [`AcquireError::ProviderUnavailable`] when client construction
/// fails.
pub fn build_provider_http_client(
    provider_name: &str,
    connect_timeout_secs: u64,
) -> Result<Client, AcquireError> {
    Client::builder()
        .connect_timeout(Duration::from_secs(connect_timeout_secs))
        .user_agent(default_provider_user_agent())
        .gzip(true)
        .build()
        .map_err(|error| {
            warn!(provider = provider_name, error = %error, "HTTP client construction failed");
            AcquireError::provider_unavailable(
                provider_name,
                format!("HTTP client construction failed: {error}"),
            )
        })
}

/// Translates a non-success provider response into the shared taxonomy.
///
/// Rate-limit and overload responses carry the parsed `Retry-After` hint so
/// the retry layer can honour server-mandated delays.
pub fn status_error(provider: &str, response: &Response) -> AcquireError {
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);

    let reason = match status {
        404 => "content not found on this instance".to_string(),
        429 => "rate limited".to_string(),
        s if s >= 500 => format!("upstream error (HTTP {s})"),
        s => format!("HTTP {s}"),
    };

    debug!(provider, status, ?retry_after, "provider returned error status");
    AcquireError::provider_unavailable_with_retry_after(provider, reason, retry_after)
}

/// Translates a reqwest send failure into the shared taxonomy.
pub fn send_error(provider: &str, error: &reqwest::Error) -> AcquireError {
    let reason = if error.is_timeout() {
        "request timed out".to_string()
    } else if error.is_connect() {
        format!("connection failed: {error}")
    } else {
        format!("request failed: {error}")
    };
    AcquireError::provider_unavailable(provider, reason)
}

/// Parses a `Retry-After` header value into a [`Duration`].
///
/// Accepts both delta-seconds and RFC 7231 HTTP-date forms; values past
/// [`MAX_RETRY_AFTER`] are capped, negative or unparseable values ignored.
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        }
        #[allow(clippy::cast_sign_loss)]
        let duration = Duration::from_secs(seconds as u64);
        return Some(duration.min(MAX_RETRY_AFTER));
    }

    if let Ok(datetime) = httpdate::parse_http_date(header_value) {
        let now = std::time::SystemTime::now();
        if let Ok(duration) = datetime.duration_since(now) {
            return Some(duration.min(MAX_RETRY_AFTER));
        }
        debug!(header_value, "Retry-After date is in the past, ignoring");
        return None;
    }

    debug!(header_value, "unparseable Retry-After value, ignoring");
    None
}
