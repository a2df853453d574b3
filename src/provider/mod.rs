//! Extraction provider adapters and the priority-ordered registry.
//!
//! Each adapter talks to one upstream extraction service and normalizes its
//! provider-specific response shape into a common [`ProviderResult`]. The
//! shapes differ substantially across upstreams (different field names, unit
//! conventions, even request methods), so nothing here assumes a shared
//! schema.
//!
//! # Architecture
//!
//! - [`ProviderAdapter`] - Async trait that individual adapters implement
//! - [`ProviderRegistry`] - Priority-ordered collection of adapters
//! - [`PipedAdapter`] - Piped API (`/streams/{id}`, `audioStreams` array)
//! - [`InvidiousAdapter`] - Invidious API (`/api/v1/videos/{id}`,
//!   `adaptiveFormats` array)
//! - [`CobaltAdapter`] - Cobalt API (POST, tunnel/redirect response)
//!
//! Adapters never retry internally and never choose their own timeout: the
//! caller supplies a per-call timeout and the retry layer owns all backoff,
//! so budget accounting stays centralized and backoff never compounds across
//! layers.

mod cobalt;
mod http;
mod invidious;
mod piped;

pub use cobalt::CobaltAdapter;
pub use http::{build_provider_http_client, default_provider_user_agent, parse_retry_after};
pub use invidious::InvidiousAdapter;
pub use piped::PipedAdapter;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::AcquireError;
use crate::locator::VideoLocator;

/// Quality preference for the acquired audio.
///
/// Shapes the provider request (e.g. the bitrate Cobalt is asked for) and is
/// recorded on formats for diagnostics; final format selection follows the
/// orchestrator's fixed priority rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreferredQuality {
    /// ~48 kbps, for constrained storage or voice content.
    Low,
    /// ~128 kbps, the default for music.
    #[default]
    Medium,
    /// ~160 kbps and above.
    High,
    /// Whatever the provider's best offering is.
    Best,
}

impl PreferredQuality {
    /// The target bitrate this preference asks providers for, when bounded.
    #[must_use]
    pub fn target_bitrate_kbps(self) -> Option<u32> {
        match self {
            Self::Low => Some(48),
            Self::Medium => Some(128),
            Self::High => Some(160),
            Self::Best => None,
        }
    }

    /// Parses user-facing quality labels like `"128K"` or `"best"`.
    ///
    /// Unrecognized labels fall back to [`PreferredQuality::Medium`].
    #[must_use]
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "48k" | "48" | "low" => Self::Low,
            "128k" | "128" | "medium" => Self::Medium,
            "160k" | "160" | "192k" | "192" | "high" => Self::High,
            "best" | "max" => Self::Best,
            other => {
                debug!(label = other, "unrecognized quality label, using medium");
                Self::Medium
            }
        }
    }
}

/// One downloadable audio rendition offered by a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFormat {
    /// Container extension, lowercase (`m4a`, `webm`, `mp3`).
    pub extension: String,
    /// Provider's human-readable quality label (`"128 kbps"`).
    pub quality_label: String,
    /// Average bitrate in kilobits per second; 0 when unknown.
    pub bitrate_kbps: u32,
    /// Direct (typically short-lived) URL for this rendition.
    pub source_url: String,
    /// Declared size in bytes, when the provider reports one.
    pub approx_size_bytes: Option<u64>,
}

/// A provider's normalized answer for one content id.
///
/// Ephemeral: consumed immediately by the orchestrator to pick a format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderResult {
    /// Name of the adapter that produced this result.
    pub provider_name: String,
    /// Content title as the provider reports it.
    pub title: String,
    /// Content duration in seconds; 0 when the provider does not report it.
    pub duration_seconds: u32,
    /// Candidate renditions, in the provider's listing order.
    pub candidate_formats: Vec<AudioFormat>,
}

/// Trait that all provider adapters implement.
///
/// # Object Safety
///
/// Uses `async_trait` to support dynamic dispatch via `Arc<dyn
/// ProviderAdapter>`; Rust 2024 native async traits are not object-safe,
/// which the registry pattern requires.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// The adapter's name (e.g. "piped", "invidious", "cobalt").
    fn name(&self) -> &str;

    /// Fetches and normalizes the provider's answer for one locator.
    ///
    /// `timeout` bounds this single call; the adapter must apply it to its
    /// upstream request and must not retry internally.
    ///
    /// # Errors
    ///
    /// Returns [`AcquireError::ProviderUnavailable`] for network/HTTP
    /// failures (with a Retry-After hint when the upstream sent one),
    /// [`AcquireError::ProviderMalformedResponse`] for parse failures, and
    /// [`AcquireError::NoFormatsAvailable`] when the response contains no
    /// usable audio rendition.
    async fn fetch(
        &self,
        locator: &VideoLocator,
        quality: PreferredQuality,
        timeout: Duration,
    ) -> Result<ProviderResult, AcquireError>;
}

/// A priority-ordered collection of provider adapters.
///
/// Registration order is priority order: the sequential strategy tries
/// adapters front to back, and the racing strategy uses registration order
/// only for log readability.
pub struct ProviderRegistry {
    adapters: Vec<Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            adapters: Vec::new(),
        }
    }

    /// Registers an adapter at the lowest priority so far.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        debug!(name = adapter.name(), "registering provider adapter");
        self.adapters.push(adapter);
    }

    /// Returns the adapters in priority order.
    #[must_use]
    pub fn adapters(&self) -> &[Arc<dyn ProviderAdapter>] {
        &self.adapters
    }

    /// Returns the number of registered adapters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    /// Returns true if no adapters are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.adapters.iter().map(|a| a.name()).collect();
        f.debug_struct("ProviderRegistry")
            .field("adapter_count", &self.adapters.len())
            .field("adapters", &names)
            .finish()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Default public instances for each upstream service.
const DEFAULT_PIPED_BASE: &str = "https://pipedapi.kavin.rocks";
const DEFAULT_INVIDIOUS_BASE: &str = "https://inv.nadeko.net";
const DEFAULT_COBALT_BASE: &str = "https://api.cobalt.tools";

/// Builds the default provider registry in priority order.
///
/// Order is deterministic: Piped first (richest format listings), then
/// Invidious, then Cobalt as the fallback that works when the direct-stream
/// instances are blocked. An adapter whose construction fails is skipped
/// with a warning so one broken upstream never disables acquisition.
#[must_use]
pub fn build_default_provider_registry(connect_timeout_secs: u64) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();

    match PipedAdapter::new(DEFAULT_PIPED_BASE, connect_timeout_secs) {
        Ok(adapter) => registry.register(Arc::new(adapter)),
        Err(error) => warn!(
            error = %error,
            "Piped adapter unavailable; continuing with remaining providers"
        ),
    }

    match InvidiousAdapter::new(DEFAULT_INVIDIOUS_BASE, connect_timeout_secs) {
        Ok(adapter) => registry.register(Arc::new(adapter)),
        Err(error) => warn!(
            error = %error,
            "Invidious adapter unavailable; continuing with remaining providers"
        ),
    }

    match CobaltAdapter::new(DEFAULT_COBALT_BASE, connect_timeout_secs) {
        Ok(adapter) => registry.register(Arc::new(adapter)),
        Err(error) => warn!(
            error = %error,
            "Cobalt adapter unavailable; continuing with remaining providers"
        ),
    }

    registry
}
