//! End-to-end acquisition: locator in, durably cached asset out.
//!
//! The orchestrator owns the sequencing every acquisition follows: consult
//! the cache, coalesce concurrent requests for the same content, query
//! providers under the shared wall-clock budget, pick a format, rehost the
//! bytes, and only then record the asset in the cache. Everything below it
//! (adapters, retry, transfer, storage, cache) is policy-free machinery;
//! the policy lives here.

use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tracing::{info, instrument, warn};

use crate::cache::{unix_timestamp_now, CacheEntry, ContentCache};
use crate::config::{AcquireConfig, SelectionStrategy};
use crate::error::AcquireError;
use crate::locator::VideoLocator;
use crate::provider::{AudioFormat, PreferredQuality, ProviderRegistry, ProviderResult};
use crate::race::{race_first_success, RaceOutcome};
use crate::retry::RetryBudget;
use crate::singleflight::SingleFlight;
use crate::storage::StorageTarget;
use crate::transfer::TransferEngine;

/// One acquisition request.
#[derive(Debug, Clone)]
pub struct AcquisitionRequest {
    /// Raw source locator: a bare video id or any accepted URL form.
    pub source_locator: String,
    /// When set, an existing cache row is ignored and replaced.
    pub force_refresh: bool,
    /// Quality preference forwarded to providers.
    pub preferred_quality: PreferredQuality,
}

impl AcquisitionRequest {
    /// A plain request for `source_locator` with default options.
    #[must_use]
    pub fn new(source_locator: impl Into<String>) -> Self {
        Self {
            source_locator: source_locator.into(),
            force_refresh: false,
            preferred_quality: PreferredQuality::default(),
        }
    }

    /// Ignores any existing cache row for this content.
    #[must_use]
    pub fn with_force_refresh(mut self) -> Self {
        self.force_refresh = true;
        self
    }

    /// Sets the quality preference.
    #[must_use]
    pub fn with_quality(mut self, quality: PreferredQuality) -> Self {
        self.preferred_quality = quality;
        self
    }
}

/// The acquisition pipeline entry point.
///
/// Cheap to clone; clones share the cache, storage, and the in-flight
/// coalescing table.
#[derive(Clone)]
pub struct AcquisitionOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    config: AcquireConfig,
    registry: ProviderRegistry,
    cache: ContentCache,
    storage: Arc<dyn StorageTarget>,
    transfer: TransferEngine,
    retry: RetryBudget,
    singleflight: SingleFlight<CacheEntry>,
}

impl AcquisitionOrchestrator {
    /// Assembles a pipeline from its parts.
    ///
    /// `config` is taken as already validated; see
    /// [`AcquireConfig::validate`].
    ///
    /// # Errors
    ///
    /// Returns [`AcquireError::ProviderUnavailable`] when the transfer
    /// HTTP client cannot be constructed.
    pub fn new(
        config: AcquireConfig,
        registry: ProviderRegistry,
        cache: ContentCache,
        storage: Arc<dyn StorageTarget>,
    ) -> Result<Self, AcquireError> {
        let transfer = TransferEngine::new(&config)?;
        let retry = RetryBudget::from_config(&config);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                registry,
                cache,
                storage,
                transfer,
                retry,
                singleflight: SingleFlight::new(),
            }),
        })
    }

    /// Acquires the asset for one request.
    ///
    /// Cache hits return immediately. Misses run the full pipeline, with
    /// concurrent requests for the same content id coalesced onto one
    /// underlying acquisition whose outcome every caller shares.
    ///
    /// # Errors
    ///
    /// Returns [`AcquireError::InvalidLocator`] for unparseable input and
    /// otherwise whatever terminal error the pipeline produced.
    #[instrument(skip(self), fields(locator = %request.source_locator))]
    pub async fn acquire(&self, request: AcquisitionRequest) -> Result<CacheEntry, AcquireError> {
        let locator = VideoLocator::parse(&request.source_locator)?;
        let content_id = locator.video_id().to_string();

        if !request.force_refresh {
            if let Some(entry) = self.inner.cache.get(&content_id).await? {
                info!(content_id, "serving from cache");
                return Ok(entry);
            }
        }

        let inner = Arc::clone(&self.inner);
        let quality = request.preferred_quality;
        self.inner
            .singleflight
            .run(&content_id, move || async move {
                inner.acquire_uncached(&locator, quality).await
            })
            .await
    }

    /// The number of acquisitions currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.singleflight.in_flight()
    }
}

impl Inner {
    /// Runs the full provider-to-cache pipeline for a cache miss.
    async fn acquire_uncached(
        self: Arc<Self>,
        locator: &VideoLocator,
        quality: PreferredQuality,
    ) -> Result<CacheEntry, AcquireError> {
        let started = Instant::now();
        let budget = self.config.operation_budget();
        let content_id = locator.video_id();

        if self.registry.is_empty() {
            return Err(AcquireError::NoProviderAvailable {
                locator: content_id.to_string(),
            });
        }

        let provider_result = match self.config.strategy {
            SelectionStrategy::Sequential => {
                self.fetch_sequential(locator, quality, started, budget).await
            }
            SelectionStrategy::Racing => {
                self.fetch_racing(locator, quality, started, budget).await
            }
        };
        let provider_result = match provider_result {
            Ok(result) => result,
            Err(error) => {
                warn!(content_id, %error, "acquisition failed before format selection");
                return Err(error);
            }
        };

        let format = select_best_format(
            &provider_result.candidate_formats,
            &self.config.preferred_extension,
        )
        .ok_or_else(|| AcquireError::no_formats(&provider_result.provider_name))?
        .clone();

        info!(
            content_id,
            provider = %provider_result.provider_name,
            extension = %format.extension,
            bitrate_kbps = format.bitrate_kbps,
            "format selected"
        );

        let entry = if self.config.rehost_assets {
            self.rehost(content_id, &provider_result, &format, started, budget)
                .await?
        } else {
            metadata_only_entry(content_id, &provider_result, &format)
        };

        // The row is written last: its existence implies a usable asset.
        self.cache.put(&entry).await?;

        info!(
            content_id,
            provider = %entry.provider_name,
            byte_size = entry.byte_size,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "acquisition complete"
        );
        Ok(entry)
    }

    /// Tries providers one at a time in priority order.
    async fn fetch_sequential(
        &self,
        locator: &VideoLocator,
        quality: PreferredQuality,
        started: Instant,
        budget: Duration,
    ) -> Result<ProviderResult, AcquireError> {
        let mut attempts: u32 = 0;
        let mut last_error: Option<AcquireError> = None;

        for adapter in self.registry.adapters() {
            let remaining = budget.saturating_sub(started.elapsed());
            if remaining < self.config.min_attempt() {
                warn!(
                    tried = attempts,
                    "budget exhausted with providers still untried"
                );
                return Err(AcquireError::budget_exceeded(budget, started.elapsed()));
            }

            let provider_budget = self.config.provider_budget().min(remaining);
            let result = self
                .retry
                .attempt(provider_budget, |timeout| {
                    let locator = locator.clone();
                    let adapter = Arc::clone(adapter);
                    async move { adapter.fetch(&locator, quality, timeout).await }
                })
                .await;

            match result {
                Ok(result) => return Ok(result),
                Err(error) => {
                    warn!(provider = adapter.name(), %error, "provider exhausted, moving on");
                    attempts += 1;
                    last_error = Some(error);
                }
            }
        }

        let last_error = last_error
            .map_or_else(|| "no providers tried".to_string(), |e| e.to_string());
        Err(AcquireError::AllProvidersExhausted {
            content_id: locator.video_id().to_string(),
            attempts,
            last_error,
        })
    }

    /// Launches every provider at once and takes the first success.
    async fn fetch_racing(
        &self,
        locator: &VideoLocator,
        quality: PreferredQuality,
        started: Instant,
        budget: Duration,
    ) -> Result<ProviderResult, AcquireError> {
        let remaining = budget.saturating_sub(started.elapsed());
        let provider_budget = self.config.provider_budget().min(remaining);

        let tasks: Vec<_> = self
            .registry
            .adapters()
            .iter()
            .map(|adapter| {
                let adapter = Arc::clone(adapter);
                let locator = locator.clone();
                let retry = self.retry.clone();
                async move {
                    retry
                        .attempt(provider_budget, |timeout| {
                            let adapter = Arc::clone(&adapter);
                            let locator = locator.clone();
                            async move { adapter.fetch(&locator, quality, timeout).await }
                        })
                        .await
                }
            })
            .collect();

        match race_first_success(tasks, remaining).await {
            RaceOutcome::Winner(result) => Ok(result),
            RaceOutcome::AllFailed {
                last_error,
                attempts,
            } => Err(AcquireError::AllProvidersExhausted {
                content_id: locator.video_id().to_string(),
                attempts,
                last_error: last_error.to_string(),
            }),
            RaceOutcome::DeadlineExpired { attempts } => {
                warn!(attempts, "race deadline expired with providers pending");
                Err(AcquireError::budget_exceeded(budget, started.elapsed()))
            }
        }
    }

    /// Copies the chosen rendition into durable storage.
    async fn rehost(
        &self,
        content_id: &str,
        provider_result: &ProviderResult,
        format: &AudioFormat,
        started: Instant,
        budget: Duration,
    ) -> Result<CacheEntry, AcquireError> {
        let remaining = budget.saturating_sub(started.elapsed());
        if remaining < self.config.min_attempt() {
            return Err(AcquireError::budget_exceeded(budget, started.elapsed()));
        }

        let object_path = object_path_for(content_id, &format.extension);
        let content_type = content_type_for(&format.extension);

        let outcome = self
            .retry
            .attempt(remaining, |timeout| {
                self.transfer.transfer(
                    &format.source_url,
                    self.storage.as_ref(),
                    &object_path,
                    content_type,
                    timeout,
                )
            })
            .await?;

        Ok(CacheEntry {
            content_id: content_id.to_string(),
            title: provider_result.title.clone(),
            duration_seconds: i64::from(provider_result.duration_seconds),
            stored_location: outcome.stored_location,
            byte_size: outcome.byte_size as i64,
            provider_name: provider_result.provider_name.clone(),
            created_at: unix_timestamp_now(),
        })
    }
}

/// A cache record that points straight at the provider URL.
///
/// Used when rehosting is disabled; byte size stays 0 because nothing was
/// stored.
fn metadata_only_entry(
    content_id: &str,
    provider_result: &ProviderResult,
    format: &AudioFormat,
) -> CacheEntry {
    CacheEntry {
        content_id: content_id.to_string(),
        title: provider_result.title.clone(),
        duration_seconds: i64::from(provider_result.duration_seconds),
        stored_location: format.source_url.clone(),
        byte_size: 0,
        provider_name: provider_result.provider_name.clone(),
        created_at: unix_timestamp_now(),
    }
}

/// Picks one rendition deterministically.
///
/// Formats in the preferred container are considered first; within the
/// considered set the highest bitrate wins, and ties keep the earliest
/// listed entry. Identical input always selects the identical format.
fn select_best_format<'a>(
    formats: &'a [AudioFormat],
    preferred_extension: &str,
) -> Option<&'a AudioFormat> {
    let preferred: Vec<&AudioFormat> = formats
        .iter()
        .filter(|f| f.extension == preferred_extension)
        .collect();
    let pool: Vec<&AudioFormat> = if preferred.is_empty() {
        formats.iter().collect()
    } else {
        preferred
    };

    pool.into_iter().reduce(|best, candidate| {
        if candidate.bitrate_kbps > best.bitrate_kbps {
            candidate
        } else {
            best
        }
    })
}

/// Storage path for one asset: a digest-derived name under `audio/`.
///
/// Hashing keeps the path filesystem-safe regardless of what the id
/// contains, and makes the path a pure function of content id and
/// container, so re-acquisition overwrites rather than accumulates.
fn object_path_for(content_id: &str, extension: &str) -> String {
    let digest = Sha256::digest(content_id.as_bytes());
    let mut prefix = String::with_capacity(16);
    for byte in &digest[..8] {
        prefix.push_str(&format!("{byte:02x}"));
    }
    format!("audio/{prefix}.{extension}")
}

/// MIME type for a container extension.
fn content_type_for(extension: &str) -> &'static str {
    match extension {
        "m4a" => "audio/mp4",
        "webm" => "audio/webm",
        "mp3" => "audio/mpeg",
        "opus" | "ogg" => "audio/ogg",
        "wav" => "audio/wav",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::provider::ProviderAdapter;
    use crate::storage::FsStorage;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const VIDEO_ID: &str = "dQw4w9WgXcQ";

    fn format(extension: &str, bitrate: u32, url: &str) -> AudioFormat {
        AudioFormat {
            extension: extension.to_string(),
            quality_label: format!("{bitrate} kbps"),
            bitrate_kbps: bitrate,
            source_url: url.to_string(),
            approx_size_bytes: None,
        }
    }

    /// Adapter returning a fixed result and counting its invocations.
    struct CountingAdapter {
        name: &'static str,
        calls: Arc<AtomicU32>,
        result: Result<ProviderResult, AcquireError>,
    }

    impl CountingAdapter {
        fn ok(name: &'static str, source_url: &str, calls: Arc<AtomicU32>) -> Self {
            Self {
                name,
                calls,
                result: Ok(ProviderResult {
                    provider_name: name.to_string(),
                    title: "Test Track".to_string(),
                    duration_seconds: 212,
                    candidate_formats: vec![format("m4a", 128, source_url)],
                }),
            }
        }

        fn failing(name: &'static str, calls: Arc<AtomicU32>) -> Self {
            Self {
                name,
                calls,
                result: Err(AcquireError::no_formats(name)),
            }
        }
    }

    #[async_trait]
    impl ProviderAdapter for CountingAdapter {
        fn name(&self) -> &str {
            self.name
        }

        async fn fetch(
            &self,
            _locator: &VideoLocator,
            _quality: PreferredQuality,
            _timeout: Duration,
        ) -> Result<ProviderResult, AcquireError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    async fn mock_audio_server(body: &[u8]) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/audio.m4a"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/audio.m4a"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
            .mount(&server)
            .await;
        server
    }

    async fn orchestrator_with(
        registry: ProviderRegistry,
        dir: &TempDir,
    ) -> AcquisitionOrchestrator {
        let cache = ContentCache::new_in_memory().await.unwrap();
        let storage = Arc::new(FsStorage::new(dir.path()));
        AcquisitionOrchestrator::new(AcquireConfig::default(), registry, cache, storage).unwrap()
    }

    #[tokio::test]
    async fn test_acquire_miss_runs_pipeline_and_caches() {
        let server = mock_audio_server(&[9u8; 2048]).await;
        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(CountingAdapter::ok(
            "piped",
            &format!("{}/audio.m4a", server.uri()),
            Arc::clone(&calls),
        )));

        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator_with(registry, &dir).await;
        let entry = orchestrator
            .acquire(AcquisitionRequest::new(VIDEO_ID))
            .await
            .unwrap();

        assert_eq!(entry.content_id, VIDEO_ID);
        assert_eq!(entry.provider_name, "piped");
        assert_eq!(entry.byte_size, 2048);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // The asset really exists where the entry points.
        let stored = tokio::fs::read(&entry.stored_location).await.unwrap();
        assert_eq!(stored.len(), 2048);
    }

    #[tokio::test]
    async fn test_acquire_hit_skips_providers() {
        let server = mock_audio_server(&[9u8; 64]).await;
        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(CountingAdapter::ok(
            "piped",
            &format!("{}/audio.m4a", server.uri()),
            Arc::clone(&calls),
        )));

        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator_with(registry, &dir).await;

        let first = orchestrator
            .acquire(AcquisitionRequest::new(VIDEO_ID))
            .await
            .unwrap();
        let second = orchestrator
            .acquire(AcquisitionRequest::new(VIDEO_ID))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1, "cache hit must not refetch");
    }

    #[tokio::test]
    async fn test_force_refresh_bypasses_cache() {
        let server = mock_audio_server(&[9u8; 64]).await;
        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(CountingAdapter::ok(
            "piped",
            &format!("{}/audio.m4a", server.uri()),
            Arc::clone(&calls),
        )));

        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator_with(registry, &dir).await;

        orchestrator
            .acquire(AcquisitionRequest::new(VIDEO_ID))
            .await
            .unwrap();
        orchestrator
            .acquire(AcquisitionRequest::new(VIDEO_ID).with_force_refresh())
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_acquire_invalid_locator() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator_with(ProviderRegistry::new(), &dir).await;
        let result = orchestrator
            .acquire(AcquisitionRequest::new("not a locator"))
            .await;
        assert!(matches!(result, Err(AcquireError::InvalidLocator { .. })));
    }

    #[tokio::test]
    async fn test_acquire_empty_registry() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator_with(ProviderRegistry::new(), &dir).await;
        let result = orchestrator.acquire(AcquisitionRequest::new(VIDEO_ID)).await;
        assert!(matches!(result, Err(AcquireError::NoProviderAvailable { .. })));
    }

    #[tokio::test]
    async fn test_sequential_falls_through_to_second_provider() {
        let server = mock_audio_server(&[9u8; 64]).await;
        let first_calls = Arc::new(AtomicU32::new(0));
        let second_calls = Arc::new(AtomicU32::new(0));
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(CountingAdapter::failing(
            "piped",
            Arc::clone(&first_calls),
        )));
        registry.register(Arc::new(CountingAdapter::ok(
            "invidious",
            &format!("{}/audio.m4a", server.uri()),
            Arc::clone(&second_calls),
        )));

        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator_with(registry, &dir).await;
        let entry = orchestrator
            .acquire(AcquisitionRequest::new(VIDEO_ID))
            .await
            .unwrap();

        assert_eq!(entry.provider_name, "invidious");
        assert_eq!(first_calls.load(Ordering::SeqCst), 1);
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_all_providers_failing_is_exhaustion() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(CountingAdapter::failing(
            "piped",
            Arc::new(AtomicU32::new(0)),
        )));
        registry.register(Arc::new(CountingAdapter::failing(
            "invidious",
            Arc::new(AtomicU32::new(0)),
        )));

        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator_with(registry, &dir).await;
        let result = orchestrator.acquire(AcquisitionRequest::new(VIDEO_ID)).await;

        match result {
            Err(AcquireError::AllProvidersExhausted { attempts, .. }) => {
                assert_eq!(attempts, 2);
            }
            other => panic!("expected AllProvidersExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failed_acquisition_writes_no_cache_row() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(CountingAdapter::failing(
            "piped",
            Arc::new(AtomicU32::new(0)),
        )));

        let dir = TempDir::new().unwrap();
        let cache = ContentCache::new_in_memory().await.unwrap();
        let storage = Arc::new(FsStorage::new(dir.path()));
        let orchestrator = AcquisitionOrchestrator::new(
            AcquireConfig::default(),
            registry,
            cache.clone(),
            storage,
        )
        .unwrap();

        let result = orchestrator.acquire(AcquisitionRequest::new(VIDEO_ID)).await;
        assert!(result.is_err());
        assert_eq!(cache.get(VIDEO_ID).await.unwrap(), None);
    }

    #[test]
    fn test_select_best_format_prefers_extension_then_bitrate() {
        let formats = vec![
            format("webm", 160, "a"),
            format("m4a", 48, "b"),
            format("m4a", 128, "c"),
        ];
        let chosen = select_best_format(&formats, "m4a").unwrap();
        assert_eq!(chosen.source_url, "c");
    }

    #[test]
    fn test_select_best_format_falls_back_to_any_extension() {
        let formats = vec![format("webm", 64, "a"), format("webm", 160, "b")];
        let chosen = select_best_format(&formats, "m4a").unwrap();
        assert_eq!(chosen.source_url, "b");
    }

    #[test]
    fn test_select_best_format_tie_keeps_listing_order() {
        let formats = vec![format("m4a", 128, "first"), format("m4a", 128, "second")];
        let chosen = select_best_format(&formats, "m4a").unwrap();
        assert_eq!(chosen.source_url, "first");
    }

    #[test]
    fn test_select_best_format_empty_is_none() {
        assert!(select_best_format(&[], "m4a").is_none());
    }

    #[test]
    fn test_object_path_is_stable_and_safe() {
        let first = object_path_for(VIDEO_ID, "m4a");
        let second = object_path_for(VIDEO_ID, "m4a");
        assert_eq!(first, second);
        assert!(first.starts_with("audio/"));
        assert!(first.ends_with(".m4a"));
        assert_ne!(first, object_path_for("aqz-KE-bpKQ", "m4a"));
    }

    #[test]
    fn test_content_type_mapping() {
        assert_eq!(content_type_for("m4a"), "audio/mp4");
        assert_eq!(content_type_for("mp3"), "audio/mpeg");
        assert_eq!(content_type_for("xyz"), "application/octet-stream");
    }
}
