//! tunevault - acquire, deduplicate, and cache audio assets.
//!
//! The pipeline turns a source locator (a video id or share URL) into a
//! durably stored audio asset: extraction providers are queried under a
//! shared wall-clock budget, the chosen rendition is streamed into storage,
//! and a metadata row records the result so repeat requests are served
//! from cache. Concurrent requests for the same content coalesce onto one
//! underlying acquisition.
//!
//! # Architecture
//!
//! - [`orchestrator`] - End-to-end acquisition sequencing
//! - [`provider`] - Extraction provider adapters and the registry
//! - [`retry`] - Budget-aware retry with adaptive timeouts
//! - [`singleflight`] - Coalescing of concurrent identical requests
//! - [`race`] - First-success racing over provider futures
//! - [`transfer`] - Streaming copy from provider URLs into storage
//! - [`storage`] - Durable object storage behind a trait
//! - [`cache`] - SQLite-backed asset metadata
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tunevault::{
//!     build_default_provider_registry, AcquireConfig, AcquisitionOrchestrator,
//!     AcquisitionRequest, ContentCache, FsStorage,
//! };
//!
//! # async fn run() -> Result<(), tunevault::AcquireError> {
//! let config = AcquireConfig::default();
//! let registry = build_default_provider_registry(config.connect_timeout_secs);
//! let cache = ContentCache::new(std::path::Path::new("vault.db")).await?;
//! let storage = Arc::new(FsStorage::new("/var/lib/tunevault"));
//!
//! let orchestrator = AcquisitionOrchestrator::new(config, registry, cache, storage)?;
//! let asset = orchestrator
//!     .acquire(AcquisitionRequest::new("dQw4w9WgXcQ"))
//!     .await?;
//! println!("stored at {}", asset.stored_location);
//! # Ok(())
//! # }
//! ```

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
pub mod config;
pub mod error;
pub mod locator;
pub mod orchestrator;
pub mod provider;
pub mod race;
pub mod retry;
pub mod singleflight;
pub mod storage;
pub mod transfer;

// Re-export commonly used types
pub use cache::{CacheEntry, ContentCache};
pub use config::{AcquireConfig, ConfigError, SelectionStrategy};
pub use error::{classify, AcquireError, FailureClass};
pub use locator::VideoLocator;
pub use orchestrator::{AcquisitionOrchestrator, AcquisitionRequest};
pub use provider::{
    build_default_provider_registry, AudioFormat, CobaltAdapter, InvidiousAdapter, PipedAdapter,
    PreferredQuality, ProviderAdapter, ProviderRegistry, ProviderResult,
};
pub use race::{race_first_success, RaceOutcome};
pub use retry::RetryBudget;
pub use singleflight::SingleFlight;
pub use storage::{FsStorage, StorageTarget, WriteHandle};
pub use transfer::{TransferEngine, TransferOutcome};
