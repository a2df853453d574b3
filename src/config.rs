//! Tunable configuration for the acquisition pipeline.
//!
//! Every size and timeout ceiling is configuration, not hard-coded logic:
//! the hosting environment's wall-clock and memory limits vary by deployment
//! target, so deployments tune these rather than patch code.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Default shared wall-clock budget for one acquisition (25 seconds).
const DEFAULT_OPERATION_BUDGET_MS: u64 = 25_000;

/// Default per-provider sub-budget used by the racing strategy (12 seconds).
const DEFAULT_PROVIDER_BUDGET_MS: u64 = 12_000;

/// Default object size ceiling (50 MiB).
const DEFAULT_MAX_OBJECT_BYTES: u64 = 50 * 1024 * 1024;

/// Default per-read stall timeout (8 seconds).
const DEFAULT_PER_READ_TIMEOUT_MS: u64 = 8_000;

/// Default minimum viable single-attempt duration (1.5 seconds).
const DEFAULT_MIN_ATTEMPT_MS: u64 = 1_500;

/// Default maximum single-attempt duration (10 seconds).
const DEFAULT_MAX_ATTEMPT_MS: u64 = 10_000;

/// Default HTTP connect timeout (10 seconds).
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default backoff base for transient network failures (250ms).
const DEFAULT_NETWORK_BACKOFF_BASE_MS: u64 = 250;

/// Default backoff base for timeout-class failures (1 second).
const DEFAULT_STALL_BACKOFF_BASE_MS: u64 = 1_000;

/// Default maximum random jitter added to backoff delays (250ms).
const DEFAULT_MAX_JITTER_MS: u64 = 250;

/// Default cap on a backoff delay as a fraction of remaining budget.
const DEFAULT_MAX_DELAY_FRACTION: f64 = 0.25;

/// Default fraction of remaining budget granted to the first attempt.
const DEFAULT_ATTEMPT_FRACTION: f64 = 0.5;

/// Default preferred container extension for format selection.
const DEFAULT_PREFERRED_EXTENSION: &str = "m4a";

/// Provider selection strategy for the orchestrator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionStrategy {
    /// Try providers one at a time in priority order, stopping at the first
    /// success.
    #[default]
    Sequential,
    /// Launch all providers concurrently under per-provider sub-budgets and
    /// take the first success before the shared deadline.
    Racing,
}

/// Configuration error for out-of-range values.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A numeric field is outside its accepted range.
    #[error("invalid config value for `{field}`: {value}. Expected range: {expected}")]
    OutOfRange {
        /// Field name as it appears in config files.
        field: &'static str,
        /// The rejected value, stringified.
        value: String,
        /// Human-readable accepted range.
        expected: &'static str,
    },
}

/// All tunable budgets and ceilings for the acquisition pipeline.
///
/// Deserializable from deployment config; unspecified fields take defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AcquireConfig {
    /// Shared wall-clock budget for one acquisition, in milliseconds.
    /// All provider attempts, backoff delays, and the transfer must fit here.
    pub operation_budget_ms: u64,
    /// Per-provider sub-budget for the racing strategy, in milliseconds.
    pub provider_budget_ms: u64,
    /// Hard ceiling on object size; transfers abort past this.
    pub max_object_bytes: u64,
    /// Per-read stall timeout during transfers, in milliseconds.
    pub per_read_timeout_ms: u64,
    /// Minimum viable single-attempt duration, in milliseconds. When the
    /// remaining budget falls below this, retrying stops immediately.
    pub min_attempt_ms: u64,
    /// Maximum single-attempt duration, in milliseconds.
    pub max_attempt_ms: u64,
    /// HTTP connect timeout for provider and transfer clients, in seconds.
    pub connect_timeout_secs: u64,
    /// Backoff base for transient network failures, in milliseconds.
    pub network_backoff_base_ms: u64,
    /// Backoff base for timeout-class failures, in milliseconds.
    pub stall_backoff_base_ms: u64,
    /// Maximum random jitter added to backoff delays, in milliseconds.
    pub max_jitter_ms: u64,
    /// Cap on one backoff delay as a fraction of the remaining budget.
    pub max_delay_fraction: f64,
    /// Fraction of remaining budget granted to the first attempt; later
    /// attempts receive progressively smaller fractions.
    pub attempt_fraction: f64,
    /// Provider selection strategy.
    pub strategy: SelectionStrategy,
    /// Preferred container extension for format selection.
    pub preferred_extension: String,
    /// Whether provider URLs are copied into durable storage. When disabled,
    /// only metadata is cached and the provider URL is served directly.
    pub rehost_assets: bool,
    /// Whether to probe declared content length before opening a transfer.
    pub preflight_size_check: bool,
}

impl Default for AcquireConfig {
    fn default() -> Self {
        Self {
            operation_budget_ms: DEFAULT_OPERATION_BUDGET_MS,
            provider_budget_ms: DEFAULT_PROVIDER_BUDGET_MS,
            max_object_bytes: DEFAULT_MAX_OBJECT_BYTES,
            per_read_timeout_ms: DEFAULT_PER_READ_TIMEOUT_MS,
            min_attempt_ms: DEFAULT_MIN_ATTEMPT_MS,
            max_attempt_ms: DEFAULT_MAX_ATTEMPT_MS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            network_backoff_base_ms: DEFAULT_NETWORK_BACKOFF_BASE_MS,
            stall_backoff_base_ms: DEFAULT_STALL_BACKOFF_BASE_MS,
            max_jitter_ms: DEFAULT_MAX_JITTER_MS,
            max_delay_fraction: DEFAULT_MAX_DELAY_FRACTION,
            attempt_fraction: DEFAULT_ATTEMPT_FRACTION,
            strategy: SelectionStrategy::default(),
            preferred_extension: DEFAULT_PREFERRED_EXTENSION.to_string(),
            rehost_assets: true,
            preflight_size_check: true,
        }
    }
}

impl AcquireConfig {
    /// Validates field values against their accepted ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::OutOfRange`] for the first invalid field found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_range(
            "operation_budget_ms",
            self.operation_budget_ms,
            100..=600_000,
            "100..=600000",
        )?;
        validate_range(
            "provider_budget_ms",
            self.provider_budget_ms,
            100..=600_000,
            "100..=600000",
        )?;
        validate_range(
            "max_object_bytes",
            self.max_object_bytes,
            1..=1_073_741_824,
            "1..=1073741824",
        )?;
        validate_range(
            "per_read_timeout_ms",
            self.per_read_timeout_ms,
            50..=120_000,
            "50..=120000",
        )?;
        validate_range("min_attempt_ms", self.min_attempt_ms, 1..=60_000, "1..=60000")?;
        validate_range("max_attempt_ms", self.max_attempt_ms, 1..=600_000, "1..=600000")?;
        validate_range(
            "connect_timeout_secs",
            self.connect_timeout_secs,
            1..=3_600,
            "1..=3600",
        )?;
        if self.min_attempt_ms > self.max_attempt_ms {
            return Err(ConfigError::OutOfRange {
                field: "min_attempt_ms",
                value: self.min_attempt_ms.to_string(),
                expected: "min_attempt_ms <= max_attempt_ms",
            });
        }
        validate_fraction("max_delay_fraction", self.max_delay_fraction)?;
        validate_fraction("attempt_fraction", self.attempt_fraction)?;
        Ok(())
    }

    /// The shared wall-clock budget as a [`Duration`].
    #[must_use]
    pub fn operation_budget(&self) -> Duration {
        Duration::from_millis(self.operation_budget_ms)
    }

    /// The per-provider racing sub-budget as a [`Duration`].
    #[must_use]
    pub fn provider_budget(&self) -> Duration {
        Duration::from_millis(self.provider_budget_ms)
    }

    /// The per-read stall timeout as a [`Duration`].
    #[must_use]
    pub fn per_read_timeout(&self) -> Duration {
        Duration::from_millis(self.per_read_timeout_ms)
    }

    /// The minimum viable attempt duration as a [`Duration`].
    #[must_use]
    pub fn min_attempt(&self) -> Duration {
        Duration::from_millis(self.min_attempt_ms)
    }

    /// The maximum attempt duration as a [`Duration`].
    #[must_use]
    pub fn max_attempt(&self) -> Duration {
        Duration::from_millis(self.max_attempt_ms)
    }
}

fn validate_range(
    field: &'static str,
    value: u64,
    range: std::ops::RangeInclusive<u64>,
    expected: &'static str,
) -> Result<(), ConfigError> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value: value.to_string(),
            expected,
        })
    }
}

fn validate_fraction(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value: value.to_string(),
            expected: "0.0 < fraction <= 1.0",
        })
    }
}
