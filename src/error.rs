//! Shared error taxonomy for the acquisition pipeline.
//!
//! All components report into one [`AcquireError`] enum so retry policy,
//! single-flight result sharing, and caller-facing diagnostics stay
//! consistent across providers, transfers, and the cache.
//!
//! The enum is `Clone`: every payload is an owned string or integer, never a
//! live `reqwest::Error` or `std::io::Error`. Single-flight waiters all
//! receive the same terminal outcome, which requires cloning the error to
//! each of them; underlying errors are stringified at the boundary where
//! they occur.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while acquiring and caching an audio asset.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AcquireError {
    /// Network or HTTP failure reaching an extraction provider.
    #[error("provider {provider} unavailable: {reason}")]
    ProviderUnavailable {
        /// Name of the provider that failed.
        provider: String,
        /// Human-readable failure description.
        reason: String,
        /// Server-mandated wait before retrying, when the provider sent one.
        retry_after: Option<Duration>,
    },

    /// Provider responded but the payload could not be parsed.
    #[error("provider {provider} returned a malformed response: {reason}")]
    ProviderMalformedResponse {
        /// Name of the provider.
        provider: String,
        /// Parse failure description.
        reason: String,
    },

    /// Provider succeeded but offered no usable audio format.
    #[error("provider {provider} offered no usable audio formats")]
    NoFormatsAvailable {
        /// Name of the provider.
        provider: String,
    },

    /// No registered provider can serve the request.
    #[error("no provider available for {locator}")]
    NoProviderAvailable {
        /// The source locator that nothing could handle.
        locator: String,
    },

    /// The source locator could not be normalized into a video id.
    #[error("invalid source locator: {locator}")]
    InvalidLocator {
        /// The unparseable locator string.
        locator: String,
    },

    /// Every provider was tried and none produced a usable result.
    #[error("all providers exhausted for {content_id} after {attempts} attempt(s): {last_error}")]
    AllProvidersExhausted {
        /// Content id the acquisition was for.
        content_id: String,
        /// Total provider attempts made.
        attempts: u32,
        /// Stringified error from the last provider to settle.
        last_error: String,
    },

    /// The content exceeds the configured size ceiling.
    #[error("content at {url} exceeds size ceiling: {observed_bytes} > {max_bytes} bytes")]
    ContentTooLarge {
        /// Source URL of the oversized content.
        url: String,
        /// Bytes observed (declared or streamed) before aborting.
        observed_bytes: u64,
        /// The configured ceiling.
        max_bytes: u64,
    },

    /// A single read from the transfer stream took too long.
    #[error("transfer from {url} stalled: no data within {timeout_ms}ms")]
    TransferStalled {
        /// Source URL of the stalled stream.
        url: String,
        /// The per-read timeout that fired.
        timeout_ms: u64,
    },

    /// Generic transfer or storage-API failure.
    #[error("transfer failed for {url}: {reason}")]
    TransferFailed {
        /// Source URL or storage path involved.
        url: String,
        /// Failure description.
        reason: String,
    },

    /// The shared wall-clock operation budget ran out.
    #[error("operation budget exceeded: {elapsed_ms}ms elapsed of {budget_ms}ms budget")]
    BudgetExceeded {
        /// Configured budget in milliseconds.
        budget_ms: u64,
        /// Wall-clock time spent when the budget check failed.
        elapsed_ms: u64,
    },

    /// Metadata cache read or write failed.
    #[error("cache failure: {reason}")]
    CacheFailure {
        /// Underlying database failure description.
        reason: String,
    },
}

impl AcquireError {
    /// Creates a provider-unavailable error without a Retry-After hint.
    pub fn provider_unavailable(provider: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ProviderUnavailable {
            provider: provider.into(),
            reason: reason.into(),
            retry_after: None,
        }
    }

    /// Creates a provider-unavailable error carrying a server-mandated delay.
    pub fn provider_unavailable_with_retry_after(
        provider: impl Into<String>,
        reason: impl Into<String>,
        retry_after: Option<Duration>,
    ) -> Self {
        Self::ProviderUnavailable {
            provider: provider.into(),
            reason: reason.into(),
            retry_after,
        }
    }

    /// Creates a malformed-response error.
    pub fn malformed(provider: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ProviderMalformedResponse {
            provider: provider.into(),
            reason: reason.into(),
        }
    }

    /// Creates a no-formats error.
    pub fn no_formats(provider: impl Into<String>) -> Self {
        Self::NoFormatsAvailable {
            provider: provider.into(),
        }
    }

    /// Creates an invalid-locator error.
    pub fn invalid_locator(locator: impl Into<String>) -> Self {
        Self::InvalidLocator {
            locator: locator.into(),
        }
    }

    /// Creates a content-too-large error.
    pub fn too_large(url: impl Into<String>, observed_bytes: u64, max_bytes: u64) -> Self {
        Self::ContentTooLarge {
            url: url.into(),
            observed_bytes,
            max_bytes,
        }
    }

    /// Creates a transfer-stalled error.
    pub fn stalled(url: impl Into<String>, timeout: Duration) -> Self {
        Self::TransferStalled {
            url: url.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Creates a generic transfer failure.
    pub fn transfer_failed(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TransferFailed {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Creates a budget-exceeded error.
    pub fn budget_exceeded(budget: Duration, elapsed: Duration) -> Self {
        Self::BudgetExceeded {
            budget_ms: budget.as_millis() as u64,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    /// Creates a cache failure from any database-layer error.
    pub fn cache(reason: impl Into<String>) -> Self {
        Self::CacheFailure {
            reason: reason.into(),
        }
    }

    /// Returns the Retry-After hint, when the error carries one.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::ProviderUnavailable { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Classification of failures for retry decisions.
///
/// Only `Network` and `Stall` are retryable; the stall class seeds a larger
/// backoff base because a stalled upstream typically needs longer to recover
/// than a transient connection error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Transient network/HTTP failure; retry with the small backoff base.
    Network,
    /// Timeout-class failure (stalled read); retry with the large backoff base.
    Stall,
    /// Retrying cannot help; propagate immediately.
    Fatal,
}

impl FailureClass {
    /// Returns true for classes the retry layer is allowed to retry.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Network | Self::Stall)
    }
}

/// Classifies an error for the retry layer.
///
/// Per the propagation policy, only `ProviderUnavailable` and
/// `TransferStalled` are retryable; malformed responses, oversized content,
/// and exhausted budgets propagate immediately.
#[must_use]
pub fn classify(error: &AcquireError) -> FailureClass {
    match error {
        AcquireError::ProviderUnavailable { .. } => FailureClass::Network,
        AcquireError::TransferStalled { .. } => FailureClass::Stall,
        _ => FailureClass::Fatal,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_unavailable_display() {
        let error = AcquireError::provider_unavailable("piped", "connection refused");
        let msg = error.to_string();
        assert!(msg.contains("piped"), "Expected provider name in: {msg}");
        assert!(msg.contains("connection refused"), "Expected reason in: {msg}");
    }

    #[test]
    fn test_too_large_display_includes_sizes() {
        let error = AcquireError::too_large("https://example.com/a.m4a", 51, 50);
        let msg = error.to_string();
        assert!(msg.contains("51"), "Expected observed bytes in: {msg}");
        assert!(msg.contains("50"), "Expected ceiling in: {msg}");
    }

    #[test]
    fn test_budget_exceeded_display() {
        let error =
            AcquireError::budget_exceeded(Duration::from_millis(500), Duration::from_millis(512));
        let msg = error.to_string();
        assert!(msg.contains("500"), "Expected budget in: {msg}");
        assert!(msg.contains("512"), "Expected elapsed in: {msg}");
    }

    #[test]
    fn test_retry_after_only_on_provider_unavailable() {
        let hint = Some(Duration::from_secs(3));
        let error =
            AcquireError::provider_unavailable_with_retry_after("cobalt", "rate limited", hint);
        assert_eq!(error.retry_after(), hint);

        let error = AcquireError::stalled("https://example.com", Duration::from_secs(1));
        assert_eq!(error.retry_after(), None);
    }

    #[test]
    fn test_classify_provider_unavailable_is_retryable_network() {
        let error = AcquireError::provider_unavailable("invidious", "HTTP 503");
        assert_eq!(classify(&error), FailureClass::Network);
        assert!(classify(&error).is_retryable());
    }

    #[test]
    fn test_classify_stall_is_retryable_stall_class() {
        let error = AcquireError::stalled("https://example.com", Duration::from_secs(8));
        assert_eq!(classify(&error), FailureClass::Stall);
        assert!(classify(&error).is_retryable());
    }

    #[test]
    fn test_classify_malformed_is_fatal() {
        let error = AcquireError::malformed("piped", "missing audioStreams");
        assert_eq!(classify(&error), FailureClass::Fatal);
        assert!(!classify(&error).is_retryable());
    }

    #[test]
    fn test_classify_too_large_is_fatal() {
        let error = AcquireError::too_large("https://example.com", 100, 50);
        assert_eq!(classify(&error), FailureClass::Fatal);
    }

    #[test]
    fn test_classify_budget_exceeded_is_fatal() {
        let error = AcquireError::budget_exceeded(
            Duration::from_millis(100),
            Duration::from_millis(101),
        );
        assert_eq!(classify(&error), FailureClass::Fatal);
    }

    #[test]
    fn test_errors_are_cloneable_and_comparable() {
        let error = AcquireError::no_formats("cobalt");
        let cloned = error.clone();
        assert_eq!(error, cloned);
    }
}
