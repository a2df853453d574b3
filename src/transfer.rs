//! Streaming transfer from a provider URL into durable storage.
//!
//! The engine enforces three independent limits while copying: a byte
//! ceiling (checked against the declared size up front and the running
//! total while streaming), a per-read stall timeout, and the caller's
//! overall deadline. Body bytes are gathered chunk-by-chunk and assembled
//! into exactly one final-size buffer before the storage write, so peak
//! memory tracks the object size instead of growing through repeated
//! reallocation.

use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::Client;
use tracing::{debug, instrument, warn};

use crate::config::AcquireConfig;
use crate::error::AcquireError;
use crate::provider::build_provider_http_client;
use crate::storage::StorageTarget;

/// Result of a completed transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Location reported by the storage commit.
    pub stored_location: String,
    /// Total bytes stored.
    pub byte_size: u64,
}

/// Streams provider URLs into a [`StorageTarget`] under size and time
/// limits.
#[derive(Debug, Clone)]
pub struct TransferEngine {
    client: Client,
    max_bytes: u64,
    read_timeout: Duration,
    preflight: bool,
}

impl TransferEngine {
    /// Builds an engine from pipeline configuration.
    ///
    /// # Errors
    ///
    /// Returns [`AcquireError::ProviderUnavailable`] if HTTP client
    /// construction fails.
    pub fn new(config: &AcquireConfig) -> Result<Self, AcquireError> {
        Ok(Self {
            client: build_provider_http_client("transfer", config.connect_timeout_secs)?,
            max_bytes: config.max_object_bytes,
            read_timeout: config.per_read_timeout(),
            preflight: config.preflight_size_check,
        })
    }

    /// Copies `source_url` into storage under `object_path`.
    ///
    /// `deadline` bounds the whole transfer; the per-read stall timeout
    /// bounds each individual read within it.
    ///
    /// # Errors
    ///
    /// Returns [`AcquireError::ContentTooLarge`] when the declared or
    /// streamed size passes the ceiling, [`AcquireError::TransferStalled`]
    /// when a read produces no data in time, [`AcquireError::BudgetExceeded`]
    /// when the deadline runs out, and [`AcquireError::TransferFailed`] for
    /// other network or storage failures. Failed transfers abort their
    /// staged write before returning.
    #[instrument(skip(self, storage))]
    pub async fn transfer(
        &self,
        source_url: &str,
        storage: &dyn StorageTarget,
        object_path: &str,
        content_type: &str,
        deadline: Duration,
    ) -> Result<TransferOutcome, AcquireError> {
        let started = Instant::now();

        if self.preflight {
            self.preflight_size(source_url, remaining(deadline, started)?)
                .await?;
        }

        let response = self
            .read_bounded(
                self.client.get(source_url).send(),
                source_url,
                deadline,
                started,
            )
            .await?
            .map_err(|e| AcquireError::transfer_failed(source_url, e.to_string()))?;

        if !response.status().is_success() {
            return Err(AcquireError::transfer_failed(
                source_url,
                format!("HTTP {}", response.status().as_u16()),
            ));
        }

        let mut handle = storage
            .begin_resumable_write(object_path, content_type)
            .await?;

        let mut stream = response.bytes_stream();
        let mut chunks: Vec<Bytes> = Vec::new();
        let mut total: u64 = 0;

        loop {
            let next = match self
                .read_bounded(stream.next(), source_url, deadline, started)
                .await
            {
                Ok(next) => next,
                Err(error) => {
                    abort_quietly(handle, object_path).await;
                    return Err(error);
                }
            };

            let chunk = match next {
                Some(Ok(chunk)) => chunk,
                Some(Err(error)) => {
                    abort_quietly(handle, object_path).await;
                    return Err(AcquireError::transfer_failed(source_url, error.to_string()));
                }
                None => break,
            };

            total += chunk.len() as u64;
            if total > self.max_bytes {
                warn!(total, max_bytes = self.max_bytes, "size ceiling passed mid-stream");
                abort_quietly(handle, object_path).await;
                return Err(AcquireError::too_large(source_url, total, self.max_bytes));
            }
            chunks.push(chunk);
        }

        // One allocation sized to the finished object.
        #[allow(clippy::cast_possible_truncation)]
        let mut body = Vec::with_capacity(total as usize);
        for chunk in &chunks {
            body.extend_from_slice(chunk);
        }
        drop(chunks);

        let byte_size = match handle.write(&body).await {
            Ok(written) => written,
            Err(error) => {
                abort_quietly(handle, object_path).await;
                return Err(error);
            }
        };
        let stored_location = handle.commit().await?;

        debug!(
            byte_size,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "transfer committed"
        );
        Ok(TransferOutcome {
            stored_location,
            byte_size,
        })
    }

    /// Rejects transfers whose declared size already passes the ceiling.
    ///
    /// Best-effort: upstreams that reject HEAD or omit Content-Length fall
    /// through to the streaming check.
    async fn preflight_size(
        &self,
        source_url: &str,
        remaining: Duration,
    ) -> Result<(), AcquireError> {
        let probe = self
            .client
            .head(source_url)
            .timeout(self.read_timeout.min(remaining))
            .send()
            .await;

        match probe {
            Ok(response) if response.status().is_success() => {
                if let Some(declared) = response.content_length() {
                    if declared > self.max_bytes {
                        return Err(AcquireError::too_large(
                            source_url,
                            declared,
                            self.max_bytes,
                        ));
                    }
                    debug!(declared, "declared size within ceiling");
                }
                Ok(())
            }
            Ok(response) => {
                debug!(status = response.status().as_u16(), "HEAD probe rejected, skipping");
                Ok(())
            }
            Err(error) => {
                debug!(%error, "HEAD probe failed, skipping");
                Ok(())
            }
        }
    }

    /// Awaits one transfer step under the stall timeout and the deadline.
    ///
    /// Whichever limit is tighter decides the error: the deadline maps to
    /// budget exhaustion, the stall timeout to a stalled transfer.
    async fn read_bounded<F, T>(
        &self,
        step: F,
        source_url: &str,
        deadline: Duration,
        started: Instant,
    ) -> Result<T, AcquireError>
    where
        F: std::future::Future<Output = T>,
    {
        let left = remaining(deadline, started)?;
        let bound = self.read_timeout.min(left);

        match tokio::time::timeout(bound, step).await {
            Ok(value) => Ok(value),
            Err(_) if left < self.read_timeout => {
                Err(AcquireError::budget_exceeded(deadline, started.elapsed()))
            }
            Err(_) => Err(AcquireError::stalled(source_url, self.read_timeout)),
        }
    }
}

/// Time left before `deadline`, as an error once it has passed.
fn remaining(deadline: Duration, started: Instant) -> Result<Duration, AcquireError> {
    let left = deadline.saturating_sub(started.elapsed());
    if left.is_zero() {
        Err(AcquireError::budget_exceeded(deadline, started.elapsed()))
    } else {
        Ok(left)
    }
}

/// Aborts a staged write, demoting cleanup failures to a warning.
async fn abort_quietly(handle: Box<dyn crate::storage::WriteHandle>, object_path: &str) {
    if let Err(error) = handle.abort().await {
        warn!(object_path, %error, "staged write abort failed");
    }
}
