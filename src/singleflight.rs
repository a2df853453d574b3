//! Request coalescing for concurrent acquisitions of the same content.
//!
//! When several callers ask for the same key at once, exactly one underlying
//! operation runs; everyone else awaits a shared handle to its result. The
//! in-flight table is scoped to the coordinator instance, not global state,
//! so tests and multiple pipelines never interfere with each other.
//!
//! Cancellation semantics fall out of [`Shared`]: each caller holds one
//! handle, dropping a follower's handle detaches only that follower, and
//! dropping every handle cancels the underlying operation. A drop guard
//! inside the operation future clears the table entry on completion and on
//! cancellation alike, so abandoned keys never leak.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use tracing::debug;

use crate::error::AcquireError;

type SharedResult<T> = Shared<BoxFuture<'static, Result<T, AcquireError>>>;

/// Coalesces concurrent operations on the same key.
///
/// `T` must be `Clone` because every coalesced caller receives the same
/// terminal outcome.
pub struct SingleFlight<T> {
    inflight: Arc<DashMap<String, SharedResult<T>>>,
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates an empty coordinator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(DashMap::new()),
        }
    }

    /// Runs `op` under single-flight semantics for `key`.
    ///
    /// If an operation for `key` is already in flight, this call joins it
    /// instead of invoking `op`, and `op` is never constructed into a
    /// running future.
    ///
    /// # Errors
    ///
    /// Returns the leader operation's error; coalesced followers all observe
    /// the same one.
    pub async fn run<F, Fut>(&self, key: &str, op: F) -> Result<T, AcquireError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, AcquireError>> + Send + 'static,
    {
        let shared = match self.inflight.entry(key.to_string()) {
            Entry::Occupied(existing) => {
                debug!(key, "joining in-flight operation");
                existing.get().clone()
            }
            Entry::Vacant(slot) => {
                debug!(key, "starting new in-flight operation");
                let guard = ClearOnDrop {
                    inflight: Arc::clone(&self.inflight),
                    key: key.to_string(),
                };
                let future = op();
                let shared = async move {
                    let _guard = guard;
                    future.await
                }
                .boxed()
                .shared();
                slot.insert(shared.clone());
                shared
            }
        };

        shared.await
    }

    /// The number of keys currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }
}

impl<T> Default for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for SingleFlight<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight")
            .field("in_flight", &self.inflight.len())
            .finish()
    }
}

/// Removes the key when the leader future completes or is cancelled.
struct ClearOnDrop<T> {
    inflight: Arc<DashMap<String, SharedResult<T>>>,
    key: String,
}

impl<T> Drop for ClearOnDrop<T> {
    fn drop(&mut self) {
        self.inflight.remove(&self.key);
        debug!(key = %self.key, "cleared in-flight entry");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_run_executes_operation() {
        let coordinator: SingleFlight<u32> = SingleFlight::new();
        let result = coordinator.run("key", || async { Ok(7) }).await.unwrap();
        assert_eq!(result, 7);
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_execution() {
        let coordinator: Arc<SingleFlight<u32>> = Arc::new(SingleFlight::new());
        let executions = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coordinator = Arc::clone(&coordinator);
            let executions = Arc::clone(&executions);
            handles.push(tokio::spawn(async move {
                coordinator
                    .run("vid", move || async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        // Hold the operation open so every caller coalesces.
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(99)
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 99);
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_followers_observe_leader_error() {
        let coordinator: Arc<SingleFlight<u32>> = Arc::new(SingleFlight::new());

        let leader = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .run("vid", || async {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Err(AcquireError::no_formats("piped"))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let follower = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .run("vid", || async { Ok(1) })
                    .await
            })
        };

        let leader_result = leader.await.unwrap();
        let follower_result = follower.await.unwrap();
        assert!(matches!(
            leader_result,
            Err(AcquireError::NoFormatsAvailable { .. })
        ));
        assert_eq!(leader_result, follower_result);
    }

    #[tokio::test]
    async fn test_sequential_runs_execute_independently() {
        let coordinator: SingleFlight<u32> = SingleFlight::new();
        let executions = AtomicU32::new(0);

        for _ in 0..3 {
            let result = coordinator
                .run("vid", || {
                    executions.fetch_add(1, Ordering::SeqCst);
                    async { Ok(1) }
                })
                .await
                .unwrap();
            assert_eq!(result, 1);
        }
        assert_eq!(executions.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_coalesce() {
        let coordinator: Arc<SingleFlight<u32>> = Arc::new(SingleFlight::new());
        let executions = Arc::new(AtomicU32::new(0));

        let tasks: Vec<_> = ["a", "b"]
            .iter()
            .map(|key| {
                let coordinator = Arc::clone(&coordinator);
                let executions = Arc::clone(&executions);
                tokio::spawn(async move {
                    coordinator
                        .run(key, move || async move {
                            executions.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(30)).await;
                            Ok(0)
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(executions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancelled_operation_clears_entry() {
        let coordinator: Arc<SingleFlight<u32>> = Arc::new(SingleFlight::new());

        let task = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .run("vid", || async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(0)
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(coordinator.in_flight(), 1);
        task.abort();
        let _ = task.await;

        // The drop guard must have cleared the abandoned key.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(coordinator.in_flight(), 0);
    }
}
