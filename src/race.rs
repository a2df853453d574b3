//! First-success racing over a set of fallible futures.
//!
//! Used by the racing selection strategy, but deliberately generic: the
//! primitive knows nothing about providers. It polls every task
//! concurrently, returns the first success, and distinguishes "everyone
//! settled with an error" from "the deadline fired with tasks still
//! running". Losing tasks are cancelled by drop the moment a winner or the
//! deadline resolves the race.

use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tracing::debug;

use crate::error::AcquireError;

/// Terminal outcome of one race.
#[derive(Debug)]
pub enum RaceOutcome<T> {
    /// A task succeeded first; the rest were cancelled.
    Winner(T),
    /// Every task settled with an error before the deadline.
    AllFailed {
        /// The error of the last task to settle.
        last_error: AcquireError,
        /// How many tasks settled with an error.
        attempts: u32,
    },
    /// The deadline fired while tasks were still running.
    DeadlineExpired {
        /// How many tasks had already settled with an error.
        attempts: u32,
    },
}

/// Races `tasks` against each other and a deadline, yielding the first
/// success.
///
/// An empty task set resolves immediately as
/// [`RaceOutcome::DeadlineExpired`] with zero attempts.
pub async fn race_first_success<T, Fut>(
    tasks: impl IntoIterator<Item = Fut>,
    deadline: Duration,
) -> RaceOutcome<T>
where
    Fut: std::future::Future<Output = Result<T, AcquireError>>,
{
    let mut pending: FuturesUnordered<Fut> = tasks.into_iter().collect();
    let mut attempts: u32 = 0;
    let mut last_error: Option<AcquireError> = None;

    let timer = tokio::time::sleep(deadline);
    tokio::pin!(timer);

    loop {
        tokio::select! {
            () = &mut timer => {
                debug!(attempts, "race deadline fired with tasks still pending");
                return RaceOutcome::DeadlineExpired { attempts };
            }
            settled = pending.next() => match settled {
                Some(Ok(value)) => {
                    debug!(attempts, "race produced a winner");
                    return RaceOutcome::Winner(value);
                }
                Some(Err(error)) => {
                    attempts += 1;
                    debug!(attempts, error = %error, "race task settled with error");
                    last_error = Some(error);
                }
                None => {
                    return match last_error.take() {
                        Some(last_error) => RaceOutcome::AllFailed { last_error, attempts },
                        None => RaceOutcome::DeadlineExpired { attempts },
                    };
                }
            },
        }
    }
}
