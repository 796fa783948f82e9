// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Facilities for polling for a condition to become true
//!
//! Background work in the orchestration core (event delivery, mailbox
//! dispatch) completes asynchronously with respect to the caller, so tests
//! that want to observe its effects poll for them with a bounded timeout.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Result of one attempt to check a condition (see [`wait_for_condition`])
#[derive(Debug, thiserror::Error)]
pub enum CondCheckError<E: std::error::Error + Send + Sync + 'static> {
    /// the condition we're waiting for is not true
    #[error("poll condition not yet ready")]
    NotYet,
    /// stop polling because we've encountered a non-retryable error
    #[error("non-retryable error while polling on condition")]
    Failed(#[from] E),
}

/// Result of [`wait_for_condition`]
#[derive(Debug, thiserror::Error)]
pub enum Error<E: std::error::Error + Send + Sync + 'static> {
    /// operation timed out before succeeding or failing permanently
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("non-retryable error while polling on condition")]
    PermanentError(#[source] E),
}

/// Poll the given closure until it succeeds, returns a permanent error, or
/// a given time has expired
///
/// `cond` is invoked every `poll_interval` until `poll_max` has elapsed.  It
/// returns `Ok(T)` when the condition holds, `Err(CondCheckError::NotYet)`
/// to keep polling, or `Err(CondCheckError::Failed(E))` to stop polling with
/// an error.
pub async fn wait_for_condition<O, E, Func, Fut>(
    mut cond: Func,
    poll_interval: &Duration,
    poll_max: &Duration,
) -> Result<O, Error<E>>
where
    Func: FnMut() -> Fut,
    Fut: Future<Output = Result<O, CondCheckError<E>>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let poll_start = Instant::now();
    loop {
        let duration = Instant::now().duration_since(poll_start);
        if duration > *poll_max {
            return Err(Error::TimedOut(duration));
        }

        match cond().await {
            Ok(result) => return Ok(result),
            Err(CondCheckError::Failed(e)) => {
                return Err(Error::PermanentError(e))
            }
            Err(CondCheckError::NotYet) => (),
        }

        tokio::time::sleep(*poll_interval).await;
    }
}
