// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Running a list of steps forward and rolling it back
//!
//! Shared by the chain executor and by sub-chains.

use crate::flow::Flow;
use crate::flow::StepContext;
use cirrus_common::api::error::Error;
use futures::FutureExt;
use serde::Deserialize;
use serde::Serialize;
use slog::debug;
use slog::error;
use slog::info;
use slog::warn;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// The step that ended a chain and what it reported
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct StepFailure {
    pub step: String,
    pub cause: Error,
}

/// A rollback action that failed
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct RollbackFailure {
    pub step: String,
    /// the error chain, rendered
    pub message: String,
}

/// Outcome of running steps forward
pub(crate) struct ForwardRun {
    /// number of leading steps whose `run` succeeded
    pub(crate) completed: usize,
    pub(crate) failure: Option<StepFailure>,
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("<non-string panic payload>")
    }
}

/// Runs `steps` in order, each to completion before the next, stopping at
/// the first failure
///
/// Cancellation is checked before each step: once the chain is cancelled,
/// the next step fails with [`Error::Cancelled`] without running.
/// `on_completed` is called with the number of completed steps after each
/// success.
pub(crate) async fn run_forward<F>(
    steps: &[Arc<dyn Flow>],
    sctx: &StepContext,
    on_completed: F,
) -> ForwardRun
where
    F: Fn(usize, Option<&str>) + Send + Sync,
{
    for (index, step) in steps.iter().enumerate() {
        let step_ctx = sctx.for_step(step.name());
        let log = step_ctx.log().clone();

        if step_ctx.is_cancelled() {
            info!(log, "cancelled before step started");
            return ForwardRun {
                completed: index,
                failure: Some(StepFailure {
                    step: step.name().to_owned(),
                    cause: Error::Cancelled,
                }),
            };
        }

        debug!(log, "running step");
        let outcome =
            AssertUnwindSafe(step.run(&step_ctx)).catch_unwind().await;
        let result = outcome.unwrap_or_else(|panic| {
            Err(Error::internal_error(&format!(
                "step panicked: {}",
                panic_message(&*panic)
            )))
        });

        match result {
            Ok(()) => {
                debug!(log, "step succeeded");
                let next = steps.get(index + 1).map(|s| s.name());
                on_completed(index + 1, next);
            }
            Err(cause) => {
                warn!(log, "step failed"; "error" => %cause);
                return ForwardRun {
                    completed: index,
                    failure: Some(StepFailure {
                        step: step.name().to_owned(),
                        cause,
                    }),
                };
            }
        }
    }

    ForwardRun { completed: steps.len(), failure: None }
}

/// Rolls back `steps` in reverse order
///
/// Every step's rollback is attempted even if a later one failed; failures
/// are returned in the order they happened.
pub(crate) async fn roll_back(
    steps: &[Arc<dyn Flow>],
    sctx: &StepContext,
) -> Vec<RollbackFailure> {
    let sctx = sctx.uncancellable();
    let mut failures = Vec::new();
    for step in steps.iter().rev() {
        let step_ctx = sctx.for_step(step.name());
        let log = step_ctx.log().clone();
        debug!(log, "rolling back step");

        let outcome =
            AssertUnwindSafe(step.rollback(&step_ctx)).catch_unwind().await;
        let message = match outcome {
            Ok(Ok(())) => {
                debug!(log, "rolled back step");
                continue;
            }
            Ok(Err(error)) => format!("{:#}", error),
            Err(panic) => {
                format!("rollback panicked: {}", panic_message(&*panic))
            }
        };
        error!(log, "rollback failed"; "error" => %message);
        failures
            .push(RollbackFailure { step: step.name().to_owned(), message });
    }
    failures
}
