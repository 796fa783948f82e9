// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Execution of flow chains
//!
//! The lifecycle of a chain instance is:
//!
//! ```text
//!      FlowChain + initial FlowContext
//!           |
//!           |  [`ChainExecutor::prepare()`]
//!           v
//!      RunnableChain
//!           |
//!           |  [`RunnableChain::start()`]
//!           v
//!      RunningChain  ---- [`ChainCancelHandle::cancel()`]
//!           |
//!           |  [`RunningChain::wait_until_stopped()`]
//!           v
//!      StoppedChain
//! ```
//!
//! [`StoppedChain::into_result()`] yields the final context of a successful
//! chain or a [`ChainError`] describing the failure.  Callers that just want
//! to run a chain to completion use [`ChainExecutor::execute()`].  Callers
//! that want to kick a chain off without waiting can stop after
//! [`RunnableChain::start()`]: the chain keeps running on its own task.

use crate::chain::ChainBuildError;
use crate::chain::ChainState;
use crate::chain::FlowChain;
use crate::context::FlowContext;
use crate::flow::StepContext;
use crate::steps::roll_back;
use crate::steps::run_forward;
use crate::steps::RollbackFailure;
use crate::steps::StepFailure;
use chrono::DateTime;
use chrono::Utc;
use cirrus_common::api::error::Error;
use cirrus_common::api::error::ResourceType;
use cirrus_uuid_kinds::ChainUuid;
use serde::Deserialize;
use serde::Serialize;
use slog::error;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Executor configuration (the `[flow]` table of the orchestrator config)
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutorConfig {
    /// how many finished chains stay visible through
    /// [`ChainExecutor::chain_get`] and [`ChainExecutor::chain_list`]
    pub retain_finished_chains: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig { retain_finished_chains: 128 }
    }
}

/// Why a chain did not succeed
#[derive(Clone, Debug, thiserror::Error)]
pub enum ChainError {
    #[error(
        "flow chain {chain_name:?} ({chain_id}) failed at step {:?}: {}",
        .failure.step,
        .failure.cause
    )]
    StepFailure {
        chain_id: ChainUuid,
        chain_name: String,
        failure: StepFailure,
        rollback_failures: Vec<RollbackFailure>,
    },
    #[error(transparent)]
    Build(#[from] ChainBuildError),
}

impl From<ChainError> for Error {
    fn from(error: ChainError) -> Self {
        match error {
            ChainError::StepFailure { failure, .. } => Error::StepFailure {
                step: failure.step,
                cause: Box::new(failure.cause),
            },
            ChainError::Build(error) => {
                Error::internal_error(&error.to_string())
            }
        }
    }
}

impl From<ChainBuildError> for Error {
    fn from(error: ChainBuildError) -> Self {
        Error::internal_error(&error.to_string())
    }
}

/// Point-in-time status of a chain instance, as seen by the executor
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ChainStatus {
    pub id: ChainUuid,
    pub name: String,
    pub state: ChainState,
    /// index of the last step whose forward action succeeded
    pub executed_index: Option<usize>,
    /// step being run, if the chain is running
    pub current_step: Option<String>,
    pub time_created: DateTime<Utc>,
    pub time_done: Option<DateTime<Utc>>,
}

/// Terminal report of a chain instance
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ChainReport {
    pub chain_id: ChainUuid,
    pub chain_name: String,
    pub state: ChainState,
    pub executed_index: Option<usize>,
    pub failure: Option<StepFailure>,
    /// diagnostics only: these never replace `failure`
    pub rollback_failures: Vec<RollbackFailure>,
    pub context: FlowContext,
}

#[derive(Default)]
struct RegistryInner {
    chains: BTreeMap<ChainUuid, ChainStatus>,
    finished: VecDeque<ChainUuid>,
}

/// The executor's view of every chain it has prepared
struct ChainRegistry {
    retain_finished: usize,
    inner: Mutex<RegistryInner>,
}

impl ChainRegistry {
    fn insert(&self, status: ChainStatus) {
        self.inner.lock().unwrap().chains.insert(status.id, status);
    }

    fn update<F: FnOnce(&mut ChainStatus)>(&self, id: ChainUuid, f: F) {
        if let Some(status) = self.inner.lock().unwrap().chains.get_mut(&id) {
            f(status);
        }
    }

    /// Forgets a chain that was prepared but never started.
    fn discard(&self, id: ChainUuid) {
        let mut inner = self.inner.lock().unwrap();
        if inner
            .chains
            .get(&id)
            .is_some_and(|status| status.state == ChainState::Pending)
        {
            inner.chains.remove(&id);
        }
    }

    fn finish(&self, id: ChainUuid, state: ChainState) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(status) = inner.chains.get_mut(&id) {
            status.state = state;
            status.current_step = None;
            status.time_done = Some(Utc::now());
        }
        inner.finished.push_back(id);
        while inner.finished.len() > self.retain_finished {
            if let Some(oldest) = inner.finished.pop_front() {
                inner.chains.remove(&oldest);
            }
        }
    }
}

/// Prepares, runs and keeps track of flow chains
///
/// Cloning yields another handle to the same executor.
#[derive(Clone)]
pub struct ChainExecutor {
    log: Logger,
    registry: Arc<ChainRegistry>,
}

impl ChainExecutor {
    pub fn new(log: &Logger, config: &ExecutorConfig) -> ChainExecutor {
        ChainExecutor {
            log: log.new(o!("component" => "ChainExecutor")),
            registry: Arc::new(ChainRegistry {
                retain_finished: config.retain_finished_chains,
                inner: Mutex::new(RegistryInner::default()),
            }),
        }
    }

    /// Sets up a chain instance without starting it
    pub fn prepare(
        &self,
        chain: FlowChain,
        context: FlowContext,
    ) -> RunnableChain {
        let id = ChainUuid::new_v4();
        let log = self.log.new(o!(
            "chain_name" => chain.name().to_owned(),
            "chain_id" => id.to_string(),
        ));
        info!(log, "preparing chain"; "steps" => ?chain.step_names());
        self.registry.insert(ChainStatus {
            id,
            name: chain.name().to_owned(),
            state: ChainState::Pending,
            executed_index: None,
            current_step: None,
            time_created: Utc::now(),
            time_done: None,
        });
        RunnableChain {
            id,
            chain,
            context,
            log,
            cancel: CancellationToken::new(),
            registry: Arc::clone(&self.registry),
            unstarted: Unstarted {
                id,
                registry: Arc::clone(&self.registry),
                started: false,
            },
        }
    }

    /// Runs `chain` to completion and returns its final context
    pub async fn execute(
        &self,
        chain: FlowChain,
        context: FlowContext,
    ) -> Result<FlowContext, ChainError> {
        self.prepare(chain, context)
            .start()
            .wait_until_stopped()
            .await
            .into_result()
    }

    /// Status of every chain the executor knows about, live ones and the
    /// most recently finished ones, ordered by id
    pub fn chain_list(&self) -> Vec<ChainStatus> {
        self.registry.inner.lock().unwrap().chains.values().cloned().collect()
    }

    pub fn chain_get(&self, id: ChainUuid) -> Result<ChainStatus, Error> {
        self.registry
            .inner
            .lock()
            .unwrap()
            .chains
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(ResourceType::Chain, id))
    }

    /// Ids of chains that have not reached a terminal state
    ///
    /// Any reservation held by a chain outside this set is orphaned.
    pub fn live_chain_ids(&self) -> BTreeSet<ChainUuid> {
        self.registry
            .inner
            .lock()
            .unwrap()
            .chains
            .values()
            .filter(|status| !status.state.is_terminal())
            .map(|status| status.id)
            .collect()
    }
}

/// A chain instance that has been prepared but not started
///
/// Dropping it discards the chain without running anything, and the
/// executor forgets it.
pub struct RunnableChain {
    id: ChainUuid,
    chain: FlowChain,
    context: FlowContext,
    log: Logger,
    cancel: CancellationToken,
    registry: Arc<ChainRegistry>,
    unstarted: Unstarted,
}

/// Removes a prepared chain from the registry unless it gets started
struct Unstarted {
    id: ChainUuid,
    registry: Arc<ChainRegistry>,
    started: bool,
}

impl Drop for Unstarted {
    fn drop(&mut self) {
        if !self.started {
            self.registry.discard(self.id);
        }
    }
}

impl RunnableChain {
    pub fn id(&self) -> ChainUuid {
        self.id
    }

    pub fn cancel_handle(&self) -> ChainCancelHandle {
        ChainCancelHandle { cancel: self.cancel.clone() }
    }

    /// Starts the chain on its own task.  Must be called from within a
    /// tokio runtime.
    pub fn start(self) -> RunningChain {
        info!(self.log, "starting chain");
        let RunnableChain {
            id,
            chain,
            context,
            log,
            cancel,
            registry,
            mut unstarted,
        } = self;
        unstarted.started = true;
        let sctx = StepContext::new(
            id,
            chain.name(),
            log.clone(),
            cancel.clone(),
            context,
        );
        let task = tokio::spawn(drive(chain, sctx, registry.clone()));
        RunningChain {
            id,
            log,
            cancel: ChainCancelHandle { cancel },
            task,
            registry,
        }
    }
}

/// Requests cooperative cancellation of a running chain
#[derive(Clone, Debug)]
pub struct ChainCancelHandle {
    cancel: CancellationToken,
}

impl ChainCancelHandle {
    /// The running step observes the request at its next cancellation
    /// point; later steps don't run and the chain rolls back.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A chain instance that is running
pub struct RunningChain {
    id: ChainUuid,
    log: Logger,
    cancel: ChainCancelHandle,
    task: JoinHandle<ChainReport>,
    registry: Arc<ChainRegistry>,
}

impl RunningChain {
    pub fn id(&self) -> ChainUuid {
        self.id
    }

    pub fn cancel_handle(&self) -> ChainCancelHandle {
        self.cancel.clone()
    }

    pub async fn wait_until_stopped(self) -> StoppedChain {
        let report = match self.task.await {
            Ok(report) => report,
            Err(join_error) => {
                // Step panics are caught inside the task, so this means the
                // executor itself broke.  Nothing is known about how far the
                // chain got.
                error!(self.log, "chain task failed"; "error" => %join_error);
                let status = self
                    .registry
                    .inner
                    .lock()
                    .unwrap()
                    .chains
                    .get(&self.id)
                    .cloned();
                self.registry.finish(self.id, ChainState::Failed);
                ChainReport {
                    chain_id: self.id,
                    chain_name: status
                        .as_ref()
                        .map(|s| s.name.clone())
                        .unwrap_or_default(),
                    state: ChainState::Failed,
                    executed_index: status.and_then(|s| s.executed_index),
                    failure: Some(StepFailure {
                        step: String::new(),
                        cause: Error::internal_error(&format!(
                            "chain task failed: {}",
                            join_error
                        )),
                    }),
                    rollback_failures: Vec::new(),
                    context: FlowContext::new(),
                }
            }
        };
        info!(self.log, "chain stopped"; "state" => %report.state);
        StoppedChain { report }
    }
}

/// A chain instance that has stopped
#[derive(Debug)]
pub struct StoppedChain {
    report: ChainReport,
}

impl StoppedChain {
    pub fn report(&self) -> &ChainReport {
        &self.report
    }

    pub fn into_report(self) -> ChainReport {
        self.report
    }

    /// Returns the final context if the chain succeeded
    pub fn into_result(self) -> Result<FlowContext, ChainError> {
        let report = self.report;
        match report.failure {
            None => Ok(report.context),
            Some(failure) => Err(ChainError::StepFailure {
                chain_id: report.chain_id,
                chain_name: report.chain_name,
                failure,
                rollback_failures: report.rollback_failures,
            }),
        }
    }
}

/// Runs a chain forward and, if a step fails, rolls back the steps that
/// completed
async fn drive(
    chain: FlowChain,
    sctx: StepContext,
    registry: Arc<ChainRegistry>,
) -> ChainReport {
    let id = sctx.chain_id();
    let log = sctx.log().clone();
    let steps = chain.steps();

    registry.update(id, |status| {
        status.state = ChainState::Running;
        status.current_step = steps.first().map(|s| s.name().to_owned());
    });

    let forward = run_forward(steps, &sctx, |completed, next| {
        registry.update(id, |status| {
            status.executed_index = Some(completed - 1);
            status.current_step = next.map(str::to_owned);
        });
    })
    .await;

    let executed_index = forward.completed.checked_sub(1);
    let (state, rollback_failures) = match &forward.failure {
        None => {
            info!(log, "chain succeeded");
            (ChainState::Succeeded, Vec::new())
        }
        Some(failure) => {
            warn!(log, "chain failed; rolling back";
                "failed_step" => &failure.step,
                "error" => %failure.cause,
                "steps_to_roll_back" => forward.completed,
            );
            registry.update(id, |status| {
                status.state = ChainState::RollingBack;
                status.current_step = None;
            });
            let rollback_failures =
                roll_back(&steps[..forward.completed], &sctx).await;
            if !rollback_failures.is_empty() {
                error!(log, "rollback incomplete";
                    "rollback_failures" => rollback_failures.len());
            }
            (ChainState::Failed, rollback_failures)
        }
    };

    registry.finish(id, state);
    ChainReport {
        chain_id: id,
        chain_name: chain.name().to_owned(),
        state,
        executed_index,
        failure: forward.failure,
        rollback_failures,
        context: sctx.snapshot(),
    }
}

#[cfg(test)]
mod test {
    use super::ChainError;
    use super::ChainExecutor;
    use super::ExecutorConfig;
    use crate::chain::ChainState;
    use crate::chain::FlowChain;
    use crate::context::FlowContext;
    use crate::flow::FlowFunc;
    use crate::test_util::journaled_step;
    use crate::test_util::Journal;
    use assert_matches::assert_matches;
    use cirrus_common::api::error::Error;
    use cirrus_test_utils::dev::test_setup_log;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_chain_succeeds() {
        let logctx = test_setup_log("test_chain_succeeds");
        let executor =
            ChainExecutor::new(&logctx.log, &ExecutorConfig::default());
        let journal = Journal::default();
        let chain = FlowChain::build(
            "three-steps",
            vec![
                journaled_step(&journal, "a", None),
                journaled_step(&journal, "b", None),
                journaled_step(&journal, "c", None),
            ],
        )
        .unwrap();

        let initial = FlowContext::new().with("input", &7u32).unwrap();
        let stopped =
            executor.prepare(chain, initial).start().wait_until_stopped().await;
        let report = stopped.report().clone();
        assert_eq!(report.state, ChainState::Succeeded);
        assert_eq!(report.executed_index, Some(2));
        assert_eq!(report.failure, None);
        assert_eq!(journal.entries(), ["run a", "run b", "run c"]);

        let context = stopped.into_result().unwrap();
        assert_eq!(context.lookup::<u32>("input").unwrap(), 7);
        assert!(context.lookup::<bool>("c").unwrap());
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_failure_rolls_back_completed_steps_in_reverse() {
        let logctx = test_setup_log(
            "test_failure_rolls_back_completed_steps_in_reverse",
        );
        let executor =
            ChainExecutor::new(&logctx.log, &ExecutorConfig::default());
        let names = ["s1", "s2", "s3", "s4", "s5"];

        for k in 0..names.len() {
            let journal = Journal::default();
            let steps = names
                .iter()
                .enumerate()
                .map(|(i, name)| {
                    let fail = (i == k).then(|| Error::handler("boom"));
                    journaled_step(&journal, name, fail)
                })
                .collect();
            let chain = FlowChain::build("failing", steps).unwrap();
            let report = executor
                .prepare(chain, FlowContext::new())
                .start()
                .wait_until_stopped()
                .await
                .into_report();

            assert_eq!(report.state, ChainState::Failed);
            assert_eq!(report.executed_index, k.checked_sub(1));
            let failure = report.failure.unwrap();
            assert_eq!(failure.step, names[k]);
            assert_eq!(failure.cause, Error::handler("boom"));

            let mut expected: Vec<String> =
                names[..=k].iter().map(|n| format!("run {}", n)).collect();
            expected.extend(
                names[..k].iter().rev().map(|n| format!("undo {}", n)),
            );
            assert_eq!(journal.entries(), expected, "failing step {}", k);
        }
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_create_vm_shaped_failure() {
        let logctx = test_setup_log("test_create_vm_shaped_failure");
        let executor =
            ChainExecutor::new(&logctx.log, &ExecutorConfig::default());
        let journal = Journal::default();
        let cause = Error::handler("volume backend unavailable");
        let chain = FlowChain::build(
            "create-vm",
            vec![
                journaled_step(&journal, "allocate-host", None),
                journaled_step(&journal, "reserve-storage", None),
                journaled_step(&journal, "create-volume", Some(cause.clone())),
                journaled_step(&journal, "start-instance", None),
            ],
        )
        .unwrap();

        let error =
            executor.execute(chain, FlowContext::new()).await.unwrap_err();
        assert_matches!(
            &error,
            ChainError::StepFailure { failure, rollback_failures, .. }
                if failure.step == "create-volume"
                    && failure.cause == cause
                    && rollback_failures.is_empty()
        );
        assert_eq!(
            journal.entries(),
            [
                "run allocate-host",
                "run reserve-storage",
                "run create-volume",
                "undo reserve-storage",
                "undo allocate-host",
            ]
        );

        let error = Error::from(error);
        assert_eq!(
            error,
            Error::StepFailure {
                step: String::from("create-volume"),
                cause: Box::new(cause),
            }
        );
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_rollback_failures_are_collected() {
        let logctx = test_setup_log("test_rollback_failures_are_collected");
        let executor =
            ChainExecutor::new(&logctx.log, &ExecutorConfig::default());
        let journal = Journal::default();
        let broken_undo = FlowFunc::new(
            "broken-undo",
            |_| async { Ok(()) },
            |_| async { Err(anyhow::anyhow!("backend gone")) },
        );
        let panicking_undo = FlowFunc::new(
            "panicking-undo",
            |_| async { Ok(()) },
            |sctx| async move {
                assert!(sctx.is_cancelled(), "undo exploded");
                Ok(())
            },
        );
        let chain = FlowChain::build(
            "messy",
            vec![
                journaled_step(&journal, "first", None),
                broken_undo,
                panicking_undo,
                journaled_step(&journal, "fails", Some(Error::Cancelled)),
            ],
        )
        .unwrap();

        let report = executor
            .prepare(chain, FlowContext::new())
            .start()
            .wait_until_stopped()
            .await
            .into_report();
        assert_eq!(report.state, ChainState::Failed);
        // The original cause is preserved.
        assert_eq!(report.failure.unwrap().cause, Error::Cancelled);
        let failed: Vec<_> =
            report.rollback_failures.iter().map(|f| f.step.as_str()).collect();
        assert_eq!(failed, ["panicking-undo", "broken-undo"]);
        assert!(report.rollback_failures[0].message.contains("undo exploded"));
        assert_eq!(report.rollback_failures[1].message, "backend gone");
        // Earlier rollbacks still ran.
        assert_eq!(
            journal.entries(),
            ["run first", "run fails", "undo first"]
        );
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_step_panic_fails_chain() {
        let logctx = test_setup_log("test_step_panic_fails_chain");
        let executor =
            ChainExecutor::new(&logctx.log, &ExecutorConfig::default());
        let journal = Journal::default();
        let chain = FlowChain::build(
            "panics",
            vec![
                journaled_step(&journal, "ok", None),
                FlowFunc::new_no_rollback("explodes", |sctx| async move {
                    assert!(sctx.contains("missing"), "step bug");
                    Ok(())
                }),
            ],
        )
        .unwrap();
        let report = executor
            .prepare(chain, FlowContext::new())
            .start()
            .wait_until_stopped()
            .await
            .into_report();
        assert_eq!(report.state, ChainState::Failed);
        assert_matches!(
            report.failure.unwrap().cause,
            Error::InternalError { internal_message }
                if internal_message.contains("step bug")
        );
        assert_eq!(journal.entries(), ["run ok", "undo ok"]);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_cancel_mid_chain() {
        let logctx = test_setup_log("test_cancel_mid_chain");
        let executor =
            ChainExecutor::new(&logctx.log, &ExecutorConfig::default());
        let journal = Journal::default();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let started_tx = Arc::new(Mutex::new(Some(started_tx)));

        let waits = {
            let journal = journal.clone();
            FlowFunc::new_no_rollback("waits", move |sctx| {
                let journal = journal.clone();
                let started_tx = Arc::clone(&started_tx);
                async move {
                    journal.record(String::from("run waits"));
                    if let Some(tx) = started_tx.lock().unwrap().take() {
                        let _ = tx.send(());
                    }
                    sctx.until_cancelled(futures::future::pending::<
                        Result<(), Error>,
                    >())
                    .await
                }
            })
        };
        let chain = FlowChain::build(
            "cancellable",
            vec![
                journaled_step(&journal, "before", None),
                waits,
                journaled_step(&journal, "after", None),
            ],
        )
        .unwrap();

        let running = executor.prepare(chain, FlowContext::new()).start();
        let id = running.id();
        started_rx.await.unwrap();
        let status = executor.chain_get(id).unwrap();
        assert_eq!(status.state, ChainState::Running);
        assert_eq!(status.current_step.as_deref(), Some("waits"));
        assert_eq!(status.executed_index, Some(0));
        assert!(executor.live_chain_ids().contains(&id));

        running.cancel_handle().cancel();
        let report = running.wait_until_stopped().await.into_report();
        assert_eq!(report.state, ChainState::Failed);
        let failure = report.failure.unwrap();
        assert_eq!(failure.step, "waits");
        assert_eq!(failure.cause, Error::Cancelled);
        assert_eq!(
            journal.entries(),
            ["run before", "run waits", "undo before"]
        );
        assert!(!executor.live_chain_ids().contains(&id));
        assert_eq!(executor.chain_get(id).unwrap().state, ChainState::Failed);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let logctx = test_setup_log("test_cancel_before_start");
        let executor =
            ChainExecutor::new(&logctx.log, &ExecutorConfig::default());
        let journal = Journal::default();
        let chain = FlowChain::build(
            "never-runs",
            vec![journaled_step(&journal, "only", None)],
        )
        .unwrap();

        let runnable = executor.prepare(chain, FlowContext::new());
        assert_eq!(
            executor.chain_get(runnable.id()).unwrap().state,
            ChainState::Pending
        );
        runnable.cancel_handle().cancel();
        let report =
            runnable.start().wait_until_stopped().await.into_report();
        assert_eq!(report.state, ChainState::Failed);
        assert_eq!(report.executed_index, None);
        assert_eq!(report.failure.unwrap().cause, Error::Cancelled);
        assert!(journal.entries().is_empty());
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_dropped_before_start() {
        let logctx = test_setup_log("test_dropped_before_start");
        let executor =
            ChainExecutor::new(&logctx.log, &ExecutorConfig::default());
        let journal = Journal::default();
        let chain = FlowChain::build(
            "abandoned",
            vec![journaled_step(&journal, "only", None)],
        )
        .unwrap();

        let runnable = executor.prepare(chain, FlowContext::new());
        let id = runnable.id();
        assert!(executor.live_chain_ids().contains(&id));
        drop(runnable);

        assert!(executor.live_chain_ids().is_empty());
        assert_matches!(
            executor.chain_get(id),
            Err(Error::ObjectNotFound { .. })
        );
        assert!(journal.entries().is_empty());
        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_triggers_rollback() {
        let logctx = test_setup_log("test_timeout_triggers_rollback");
        let executor =
            ChainExecutor::new(&logctx.log, &ExecutorConfig::default());
        let journal = Journal::default();
        let slow = FlowFunc::new_no_rollback("slow-backend", |_| async {
            let deadline = Duration::from_secs(5);
            tokio::time::timeout(deadline, futures::future::pending::<()>())
                .await
                .map_err(|_| Error::Timeout {
                    destination: String::from("agent.slow"),
                    timeout: deadline,
                })
        });
        let chain = FlowChain::build(
            "times-out",
            vec![journaled_step(&journal, "reserve", None), slow],
        )
        .unwrap();

        let error =
            executor.execute(chain, FlowContext::new()).await.unwrap_err();
        let error = Error::from(error);
        assert!(error.retryable());
        assert_matches!(error.root_cause(), Error::Timeout { .. });
        assert_eq!(journal.entries(), ["run reserve", "undo reserve"]);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_finished_chains_are_pruned() {
        let logctx = test_setup_log("test_finished_chains_are_pruned");
        let executor = ChainExecutor::new(
            &logctx.log,
            &ExecutorConfig { retain_finished_chains: 2 },
        );
        let mut ids = Vec::new();
        for _ in 0..4 {
            let chain = FlowChain::build(
                "noop",
                vec![FlowFunc::new_no_rollback("noop", |_| async { Ok(()) })],
            )
            .unwrap();
            let running = executor.prepare(chain, FlowContext::new()).start();
            ids.push(running.id());
            running.wait_until_stopped().await;
        }

        let listed: Vec<_> =
            executor.chain_list().into_iter().map(|s| s.id).collect();
        assert_eq!(listed.len(), 2);
        assert!(listed.contains(&ids[2]));
        assert!(listed.contains(&ids[3]));
        assert_matches!(
            executor.chain_get(ids[0]),
            Err(Error::ObjectNotFound { .. })
        );
        assert!(executor.live_chain_ids().is_empty());
        logctx.cleanup_successful();
    }
}
