// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Chains nested inside another chain as a single step

use crate::chain::validate_steps;
use crate::chain::ChainBuildError;
use crate::chain::ChainState;
use crate::context::FlowContext;
use crate::flow::Flow;
use crate::flow::StepContext;
use crate::steps::roll_back;
use crate::steps::run_forward;
use crate::steps::RollbackFailure;
use async_trait::async_trait;
use cirrus_common::api::error::Error;
use serde::Deserialize;
use serde::Serialize;
use slog::info;
use std::fmt;
use std::sync::Arc;

type Predicate = dyn Fn(&StepContext) -> bool + Send + Sync;

/// What a sub-chain left in the enclosing chain's context, under
/// [`SubChainRecord::key()`]
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SubChainRecord {
    pub state: ChainState,
    /// the sub-chain's condition was false, so none of its steps ran
    pub skipped: bool,
    pub executed_index: Option<usize>,
    pub rollback_failures: Vec<RollbackFailure>,
}

impl SubChainRecord {
    pub fn key(sub_chain_name: &str) -> String {
        format!("sub_chain.{}", sub_chain_name)
    }

    /// Fetches the record of sub-chain `sub_chain_name` from a chain's
    /// context, if that sub-chain has run
    pub fn lookup(
        context: &FlowContext,
        sub_chain_name: &str,
    ) -> Result<Option<SubChainRecord>, Error> {
        context.lookup_opt(&SubChainRecord::key(sub_chain_name))
    }
}

/// A list of steps that runs as one step of an enclosing chain
///
/// The nested steps share the enclosing chain's context and cancellation.
/// If a nested step fails, the sub-chain rolls back its own completed steps
/// and then fails, so the enclosing chain rolls back the steps before it.
/// If the sub-chain succeeds and a later step of the enclosing chain fails,
/// the sub-chain's rollback undoes all of its nested steps in reverse.
pub struct SubChain {
    name: String,
    steps: Vec<Arc<dyn Flow>>,
    when: Option<Box<Predicate>>,
}

impl SubChain {
    pub fn new(
        name: impl Into<String>,
        steps: Vec<Arc<dyn Flow>>,
    ) -> Result<SubChain, ChainBuildError> {
        let name = name.into();
        validate_steps(&name, &steps)?;
        Ok(SubChain { name, steps, when: None })
    }

    /// Runs the nested steps only if `predicate` holds when the sub-chain is
    /// reached.  A skipped sub-chain succeeds and has nothing to roll back.
    pub fn when<P>(mut self, predicate: P) -> SubChain
    where
        P: Fn(&StepContext) -> bool + Send + Sync + 'static,
    {
        self.when = Some(Box::new(predicate));
        self
    }

    pub fn into_flow(self) -> Arc<dyn Flow> {
        Arc::new(self)
    }

    fn save_record(
        &self,
        sctx: &StepContext,
        record: &SubChainRecord,
    ) -> Result<(), Error> {
        sctx.insert(SubChainRecord::key(&self.name), record)
    }
}

impl fmt::Debug for SubChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubChain")
            .field("name", &self.name)
            .field("steps", &self.steps)
            .field("conditional", &self.when.is_some())
            .finish()
    }
}

#[async_trait]
impl Flow for SubChain {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, sctx: &StepContext) -> Result<(), Error> {
        if let Some(predicate) = &self.when {
            if !predicate(sctx) {
                info!(sctx.log(), "condition not met; skipping sub-chain");
                return self.save_record(
                    sctx,
                    &SubChainRecord {
                        state: ChainState::Succeeded,
                        skipped: true,
                        executed_index: None,
                        rollback_failures: Vec::new(),
                    },
                );
            }
        }

        let forward = run_forward(&self.steps, sctx, |_, _| {}).await;
        match forward.failure {
            None => self.save_record(
                sctx,
                &SubChainRecord {
                    state: ChainState::Succeeded,
                    skipped: false,
                    executed_index: forward.completed.checked_sub(1),
                    rollback_failures: Vec::new(),
                },
            ),
            Some(failure) => {
                let rollback_failures =
                    roll_back(&self.steps[..forward.completed], sctx).await;
                self.save_record(
                    sctx,
                    &SubChainRecord {
                        state: ChainState::Failed,
                        skipped: false,
                        executed_index: forward.completed.checked_sub(1),
                        rollback_failures,
                    },
                )?;
                Err(Error::StepFailure {
                    step: failure.step,
                    cause: Box::new(failure.cause),
                })
            }
        }
    }

    async fn rollback(&self, sctx: &StepContext) -> anyhow::Result<()> {
        let Some(mut record) = sctx.lookup_opt::<SubChainRecord>(
            &SubChainRecord::key(&self.name),
        )?
        else {
            return Ok(());
        };
        if record.skipped || record.state != ChainState::Succeeded {
            return Ok(());
        }

        let failures = roll_back(&self.steps, sctx).await;
        record.state = ChainState::RolledBack;
        record.rollback_failures = failures.clone();
        self.save_record(sctx, &record)?;

        if failures.is_empty() {
            Ok(())
        } else {
            let steps: Vec<_> =
                failures.iter().map(|f| f.step.as_str()).collect();
            anyhow::bail!(
                "sub-chain {:?}: rollback failed for steps {:?}",
                self.name,
                steps
            )
        }
    }
}
