// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Flow chain definitions

use crate::flow::Flow;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Execution state of a chain instance
///
/// ```text
/// Pending -> Running -> Succeeded [-> RolledBack]
///               |
///               +-> RollingBack -> Failed
/// ```
///
/// A failed chain always ends `Failed`, whatever happened during rollback.
/// `RolledBack` is reached only by a chain that had succeeded and was undone
/// afterwards as a whole (a sub-chain whose enclosing chain failed later).
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainState {
    Pending,
    Running,
    Succeeded,
    RollingBack,
    Failed,
    RolledBack,
}

impl ChainState {
    pub fn is_terminal(&self) -> bool {
        match self {
            ChainState::Succeeded
            | ChainState::Failed
            | ChainState::RolledBack => true,
            ChainState::Pending
            | ChainState::Running
            | ChainState::RollingBack => false,
        }
    }
}

impl fmt::Display for ChainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChainState::Pending => "pending",
            ChainState::Running => "running",
            ChainState::Succeeded => "succeeded",
            ChainState::RollingBack => "rolling back",
            ChainState::Failed => "failed",
            ChainState::RolledBack => "rolled back",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ChainBuildError {
    #[error("flow chain {0:?} has no steps")]
    Empty(String),
    #[error("flow chain {chain:?} has more than one step named {step:?}")]
    DuplicateStep { chain: String, step: String },
}

/// An ordered list of steps, validated and ready to be executed
#[derive(Clone, Debug)]
pub struct FlowChain {
    name: String,
    steps: Vec<Arc<dyn Flow>>,
}

impl FlowChain {
    /// Validates `steps`: there must be at least one, and step names must be
    /// unique within the chain.
    pub fn build(
        name: impl Into<String>,
        steps: Vec<Arc<dyn Flow>>,
    ) -> Result<FlowChain, ChainBuildError> {
        let name = name.into();
        validate_steps(&name, &steps)?;
        Ok(FlowChain { name, steps })
    }

    pub fn builder(name: impl Into<String>) -> FlowChainBuilder {
        FlowChainBuilder { name: name.into(), steps: Vec::new() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[Arc<dyn Flow>] {
        &self.steps
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }
}

pub(crate) fn validate_steps(
    name: &str,
    steps: &[Arc<dyn Flow>],
) -> Result<(), ChainBuildError> {
    if steps.is_empty() {
        return Err(ChainBuildError::Empty(name.to_owned()));
    }
    let mut seen = BTreeSet::new();
    for step in steps {
        if !seen.insert(step.name()) {
            return Err(ChainBuildError::DuplicateStep {
                chain: name.to_owned(),
                step: step.name().to_owned(),
            });
        }
    }
    Ok(())
}

pub struct FlowChainBuilder {
    name: String,
    steps: Vec<Arc<dyn Flow>>,
}

impl FlowChainBuilder {
    pub fn step(mut self, step: Arc<dyn Flow>) -> FlowChainBuilder {
        self.steps.push(step);
        self
    }

    /// Appends `step` only if `condition` holds.
    pub fn step_if(
        self,
        condition: bool,
        step: Arc<dyn Flow>,
    ) -> FlowChainBuilder {
        if condition {
            self.step(step)
        } else {
            self
        }
    }

    pub fn build(self) -> Result<FlowChain, ChainBuildError> {
        FlowChain::build(self.name, self.steps)
    }
}
