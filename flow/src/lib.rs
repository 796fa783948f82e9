// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Flow chains
//!
//! A flow chain is an ordered list of steps ([`Flow`]s), each with a
//! forward action and a compensating rollback action.  The
//! [`ChainExecutor`] runs the steps one at a time, each to completion before
//! the next.  If a step fails, the steps that had completed are rolled back
//! in reverse order and the chain reports the failing step and its error.
//! Steps exchange data through a shared [`FlowContext`].

mod chain;
mod context;
mod executor;
mod flow;
mod steps;
mod sub_chain;
#[cfg(test)]
mod test_util;

pub use chain::ChainBuildError;
pub use chain::ChainState;
pub use chain::FlowChain;
pub use chain::FlowChainBuilder;
pub use context::FlowContext;
pub use executor::ChainCancelHandle;
pub use executor::ChainError;
pub use executor::ChainExecutor;
pub use executor::ChainReport;
pub use executor::ChainStatus;
pub use executor::ExecutorConfig;
pub use executor::RunnableChain;
pub use executor::RunningChain;
pub use executor::StoppedChain;
pub use flow::Flow;
pub use flow::FlowFunc;
pub use flow::StepContext;
pub use steps::RollbackFailure;
pub use steps::StepFailure;
pub use sub_chain::SubChain;
pub use sub_chain::SubChainRecord;
