// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Steps of a flow chain

use crate::context::FlowContext;
use async_trait::async_trait;
use cirrus_common::api::error::Error;
use cirrus_uuid_kinds::ChainUuid;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use slog::o;
use slog::Logger;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// One fallible step of a chain, with its compensating action
///
/// `rollback` runs only if `run` succeeded and a later step failed.  It
/// should still tolerate state that `run` never got around to creating,
/// since a step's side effects may be only partly visible in the context.
#[async_trait]
pub trait Flow: fmt::Debug + Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, sctx: &StepContext) -> Result<(), Error>;

    async fn rollback(&self, sctx: &StepContext) -> anyhow::Result<()>;
}

/// What a step gets to work with: the chain's shared context, a logger and
/// the chain's cancellation signal
#[derive(Clone)]
pub struct StepContext {
    chain_id: ChainUuid,
    chain_name: Arc<str>,
    step_name: Arc<str>,
    log: Logger,
    cancel: CancellationToken,
    context: Arc<Mutex<FlowContext>>,
}

impl StepContext {
    pub(crate) fn new(
        chain_id: ChainUuid,
        chain_name: &str,
        log: Logger,
        cancel: CancellationToken,
        context: FlowContext,
    ) -> StepContext {
        StepContext {
            chain_id,
            chain_name: Arc::from(chain_name),
            step_name: Arc::from(""),
            log,
            cancel,
            context: Arc::new(Mutex::new(context)),
        }
    }

    /// Context for running `step`, logging with the step's name
    pub(crate) fn for_step(&self, step: &str) -> StepContext {
        let step_name: Arc<str> = if self.step_name.is_empty() {
            Arc::from(step)
        } else {
            Arc::from(format!("{}/{}", self.step_name, step))
        };
        StepContext {
            log: self.log.new(o!("step" => step_name.to_string())),
            step_name,
            ..self.clone()
        }
    }

    /// Context for rollback actions, which are never cancelled
    pub(crate) fn uncancellable(&self) -> StepContext {
        StepContext { cancel: CancellationToken::new(), ..self.clone() }
    }

    pub fn chain_id(&self) -> ChainUuid {
        self.chain_id
    }

    pub fn chain_name(&self) -> &str {
        &self.chain_name
    }

    /// Name of the running step.  Steps of a sub-chain are named
    /// `outer/inner`.
    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Returns [`Error::Cancelled`] if the chain has been asked to stop.
    pub fn check_cancelled(&self) -> Result<(), Error> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Runs `future` to completion unless the chain is cancelled first, in
    /// which case `future` is dropped and [`Error::Cancelled`] returned
    pub async fn until_cancelled<F, T>(&self, future: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = future => result,
        }
    }

    pub fn lookup<T: DeserializeOwned>(&self, key: &str) -> Result<T, Error> {
        self.context.lock().unwrap().lookup(key)
    }

    pub fn lookup_opt<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, Error> {
        self.context.lock().unwrap().lookup_opt(key)
    }

    pub fn insert<T: Serialize>(
        &self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<(), Error> {
        self.context.lock().unwrap().insert(key, value)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.context.lock().unwrap().contains(key)
    }

    pub fn remove(&self, key: &str) -> Option<serde_json::Value> {
        self.context.lock().unwrap().remove(key)
    }

    /// Copy of the shared context as it is right now
    pub fn snapshot(&self) -> FlowContext {
        self.context.lock().unwrap().clone()
    }
}

impl fmt::Debug for StepContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepContext")
            .field("chain_id", &self.chain_id)
            .field("chain_name", &self.chain_name)
            .field("step_name", &self.step_name)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

type RunFn =
    dyn Fn(StepContext) -> BoxFuture<'static, Result<(), Error>> + Send + Sync;
type RollbackFn =
    dyn Fn(StepContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

/// A [`Flow`] built from async functions
pub struct FlowFunc {
    name: String,
    run: Box<RunFn>,
    rollback: Option<Box<RollbackFn>>,
}

impl FlowFunc {
    /// Builds a step whose forward action is `run` and whose compensating
    /// action is `rollback`
    pub fn new<R, RFut, U, UFut>(
        name: impl Into<String>,
        run: R,
        rollback: U,
    ) -> Arc<dyn Flow>
    where
        R: Fn(StepContext) -> RFut + Send + Sync + 'static,
        RFut: Future<Output = Result<(), Error>> + Send + 'static,
        U: Fn(StepContext) -> UFut + Send + Sync + 'static,
        UFut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Arc::new(FlowFunc {
            name: name.into(),
            run: Box::new(move |sctx| run(sctx).boxed()),
            rollback: Some(Box::new(move |sctx| rollback(sctx).boxed())),
        })
    }

    /// Builds a step with nothing to undo
    pub fn new_no_rollback<R, RFut>(
        name: impl Into<String>,
        run: R,
    ) -> Arc<dyn Flow>
    where
        R: Fn(StepContext) -> RFut + Send + Sync + 'static,
        RFut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        Arc::new(FlowFunc {
            name: name.into(),
            run: Box::new(move |sctx| run(sctx).boxed()),
            rollback: None,
        })
    }
}

impl fmt::Debug for FlowFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowFunc")
            .field("name", &self.name)
            .field("has_rollback", &self.rollback.is_some())
            .finish()
    }
}

#[async_trait]
impl Flow for FlowFunc {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, sctx: &StepContext) -> Result<(), Error> {
        (self.run)(sctx.clone()).await
    }

    async fn rollback(&self, sctx: &StepContext) -> anyhow::Result<()> {
        match &self.rollback {
            Some(rollback) => rollback(sctx.clone()).await,
            None => Ok(()),
        }
    }
}
