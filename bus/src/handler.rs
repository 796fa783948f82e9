// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces implemented by components that receive messages

use crate::message::Message;
use async_trait::async_trait;
use cirrus_common::api::error::Error;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;

/// Serves Requests sent to one destination
///
/// The returned value becomes the payload of the Reply; an `Err` becomes an
/// Error-kind reply.  Handlers must not `send` synchronously to their own
/// destination: with a single-permit mailbox that would wait on itself until
/// the sender's deadline expires.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: &Message)
        -> Result<serde_json::Value, Error>;
}

/// Receives Events published to one destination
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    async fn on_event(&self, event: &Message) -> Result<(), Error>;
}

type HandlerFuture = BoxFuture<'static, Result<serde_json::Value, Error>>;
type HandlerFnType = dyn Fn(Message) -> HandlerFuture + Send + Sync;

/// [`RequestHandler`] implemented by an async function
pub struct HandlerFn {
    func: Box<HandlerFnType>,
}

impl HandlerFn {
    pub fn new<F, Fut>(func: F) -> Arc<dyn RequestHandler>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, Error>> + Send + 'static,
    {
        Arc::new(HandlerFn { func: Box::new(move |m| func(m).boxed()) })
    }
}

#[async_trait]
impl RequestHandler for HandlerFn {
    async fn handle(
        &self,
        request: &Message,
    ) -> Result<serde_json::Value, Error> {
        (self.func)(request.clone()).await
    }
}

type SubscriberFnType =
    dyn Fn(Message) -> BoxFuture<'static, Result<(), Error>> + Send + Sync;

/// [`EventSubscriber`] implemented by an async function
pub struct SubscriberFn {
    func: Box<SubscriberFnType>,
}

impl SubscriberFn {
    pub fn new<F, Fut>(func: F) -> Arc<dyn EventSubscriber>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        Arc::new(SubscriberFn { func: Box::new(move |m| func(m).boxed()) })
    }
}

#[async_trait]
impl EventSubscriber for SubscriberFn {
    async fn on_event(&self, event: &Message) -> Result<(), Error> {
        (self.func)(event.clone()).await
    }
}
