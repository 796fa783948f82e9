// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-destination request queues
//!
//! Each bound request destination owns a bounded FIFO queue served by one
//! dispatch task.  The dispatch task takes requests off the queue in
//! submission order and runs the handler for each under a semaphore permit,
//! so a destination configured for a parallelism of 1 handles its requests
//! strictly one after another.

use crate::handler::RequestHandler;
use crate::message::Destination;
use crate::message::Message;
use cirrus_common::api::error::Error;
use cirrus_common::api::error::ErrorClass;
use futures::FutureExt;
use slog::debug;
use slog::error;
use slog::o;
use slog::warn;
use slog::Logger;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

pub(crate) struct Envelope {
    pub(crate) request: Message,
    pub(crate) reply_tx: oneshot::Sender<Message>,
}

/// The sending half of a destination's queue plus its current binding
pub(crate) struct Mailbox {
    owner: String,
    parallelism: usize,
    queue_tx: mpsc::Sender<Envelope>,
    handler_tx: watch::Sender<Arc<dyn RequestHandler>>,
}

impl Mailbox {
    /// Creates the queue for `destination` and spawns its dispatch task.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn spawn(
        log: &Logger,
        destination: Destination,
        owner: String,
        handler: Arc<dyn RequestHandler>,
        depth: usize,
        parallelism: usize,
    ) -> Mailbox {
        let parallelism = parallelism.max(1);
        let log = log.new(o!(
            "destination" => destination.to_string(),
            "owner" => owner.clone(),
        ));
        let (queue_tx, queue_rx) = mpsc::channel(depth.max(1));
        let (handler_tx, handler_rx) = watch::channel(handler);
        tokio::spawn(dispatch_loop(log, queue_rx, handler_rx, parallelism));
        Mailbox { owner, parallelism, queue_tx, handler_tx }
    }

    pub(crate) fn owner(&self) -> &str {
        &self.owner
    }

    pub(crate) fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Swaps the handler serving this destination.  Requests already handed
    /// to the previous handler finish there.
    pub(crate) fn replace_handler(&self, handler: Arc<dyn RequestHandler>) {
        self.handler_tx.send_replace(handler);
    }

    pub(crate) fn sender(&self) -> mpsc::Sender<Envelope> {
        self.queue_tx.clone()
    }
}

/// Serves one destination's queue until every sender is gone
///
/// Dropping the [`Mailbox`] (unbinding the destination) does not discard
/// requests that were already queued: they are served by the last bound
/// handler before the task exits.
async fn dispatch_loop(
    log: Logger,
    mut queue_rx: mpsc::Receiver<Envelope>,
    handler_rx: watch::Receiver<Arc<dyn RequestHandler>>,
    parallelism: usize,
) {
    debug!(log, "mailbox started"; "parallelism" => parallelism);
    let semaphore = Arc::new(Semaphore::new(parallelism));
    let mut in_flight = JoinSet::new();

    while let Some(envelope) = queue_rx.recv().await {
        // Acquiring the permit before spawning keeps dispatch in queue order.
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            // The semaphore is never closed.
            break;
        };
        let handler = Arc::clone(&*handler_rx.borrow());
        let task_log = log.clone();
        in_flight.spawn(async move {
            dispatch_one(&task_log, handler, envelope).await;
            drop(permit);
        });

        while let Some(result) = in_flight.try_join_next() {
            if let Err(error) = result {
                error!(log, "request dispatch task failed";
                    "error" => %error);
            }
        }
    }

    while let Some(result) = in_flight.join_next().await {
        if let Err(error) = result {
            error!(log, "request dispatch task failed"; "error" => %error);
        }
    }
    debug!(log, "mailbox closed");
}

async fn dispatch_one(
    log: &Logger,
    handler: Arc<dyn RequestHandler>,
    envelope: Envelope,
) {
    let Envelope { request, reply_tx } = envelope;
    let log = log.new(o!(
        "message_id" => request.id().to_string(),
        "correlation_id" => request.correlation_id().to_string(),
    ));
    debug!(log, "delivering request");

    let outcome =
        AssertUnwindSafe(handler.handle(&request)).catch_unwind().await;
    let reply = match outcome {
        Ok(Ok(payload)) => Message::reply_to(&request, payload),
        Ok(Err(error)) => {
            if error.class() == ErrorClass::Programming {
                error!(log, "handler reported a bug"; "error" => %error);
            } else {
                debug!(log, "handler returned error"; "error" => %error);
            }
            Message::error_reply(&request, &error)
        }
        Err(panic) => {
            let message = panic_message(&*panic);
            error!(log, "handler panicked"; "panic" => %message);
            Message::error_reply(
                &request,
                &Error::internal_error(&format!(
                    "handler for {} panicked: {}",
                    request.destination(),
                    message
                )),
            )
        }
    };

    if reply_tx.send(reply).is_err() {
        // The sender stopped waiting (most likely its deadline expired).
        warn!(log, "reply dropped: sender is no longer waiting");
    }
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
