// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The message bus: request/reply routing and event fan-out

use crate::config::BusConfig;
use crate::handler::EventSubscriber;
use crate::handler::RequestHandler;
use crate::mailbox::Envelope;
use crate::mailbox::Mailbox;
use crate::message::Destination;
use crate::message::Message;
use crate::message::MessageKind;
use cirrus_common::api::error::Error;
use cirrus_uuid_kinds::SubscriptionUuid;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use slog::debug;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;

/// A subscriber that failed to handle a published event
#[derive(Clone, Debug, PartialEq)]
pub struct DeliveryFailure {
    pub subscription_id: SubscriptionUuid,
    pub error: Error,
}

struct Subscription {
    id: SubscriptionUuid,
    subscriber: Arc<dyn EventSubscriber>,
}

/// Routes messages between components
///
/// Cloning a `MessageBus` yields another handle to the same bus.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    log: Logger,
    config: BusConfig,
    mailboxes: Mutex<BTreeMap<Destination, Mailbox>>,
    subscriptions: Mutex<BTreeMap<Destination, Vec<Subscription>>>,
}

impl MessageBus {
    pub fn new(log: &Logger, config: BusConfig) -> MessageBus {
        let log = log.new(o!("component" => "MessageBus"));
        MessageBus {
            inner: Arc::new(BusInner {
                log,
                config,
                mailboxes: Mutex::new(BTreeMap::new()),
                subscriptions: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Binds `destination` to `handler` on behalf of `owner`
    ///
    /// Re-registering by the same owner replaces the handler; requests
    /// already being served finish on the old one.  A different owner gets
    /// [`Error::DuplicateHandler`].  Must be called from within a tokio
    /// runtime.
    pub fn register_handler(
        &self,
        destination: &Destination,
        owner: &str,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<(), Error> {
        let parallelism = self.inner.config.handler_parallelism;
        self.register_handler_with_parallelism(
            destination,
            owner,
            handler,
            parallelism,
        )
    }

    /// Like [`MessageBus::register_handler`], but lets the destination serve
    /// up to `parallelism` requests at once.  Requests are still dispatched
    /// in submission order.
    ///
    /// When the same owner re-registers, the destination keeps the
    /// parallelism it was first bound with.
    pub fn register_handler_with_parallelism(
        &self,
        destination: &Destination,
        owner: &str,
        handler: Arc<dyn RequestHandler>,
        parallelism: usize,
    ) -> Result<(), Error> {
        let mut mailboxes = self.inner.mailboxes.lock().unwrap();
        if let Some(mailbox) = mailboxes.get(destination) {
            if mailbox.owner() != owner {
                return Err(Error::DuplicateHandler {
                    destination: destination.to_string(),
                    owner: mailbox.owner().to_owned(),
                });
            }
            mailbox.replace_handler(handler);
            info!(self.inner.log, "replaced request handler";
                "destination" => %destination,
                "owner" => owner,
            );
            return Ok(());
        }

        let mailbox = Mailbox::spawn(
            &self.inner.log,
            destination.clone(),
            owner.to_owned(),
            handler,
            self.inner.config.mailbox_depth,
            parallelism,
        );
        info!(self.inner.log, "registered request handler";
            "destination" => %destination,
            "owner" => owner,
            "parallelism" => mailbox.parallelism(),
        );
        mailboxes.insert(destination.clone(), mailbox);
        Ok(())
    }

    /// Unbinds `destination`.  Only the owner that bound it may do so.
    ///
    /// Requests already queued are still served.
    pub fn unregister_handler(
        &self,
        destination: &Destination,
        owner: &str,
    ) -> Result<(), Error> {
        let mut mailboxes = self.inner.mailboxes.lock().unwrap();
        match mailboxes.get(destination) {
            None => {
                Err(Error::NoRoute { destination: destination.to_string() })
            }
            Some(mailbox) if mailbox.owner() != owner => {
                Err(Error::invalid_request(format!(
                    "{:?} cannot unbind {}: it is owned by {:?}",
                    owner,
                    destination,
                    mailbox.owner()
                )))
            }
            Some(_) => {
                mailboxes.remove(destination);
                info!(self.inner.log, "unregistered request handler";
                    "destination" => %destination,
                    "owner" => owner,
                );
                Ok(())
            }
        }
    }

    /// Adds `subscriber` to the set receiving events published to
    /// `destination`
    pub fn subscribe(
        &self,
        destination: &Destination,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> SubscriptionUuid {
        let id = SubscriptionUuid::new_v4();
        self.inner
            .subscriptions
            .lock()
            .unwrap()
            .entry(destination.clone())
            .or_default()
            .push(Subscription { id, subscriber });
        debug!(self.inner.log, "subscribed";
            "destination" => %destination,
            "subscription_id" => %id,
        );
        id
    }

    /// Removes a subscription.  Returns whether it existed.
    pub fn unsubscribe(
        &self,
        destination: &Destination,
        subscription_id: SubscriptionUuid,
    ) -> bool {
        let mut subscriptions = self.inner.subscriptions.lock().unwrap();
        let Some(list) = subscriptions.get_mut(destination) else {
            return false;
        };
        let before = list.len();
        list.retain(|s| s.id != subscription_id);
        let removed = list.len() != before;
        if list.is_empty() {
            subscriptions.remove(destination);
        }
        removed
    }

    /// Sends a Request and waits for its Reply
    ///
    /// Handler errors come back as `Ok` Error-kind replies (see
    /// [`Message::into_result`]); `Err` is reserved for failures of the bus
    /// itself: [`Error::NoRoute`] when nothing is bound, [`Error::Timeout`]
    /// when no reply arrives within `deadline` (or the configured default).
    /// The deadline covers both waiting for queue space and waiting for the
    /// handler.
    pub async fn send(
        &self,
        message: Message,
        deadline: Option<Duration>,
    ) -> Result<Message, Error> {
        if message.kind() != MessageKind::Request {
            return Err(Error::invalid_request(format!(
                "send() requires a Request, got {:?}",
                message.kind()
            )));
        }

        let destination = message.destination().clone();
        let queue_tx = self
            .inner
            .mailboxes
            .lock()
            .unwrap()
            .get(&destination)
            .map(|mailbox| mailbox.sender())
            .ok_or_else(|| Error::NoRoute {
                destination: destination.to_string(),
            })?;

        let timeout =
            deadline.unwrap_or_else(|| self.inner.config.default_timeout());
        let message_id = message.id();
        debug!(self.inner.log, "sending request";
            "destination" => %destination,
            "message_id" => %message_id,
            "timeout" => ?timeout,
        );

        let (reply_tx, reply_rx) = oneshot::channel();
        let exchange = async {
            queue_tx
                .send(Envelope { request: message, reply_tx })
                .await
                .map_err(|_| Error::NoRoute {
                    destination: destination.to_string(),
                })?;
            reply_rx.await.map_err(|_| {
                Error::internal_error(&format!(
                    "request to {} was dropped without a reply",
                    destination
                ))
            })
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                warn!(self.inner.log, "request timed out";
                    "destination" => %destination,
                    "message_id" => %message_id,
                    "timeout" => ?timeout,
                );
                Err(Error::Timeout {
                    destination: destination.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Sends `body` as a Request to `destination` and decodes the Reply as
    /// `R`, folding Error-kind replies into `Err`
    pub async fn call<T, R>(
        &self,
        destination: &Destination,
        body: &T,
        deadline: Option<Duration>,
    ) -> Result<R, Error>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let request = Message::request(destination.clone(), body)?;
        let reply = self.send(request, deadline).await?.into_result()?;
        reply.payload::<R>()
    }

    /// Delivers an Event to every current subscriber of its destination
    ///
    /// Subscribers run concurrently and independently: one failing or
    /// panicking never prevents delivery to the others, and a subscriber
    /// that does not finish within `deadline` (or the configured default) is
    /// abandoned.  The failures are returned in subscription order.  `Err`
    /// is returned only if `event` is not an Event.
    pub async fn publish(
        &self,
        event: Message,
        deadline: Option<Duration>,
    ) -> Result<Vec<DeliveryFailure>, Error> {
        if event.kind() != MessageKind::Event {
            return Err(Error::invalid_request(format!(
                "publish() requires an Event, got {:?}",
                event.kind()
            )));
        }

        let subscribers: Vec<(SubscriptionUuid, Arc<dyn EventSubscriber>)> =
            self.inner
                .subscriptions
                .lock()
                .unwrap()
                .get(event.destination())
                .map(|list| {
                    list.iter()
                        .map(|s| (s.id, Arc::clone(&s.subscriber)))
                        .collect()
                })
                .unwrap_or_default();

        debug!(self.inner.log, "publishing event";
            "destination" => %event.destination(),
            "message_id" => %event.id(),
            "subscribers" => subscribers.len(),
        );

        let timeout =
            deadline.unwrap_or_else(|| self.inner.config.default_timeout());
        let event = Arc::new(event);
        let deliveries: Vec<_> = subscribers
            .into_iter()
            .map(|(id, subscriber)| {
                let event = Arc::clone(&event);
                let task = tokio::spawn(async move {
                    let delivery =
                        AssertUnwindSafe(subscriber.on_event(&event))
                            .catch_unwind();
                    match tokio::time::timeout(timeout, delivery).await {
                        Ok(Ok(result)) => result,
                        Ok(Err(_)) => Err(Error::internal_error(
                            "event subscriber panicked",
                        )),
                        Err(_) => Err(Error::Timeout {
                            destination: event.destination().to_string(),
                            timeout,
                        }),
                    }
                });
                (id, task)
            })
            .collect();

        let mut failures = Vec::new();
        for (subscription_id, task) in deliveries {
            let result = task.await.unwrap_or_else(|join_error| {
                Err(Error::internal_error(&format!(
                    "event delivery task failed: {}",
                    join_error
                )))
            });
            if let Err(error) = result {
                warn!(self.inner.log, "event delivery failed";
                    "destination" => %event.destination(),
                    "message_id" => %event.id(),
                    "subscription_id" => %subscription_id,
                    "error" => %error,
                );
                failures.push(DeliveryFailure { subscription_id, error });
            }
        }
        Ok(failures)
    }

    /// Lists the destinations that currently have a request handler.
    pub fn destinations(&self) -> Vec<Destination> {
        self.inner.mailboxes.lock().unwrap().keys().cloned().collect()
    }

    /// Number of subscribers currently attached to `destination`.
    pub fn subscriber_count(&self, destination: &Destination) -> usize {
        self.inner
            .subscriptions
            .lock()
            .unwrap()
            .get(destination)
            .map_or(0, |list| list.len())
    }
}
