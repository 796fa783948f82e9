// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Message bus connecting orchestration components
//!
//! Components never call each other directly.  A component that serves
//! requests binds a [`Destination`] to a [`RequestHandler`]; other components
//! reach it with [`MessageBus::send`] and get exactly one reply back.
//! Notifications that any number of components may care about are published
//! as events with [`MessageBus::publish`] and fanned out to every
//! [`EventSubscriber`] of the destination.
//!
//! Requests to one destination are dispatched in the order they were
//! submitted; different destinations are served concurrently.

mod bus;
mod config;
mod handler;
mod mailbox;
mod message;

pub use bus::DeliveryFailure;
pub use bus::MessageBus;
pub use config::BusConfig;
pub use handler::EventSubscriber;
pub use handler::HandlerFn;
pub use handler::RequestHandler;
pub use handler::SubscriberFn;
pub use message::Destination;
pub use message::Message;
pub use message::MessageKind;
