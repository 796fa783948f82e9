// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Messages exchanged over the bus

use chrono::DateTime;
use chrono::Utc;
use cirrus_common::api::error::Error;
use cirrus_uuid_kinds::MessageUuid;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// expects exactly one Reply or Error from the destination's handler
    Request,
    /// fanned out to every subscriber; no reply
    Event,
    Reply,
    Error,
}

/// Stable logical name of a message endpoint (e.g., `agent.storage`)
///
/// Destinations are dot-separated segments of lowercase ASCII letters,
/// digits, `-` and `_`.
#[derive(
    Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(try_from = "String")]
pub struct Destination(String);

impl Destination {
    pub fn new(name: impl Into<String>) -> Result<Destination, Error> {
        let name = name.into();
        let valid_segment = |segment: &str| {
            !segment.is_empty()
                && segment.chars().all(|c| {
                    c.is_ascii_lowercase()
                        || c.is_ascii_digit()
                        || c == '-'
                        || c == '_'
                })
        };
        if name.split('.').all(valid_segment) {
            Ok(Destination(name))
        } else {
            Err(Error::invalid_request(format!(
                "invalid destination name {:?}",
                name
            )))
        }
    }

    /// Builds a destination from a name known at compile time.
    ///
    /// # Panics
    ///
    /// Panics if `name` is not a valid destination name.
    pub fn from_static(name: &'static str) -> Destination {
        match Destination::new(name) {
            Ok(destination) => destination,
            Err(error) => panic!("{}", error),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Destination {
    type Error = Error;

    fn try_from(name: String) -> Result<Self, Self::Error> {
        Destination::new(name)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A unit of communication between components
///
/// Requests and events are correlated with themselves; a Reply or Error
/// always carries the originating Request's id as its correlation id.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Message {
    id: MessageUuid,
    correlation_id: MessageUuid,
    kind: MessageKind,
    destination: Destination,
    payload: serde_json::Value,
    timestamp: DateTime<Utc>,
}

impl Message {
    fn new(
        kind: MessageKind,
        destination: Destination,
        payload: serde_json::Value,
    ) -> Message {
        let id = MessageUuid::new_v4();
        Message {
            id,
            correlation_id: id,
            kind,
            destination,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Builds a Request carrying `body` serialized as JSON.
    pub fn request<T: Serialize>(
        destination: Destination,
        body: &T,
    ) -> Result<Message, Error> {
        Ok(Message::new(
            MessageKind::Request,
            destination,
            serde_json::to_value(body)?,
        ))
    }

    /// Builds an Event carrying `body` serialized as JSON.
    pub fn event<T: Serialize>(
        destination: Destination,
        body: &T,
    ) -> Result<Message, Error> {
        Ok(Message::new(
            MessageKind::Event,
            destination,
            serde_json::to_value(body)?,
        ))
    }

    /// Builds the Reply to `request` carrying `payload`.
    pub fn reply_to(request: &Message, payload: serde_json::Value) -> Message {
        let mut reply = Message::new(
            MessageKind::Reply,
            request.destination.clone(),
            payload,
        );
        reply.correlation_id = request.id;
        reply
    }

    /// Builds the Error reply to `request` carrying `error`.
    pub fn error_reply(request: &Message, error: &Error) -> Message {
        // `Error` serializes infallibly: it contains only strings, integers,
        // durations and uuids.
        let payload = serde_json::to_value(error).unwrap_or_else(|e| {
            let message = format!("{} (unserializable: {})", error, e);
            serde_json::Value::String(message)
        });
        let destination = request.destination.clone();
        let mut reply = Message::new(MessageKind::Error, destination, payload);
        reply.correlation_id = request.id;
        reply
    }

    pub fn id(&self) -> MessageUuid {
        self.id
    }

    pub fn correlation_id(&self) -> MessageUuid {
        self.correlation_id
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn raw_payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Deserializes the payload as `T`.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            Error::invalid_request(format!(
                "malformed payload for {}: {}",
                self.destination, e
            ))
        })
    }

    /// Converts an Error-kind reply into the `Error` it carries.  Any other
    /// message is returned unchanged.
    pub fn into_result(self) -> Result<Message, Error> {
        if self.kind != MessageKind::Error {
            return Ok(self);
        }
        match serde_json::from_value::<Error>(self.payload) {
            Ok(error) => Err(error),
            Err(e) => Err(Error::internal_error(&format!(
                "undecodable error reply from {}: {}",
                self.destination, e
            ))),
        }
    }
}
