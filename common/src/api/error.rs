// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error handling facilities for the orchestration core
//!
//! Errors cross component boundaries inside Error-kind bus replies, so the
//! [`Error`] type here is `Clone` and serializable.  Rich, non-serializable
//! error chains (`anyhow::Error`) are only used where they never leave the
//! component that produced them, such as rollback actions.

use cirrus_uuid_kinds::ResourceUuid;
use serde::Deserialize;
use serde::Serialize;
use std::fmt::Display;
use std::time::Duration;

/// An error that can be generated within an orchestration component
///
/// These may be generated while handling a bus request, while executing a
/// flow chain step, or as part of a capacity mutation.  Where possible, reuse
/// existing variants rather than inventing new ones to distinguish cases that
/// no programmatic consumer needs to distinguish.
#[derive(Clone, Debug, Deserialize, thiserror::Error, PartialEq, Serialize)]
pub enum Error {
    /// No request handler is registered for the destination.
    #[error("no route to destination {destination:?}")]
    NoRoute { destination: String },
    /// The destination is already bound to a handler of another owner.
    #[error("destination {destination:?} already has a handler (owner {owner})")]
    DuplicateHandler { destination: String, owner: String },
    /// No reply arrived within the caller-supplied deadline.
    #[error("no reply from {destination:?} within {timeout:?}")]
    Timeout { destination: String, timeout: Duration },
    /// The operation observed a cancellation request.
    #[error("operation cancelled")]
    Cancelled,
    /// The resource cannot satisfy the requested amount.
    #[error(
        "insufficient capacity on resource {resource_id}: requested \
         {requested}, available {available}"
    )]
    InsufficientCapacity {
        resource_id: ResourceUuid,
        requested: u64,
        available: u64,
    },
    /// A reservation (or other state machine) was driven through a
    /// transition it does not allow.  This reflects a programming error in
    /// the caller.
    #[error("Invalid State: {message}")]
    InvalidState { message: String },
    /// No resource in scope passed eligibility and capacity filtering.
    #[error("no eligible resource: {message}")]
    NoEligibleResource { message: String },
    /// A flow chain step failed; `cause` is what the step reported.
    #[error("step {step:?} failed: {cause}")]
    StepFailure { step: String, cause: Box<Error> },

    /// An object needed as part of this operation was not found.
    #[error("Object (of type {type_name}) not found: {lookup}")]
    ObjectNotFound { type_name: ResourceType, lookup: String },
    /// An object already exists with the specified identifier.
    #[error("Object (of type {type_name}) already exists: {object_name}")]
    ObjectAlreadyExists { type_name: ResourceType, object_name: String },
    /// The request was well-formed, but the operation cannot be completed
    /// given the current state of the system.
    #[error("Invalid Request: {message}")]
    InvalidRequest { message: String },
    /// A domain-specific failure reported by a handler (e.g., a simulated
    /// storage agent refusing to create a volume).
    #[error("{message}")]
    Handler { message: String },
    /// The system encountered an unhandled operational error.
    #[error("Internal Error: {internal_message}")]
    InternalError { internal_message: String },
}

/// Distinguishes operational failures, which callers are expected to handle,
/// from programming errors, which indicate a bug in the caller or in the
/// orchestration core itself
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Operational,
    Programming,
}

/// Kinds of objects named by [`Error::ObjectNotFound`] and
/// [`Error::ObjectAlreadyExists`]
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Chain,
    Cluster,
    ContextKey,
    Destination,
    Instance,
    Nic,
    Reservation,
    Resource,
    Volume,
    Zone,
}

impl Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ResourceType::Chain => "flow chain",
            ResourceType::Cluster => "cluster",
            ResourceType::ContextKey => "flow context key",
            ResourceType::Destination => "destination",
            ResourceType::Instance => "instance",
            ResourceType::Nic => "network interface",
            ResourceType::Reservation => "reservation",
            ResourceType::Resource => "resource",
            ResourceType::Volume => "volume",
            ResourceType::Zone => "zone",
        };
        f.write_str(label)
    }
}

impl Error {
    /// Returns whether the error is likely transient and could reasonably be
    /// retried by the calling flow
    pub fn retryable(&self) -> bool {
        match self {
            Error::Timeout { .. }
            | Error::InsufficientCapacity { .. }
            | Error::NoEligibleResource { .. } => true,

            Error::StepFailure { cause, .. } => cause.retryable(),

            Error::NoRoute { .. }
            | Error::DuplicateHandler { .. }
            | Error::Cancelled
            | Error::InvalidState { .. }
            | Error::ObjectNotFound { .. }
            | Error::ObjectAlreadyExists { .. }
            | Error::InvalidRequest { .. }
            | Error::Handler { .. }
            | Error::InternalError { .. } => false,
        }
    }

    /// Classifies the error as operational or as a programming error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::InvalidState { .. } | Error::InternalError { .. } => {
                ErrorClass::Programming
            }
            Error::StepFailure { cause, .. } => cause.class(),
            _ => ErrorClass::Operational,
        }
    }

    /// Generates an [`Error::ObjectNotFound`] error for a lookup of `lookup`.
    pub fn not_found(type_name: ResourceType, lookup: impl Display) -> Error {
        Error::ObjectNotFound { type_name, lookup: lookup.to_string() }
    }

    /// Generates an [`Error::ObjectAlreadyExists`] error.
    pub fn already_exists(
        type_name: ResourceType,
        object_name: impl Display,
    ) -> Error {
        Error::ObjectAlreadyExists {
            type_name,
            object_name: object_name.to_string(),
        }
    }

    /// Generates an [`Error::InternalError`] error with the specific message
    ///
    /// InternalError should be used for operational conditions that should
    /// not happen but that we cannot reasonably handle at runtime (e.g.,
    /// deserializing a payload that a well-behaved peer would never send).
    pub fn internal_error(internal_message: &str) -> Error {
        Error::InternalError { internal_message: internal_message.to_owned() }
    }

    /// Generates an [`Error::InvalidRequest`] error with the specific message
    pub fn invalid_request(message: impl Into<String>) -> Error {
        Error::InvalidRequest { message: message.into() }
    }

    /// Generates an [`Error::InvalidState`] error with the specific message
    pub fn invalid_state(message: impl Into<String>) -> Error {
        Error::InvalidState { message: message.into() }
    }

    /// Generates an [`Error::Handler`] error for a domain-specific failure
    pub fn handler(message: impl Into<String>) -> Error {
        Error::Handler { message: message.into() }
    }

    /// Given an [`Error`] with an internal message, return the same error
    /// with `context` prepended to it to provide more context
    ///
    /// If the error has no internal message, then it is returned unchanged.
    pub fn internal_context<C>(self, context: C) -> Error
    where
        C: Display + Send + Sync + 'static,
    {
        match self {
            Error::InternalError { internal_message } => Error::InternalError {
                internal_message: format!("{}: {}", context, internal_message),
            },
            Error::Handler { message } => {
                Error::Handler { message: format!("{}: {}", context, message) }
            }
            Error::NoRoute { .. }
            | Error::DuplicateHandler { .. }
            | Error::Timeout { .. }
            | Error::Cancelled
            | Error::InsufficientCapacity { .. }
            | Error::InvalidState { .. }
            | Error::NoEligibleResource { .. }
            | Error::StepFailure { .. }
            | Error::ObjectNotFound { .. }
            | Error::ObjectAlreadyExists { .. }
            | Error::InvalidRequest { .. } => self,
        }
    }

    /// Returns the innermost cause of nested [`Error::StepFailure`]s.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::StepFailure { cause, .. } => cause.root_cause(),
            other => other,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::internal_error(&e.to_string())
    }
}

/// Implements a pattern similar to `anyhow::Context` for providing extra
/// context for internal error messages
///
/// Unlike `anyhow::Context`, this does not add a new Error to the cause
/// chain.  It replaces the given Error with one that has the modified
/// message.
pub trait InternalContext<T> {
    fn internal_context<C>(self, s: C) -> Result<T, Error>
    where
        C: Display + Send + Sync + 'static;

    fn with_internal_context<C, F>(self, f: F) -> Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T> InternalContext<T> for Result<T, Error> {
    fn internal_context<C>(self, context: C) -> Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
    {
        self.map_err(|error| error.internal_context(context))
    }

    fn with_internal_context<C, F>(self, make_context: F) -> Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        self.map_err(|error| error.internal_context(make_context()))
    }
}
