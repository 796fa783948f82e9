// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Data shared by the steps of one flow chain

use cirrus_common::api::error::Error;
use cirrus_common::api::error::ResourceType;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;

/// String-keyed values shared by the steps of a chain
///
/// Values are stored as JSON so that steps can exchange typed data (a
/// reservation, a volume id) without the chain knowing their types.  Each
/// key is conventionally written by one step and read by later steps and by
/// that step's own rollback.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct FlowContext {
    values: BTreeMap<String, serde_json::Value>,
}

impl FlowContext {
    pub fn new() -> FlowContext {
        FlowContext::default()
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub fn insert<T: Serialize>(
        &mut self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<(), Error> {
        let key = key.into();
        let value = serde_json::to_value(value).map_err(|e| {
            Error::internal_error(&format!(
                "serializing flow context value {:?}: {}",
                key, e
            ))
        })?;
        self.values.insert(key, value);
        Ok(())
    }

    /// Like [`FlowContext::insert`], for use while building an initial
    /// context.
    pub fn with<T: Serialize>(
        mut self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<FlowContext, Error> {
        self.insert(key, value)?;
        Ok(self)
    }

    /// Fetches the value stored under `key`.  Missing keys are an error.
    pub fn lookup<T: DeserializeOwned>(&self, key: &str) -> Result<T, Error> {
        self.lookup_opt(key)?
            .ok_or_else(|| Error::not_found(ResourceType::ContextKey, key))
    }

    /// Fetches the value stored under `key`, if any.
    pub fn lookup_opt<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, Error> {
        self.values
            .get(key)
            .map(|value| {
                serde_json::from_value(value.clone()).map_err(|e| {
                    Error::internal_error(&format!(
                        "flow context value {:?} has unexpected type: {}",
                        key, e
                    ))
                })
            })
            .transpose()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.values.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(|k| k.as_str())
    }
}
