// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Source of truth for which resources exist and where they live

use async_trait::async_trait;
use cirrus_common::api::error::Error;
use cirrus_common::api::error::ResourceType;
use cirrus_uuid_kinds::ClusterUuid;
use cirrus_uuid_kinds::ResourceUuid;
use cirrus_uuid_kinds::ZoneUuid;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Host,
    PrimaryStorage,
    BackupStorage,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::Host => "host",
            ResourceKind::PrimaryStorage => "primary storage",
            ResourceKind::BackupStorage => "backup storage",
        };
        f.write_str(s)
    }
}

/// Administrative state of a resource
///
/// Only `Enabled` resources receive new allocations.  Existing reservations
/// and used capacity on a resource are unaffected by its state.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    Enabled,
    Disabled,
    Maintenance,
}

impl ResourceState {
    pub fn is_allocatable(&self) -> bool {
        match self {
            ResourceState::Enabled => true,
            ResourceState::Disabled | ResourceState::Maintenance => false,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ResourceDescriptor {
    pub id: ResourceUuid,
    pub name: String,
    pub kind: ResourceKind,
    pub zone_id: ZoneUuid,
    /// storage attached to a whole zone has no cluster
    pub cluster_id: Option<ClusterUuid>,
    pub state: ResourceState,
}

/// Describes the resources that placement may consider
///
/// Capacity itself lives in the [`crate::CapacityTracker`]; the inventory
/// only answers "what exists, of which kind, where, and is it usable".
#[async_trait]
pub trait ResourceInventory: Send + Sync {
    async fn resources(
        &self,
        kind: ResourceKind,
    ) -> Result<Vec<ResourceDescriptor>, Error>;

    async fn resource(
        &self,
        id: ResourceUuid,
    ) -> Result<ResourceDescriptor, Error>;
}

/// [`ResourceInventory`] held in memory
#[derive(Default)]
pub struct InMemoryInventory {
    resources: Mutex<BTreeMap<ResourceUuid, ResourceDescriptor>>,
}

impl InMemoryInventory {
    pub fn new() -> InMemoryInventory {
        InMemoryInventory::default()
    }

    /// Inserts or replaces a resource.
    pub fn upsert(&self, resource: ResourceDescriptor) {
        self.resources.lock().unwrap().insert(resource.id, resource);
    }

    pub fn remove(&self, id: ResourceUuid) -> Option<ResourceDescriptor> {
        self.resources.lock().unwrap().remove(&id)
    }

    pub fn set_state(
        &self,
        id: ResourceUuid,
        state: ResourceState,
    ) -> Result<(), Error> {
        let mut resources = self.resources.lock().unwrap();
        let resource = resources
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(ResourceType::Resource, id))?;
        resource.state = state;
        Ok(())
    }
}

#[async_trait]
impl ResourceInventory for InMemoryInventory {
    async fn resources(
        &self,
        kind: ResourceKind,
    ) -> Result<Vec<ResourceDescriptor>, Error> {
        Ok(self
            .resources
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect())
    }

    async fn resource(
        &self,
        id: ResourceUuid,
    ) -> Result<ResourceDescriptor, Error> {
        self.resources
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(ResourceType::Resource, id))
    }
}
