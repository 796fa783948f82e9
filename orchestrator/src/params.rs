// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Request and reply bodies of the orchestrator's intents, and the events it
//! publishes

use cirrus_uuid_kinds::ChainUuid;
use cirrus_uuid_kinds::ClusterUuid;
use cirrus_uuid_kinds::InstanceUuid;
use cirrus_uuid_kinds::NicUuid;
use cirrus_uuid_kinds::ResourceUuid;
use cirrus_uuid_kinds::VolumeUuid;
use cirrus_uuid_kinds::ZoneUuid;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeSet;

/// Body of an `orchestrator.vm.create` request
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct VmCreateParams {
    pub name: String,
    pub memory_mib: u64,
    /// size of the root volume
    pub disk_gib: u64,
    /// restrict placement to one zone
    #[serde(default)]
    pub zone_id: Option<ZoneUuid>,
    /// restrict placement to one cluster (takes precedence over `zone_id`)
    #[serde(default)]
    pub cluster_id: Option<ClusterUuid>,
    /// L3 network to attach the instance to, if any
    #[serde(default)]
    pub network: Option<String>,
    /// hosts not to place the instance on
    #[serde(default)]
    pub avoid_hosts: BTreeSet<ResourceUuid>,
}

/// A running VM instance and everything provisioned for it.  This is the
/// reply to `orchestrator.vm.create`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct VmInstance {
    pub id: InstanceUuid,
    pub name: String,
    pub host_id: ResourceUuid,
    pub memory_mib: u64,
    pub storage_id: ResourceUuid,
    pub volume_id: VolumeUuid,
    pub disk_gib: u64,
    pub nic_id: Option<NicUuid>,
    /// the chain that created the instance
    pub chain_id: ChainUuid,
    /// resources whose capacity an unfinished destroy has already given back
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub capacity_returned: BTreeSet<ResourceUuid>,
}

/// Body of an `orchestrator.vm.destroy` request
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct VmDestroyParams {
    pub instance_id: InstanceUuid,
}

/// Body of an `orchestrator.host.add` request
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct HostAddParams {
    pub name: String,
    pub cluster_id: ClusterUuid,
    pub memory_mib: u64,
}

/// Body of an `orchestrator.primary-storage.add` request
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct PrimaryStorageAddParams {
    pub name: String,
    pub zone_id: ZoneUuid,
    #[serde(default)]
    pub cluster_id: Option<ClusterUuid>,
    pub capacity_gib: u64,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageAction {
    Started,
    Stopped,
}

/// Published on `event.resource-usage` whenever an instance starts or stops
/// consuming capacity
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ResourceUsageEvent {
    pub action: UsageAction,
    pub instance_id: InstanceUuid,
    pub host_id: ResourceUuid,
    pub memory_mib: u64,
    pub storage_id: ResourceUuid,
    pub disk_gib: u64,
}

impl ResourceUsageEvent {
    pub fn for_instance(
        action: UsageAction,
        instance: &VmInstance,
    ) -> ResourceUsageEvent {
        ResourceUsageEvent {
            action,
            instance_id: instance.id,
            host_id: instance.host_id,
            memory_mib: instance.memory_mib,
            storage_id: instance.storage_id,
            disk_gib: instance.disk_gib,
        }
    }
}
