// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared setup for the orchestrator integration tests

use cirrus_capacity::CapacitySnapshot;
use cirrus_capacity::ResourceState;
use cirrus_orchestrator::ClusterConfig;
use cirrus_orchestrator::Config;
use cirrus_orchestrator::HostConfig;
use cirrus_orchestrator::InventoryConfig;
use cirrus_orchestrator::Orchestrator;
use cirrus_orchestrator::PrimaryStorageConfig;
use cirrus_orchestrator::SimAgents;
use cirrus_orchestrator::VmCreateParams;
use cirrus_orchestrator::ZoneConfig;
use cirrus_test_utils::dev::test_setup_log;
use cirrus_test_utils::dev::LogContext;
use cirrus_uuid_kinds::ClusterUuid;
use cirrus_uuid_kinds::ResourceUuid;
use cirrus_uuid_kinds::ZoneUuid;
use std::collections::BTreeSet;

pub const ZONE: &str = "zone-1";
/// a zone with no clusters of its own
pub const EMPTY_ZONE: &str = "zone-2";
pub const CLUSTER: &str = "cluster-1";
/// a cluster with no hosts, but with its own storage
pub const EMPTY_CLUSTER: &str = "cluster-2";

/// 8 GiB of memory
pub const HOST_LARGE: &str = "host-large";
/// 4 GiB of memory
pub const HOST_SMALL: &str = "host-small";
/// 100 GiB shared by every cluster in `ZONE`
pub const STORAGE_ZONE_WIDE: &str = "storage-zone-wide";
/// 500 GiB attached to `EMPTY_CLUSTER` only
pub const STORAGE_CLUSTER: &str = "storage-cluster-2";

/// Inventory used by most tests: one zone with a cluster of two hosts and
/// zone-wide storage, plus a second, empty cluster that has storage of its
/// own
pub fn test_config() -> Config {
    let zone_id = ZoneUuid::new_v4();
    let cluster_id = ClusterUuid::new_v4();
    let empty_cluster_id = ClusterUuid::new_v4();
    let host = |name: &str, memory_mib| HostConfig {
        id: ResourceUuid::new_v4(),
        name: name.to_owned(),
        cluster_id,
        memory_mib,
        state: ResourceState::Enabled,
    };
    Config {
        inventory: InventoryConfig {
            zones: vec![
                ZoneConfig { id: zone_id, name: ZONE.to_owned() },
                ZoneConfig {
                    id: ZoneUuid::new_v4(),
                    name: EMPTY_ZONE.to_owned(),
                },
            ],
            clusters: vec![
                ClusterConfig {
                    id: cluster_id,
                    name: CLUSTER.to_owned(),
                    zone_id,
                },
                ClusterConfig {
                    id: empty_cluster_id,
                    name: EMPTY_CLUSTER.to_owned(),
                    zone_id,
                },
            ],
            hosts: vec![host(HOST_LARGE, 8192), host(HOST_SMALL, 4096)],
            primary_storage: vec![
                PrimaryStorageConfig {
                    id: ResourceUuid::new_v4(),
                    name: STORAGE_ZONE_WIDE.to_owned(),
                    zone_id,
                    cluster_id: None,
                    capacity_gib: 100,
                    state: ResourceState::Enabled,
                },
                PrimaryStorageConfig {
                    id: ResourceUuid::new_v4(),
                    name: STORAGE_CLUSTER.to_owned(),
                    zone_id,
                    cluster_id: Some(empty_cluster_id),
                    capacity_gib: 500,
                    state: ResourceState::Enabled,
                },
            ],
        },
        ..Default::default()
    }
}

pub struct OrchestratorTestContext {
    pub orchestrator: Orchestrator,
    pub config: Config,
    pub logctx: LogContext,
}

impl OrchestratorTestContext {
    pub fn zone_id(&self, name: &str) -> ZoneUuid {
        self.config
            .inventory
            .zones
            .iter()
            .find(|z| z.name == name)
            .unwrap_or_else(|| panic!("no zone named {:?}", name))
            .id
    }

    pub fn cluster_id(&self, name: &str) -> ClusterUuid {
        self.config
            .inventory
            .clusters
            .iter()
            .find(|c| c.name == name)
            .unwrap_or_else(|| panic!("no cluster named {:?}", name))
            .id
    }

    pub fn host_id(&self, name: &str) -> ResourceUuid {
        self.config
            .inventory
            .hosts
            .iter()
            .find(|h| h.name == name)
            .unwrap_or_else(|| panic!("no host named {:?}", name))
            .id
    }

    pub fn storage_id(&self, name: &str) -> ResourceUuid {
        self.config
            .inventory
            .primary_storage
            .iter()
            .find(|s| s.name == name)
            .unwrap_or_else(|| panic!("no primary storage named {:?}", name))
            .id
    }

    pub fn snapshots(&self) -> Vec<CapacitySnapshot> {
        self.orchestrator.tracker().snapshots()
    }

    pub fn capacity(&self, resource_id: ResourceUuid) -> CapacitySnapshot {
        self.orchestrator.tracker().query(resource_id).unwrap()
    }

    pub async fn teardown(self) {
        let OrchestratorTestContext { orchestrator, logctx, .. } = self;
        assert_eq!(orchestrator.orphaned_reservations(), Vec::new());
        orchestrator.stop().unwrap();
        logctx.cleanup_successful();
    }
}

pub async fn test_setup(test_name: &str) -> OrchestratorTestContext {
    test_setup_with_config(test_name, test_config()).await
}

pub async fn test_setup_with_config(
    test_name: &str,
    config: Config,
) -> OrchestratorTestContext {
    let logctx = test_setup_log(test_name);
    let orchestrator = Orchestrator::start(&config, &logctx.log)
        .await
        .expect("failed to start orchestrator");
    OrchestratorTestContext { orchestrator, config, logctx }
}

pub fn vm_params(name: &str, memory_mib: u64, disk_gib: u64) -> VmCreateParams {
    VmCreateParams {
        name: name.to_owned(),
        memory_mib,
        disk_gib,
        zone_id: None,
        cluster_id: None,
        network: None,
        avoid_hosts: BTreeSet::new(),
    }
}

/// Asserts that no simulated agent holds any state
pub fn assert_agents_idle(agents: &SimAgents) {
    assert!(
        agents.host.instances().is_empty(),
        "instances left running: {:?}",
        agents.host.instances()
    );
    assert!(
        agents.storage.volumes().is_empty(),
        "volumes left behind: {:?}",
        agents.storage.volumes()
    );
    assert!(
        agents.network.nics().is_empty(),
        "NICs left behind: {:?}",
        agents.network.nics()
    );
}
