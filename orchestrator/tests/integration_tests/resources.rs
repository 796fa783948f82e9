// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Adding hosts and primary storage through intents

use crate::common::test_setup;
use crate::common::vm_params;
use crate::common::CLUSTER;
use crate::common::EMPTY_CLUSTER;
use crate::common::EMPTY_ZONE;
use crate::common::STORAGE_CLUSTER;
use crate::common::ZONE;
use assert_matches::assert_matches;
use cirrus_capacity::ResourceInventory;
use cirrus_capacity::ResourceKind;
use cirrus_capacity::ResourceState;
use cirrus_common::api::error::Error;
use cirrus_orchestrator::HostAddParams;
use cirrus_orchestrator::PrimaryStorageAddParams;
use cirrus_uuid_kinds::ClusterUuid;

#[tokio::test]
async fn test_host_add() {
    let cptestctx = test_setup("test_host_add").await;
    let orchestrator = &cptestctx.orchestrator;

    let host = orchestrator
        .add_host(&HostAddParams {
            name: "host-new".to_owned(),
            cluster_id: cptestctx.cluster_id(EMPTY_CLUSTER),
            memory_mib: 16384,
        })
        .await
        .unwrap();
    assert_eq!(host.kind, ResourceKind::Host);
    assert_eq!(host.zone_id, cptestctx.zone_id(ZONE));
    assert_eq!(host.cluster_id, Some(cptestctx.cluster_id(EMPTY_CLUSTER)));
    assert_eq!(host.state, ResourceState::Enabled);

    let capacity = cptestctx.capacity(host.id);
    assert_eq!(capacity.total, 16384);
    assert_eq!(capacity.available, 16384);
    let hosts =
        orchestrator.inventory().resources(ResourceKind::Host).await.unwrap();
    assert!(hosts.contains(&host));

    // The new host is placeable, and its cluster's own storage is reachable
    // from it.
    let mut params = vm_params("on-new-host", 12288, 300);
    params.cluster_id = Some(cptestctx.cluster_id(EMPTY_CLUSTER));
    let instance = orchestrator.create_vm(&params).await.unwrap();
    assert_eq!(instance.host_id, host.id);
    assert_eq!(instance.storage_id, cptestctx.storage_id(STORAGE_CLUSTER));
    orchestrator.destroy_vm(instance.id).await.unwrap();

    cptestctx.teardown().await;
}

#[tokio::test]
async fn test_host_add_rejected() {
    let cptestctx = test_setup("test_host_add_rejected").await;
    let orchestrator = &cptestctx.orchestrator;
    let before = cptestctx.snapshots();

    let error = orchestrator
        .add_host(&HostAddParams {
            name: "host-nowhere".to_owned(),
            cluster_id: ClusterUuid::new_v4(),
            memory_mib: 1024,
        })
        .await
        .unwrap_err();
    assert_matches!(error, Error::ObjectNotFound { .. });

    let error = orchestrator
        .add_host(&HostAddParams {
            name: "host-empty".to_owned(),
            cluster_id: cptestctx.cluster_id(CLUSTER),
            memory_mib: 0,
        })
        .await
        .unwrap_err();
    assert_matches!(error, Error::InvalidRequest { .. });

    assert_eq!(cptestctx.snapshots(), before);
    let hosts =
        orchestrator.inventory().resources(ResourceKind::Host).await.unwrap();
    assert_eq!(hosts.len(), cptestctx.config.inventory.hosts.len());

    cptestctx.teardown().await;
}

#[tokio::test]
async fn test_primary_storage_add() {
    let cptestctx = test_setup("test_primary_storage_add").await;
    let orchestrator = &cptestctx.orchestrator;

    let storage = orchestrator
        .add_primary_storage(&PrimaryStorageAddParams {
            name: "storage-new".to_owned(),
            zone_id: cptestctx.zone_id(ZONE),
            cluster_id: Some(cptestctx.cluster_id(CLUSTER)),
            capacity_gib: 1000,
        })
        .await
        .unwrap();
    assert_eq!(storage.kind, ResourceKind::PrimaryStorage);
    assert_eq!(cptestctx.capacity(storage.id).total, 1000);

    // It now has the most room of any storage reachable from the cluster.
    let mut params = vm_params("big-disk", 1024, 500);
    params.cluster_id = Some(cptestctx.cluster_id(CLUSTER));
    let instance = orchestrator.create_vm(&params).await.unwrap();
    assert_eq!(instance.storage_id, storage.id);
    orchestrator.destroy_vm(instance.id).await.unwrap();

    // A cluster can only have storage from its own zone.
    let error = orchestrator
        .add_primary_storage(&PrimaryStorageAddParams {
            name: "storage-misplaced".to_owned(),
            zone_id: cptestctx.zone_id(EMPTY_ZONE),
            cluster_id: Some(cptestctx.cluster_id(CLUSTER)),
            capacity_gib: 1000,
        })
        .await
        .unwrap_err();
    assert_matches!(error, Error::InvalidRequest { .. });

    cptestctx.teardown().await;
}
