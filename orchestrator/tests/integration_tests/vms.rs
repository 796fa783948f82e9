// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Creating and destroying VM instances end to end

use crate::common::assert_agents_idle;
use crate::common::test_setup;
use crate::common::vm_params;
use crate::common::EMPTY_CLUSTER;
use crate::common::HOST_LARGE;
use crate::common::HOST_SMALL;
use crate::common::STORAGE_CLUSTER;
use crate::common::STORAGE_ZONE_WIDE;
use assert_matches::assert_matches;
use cirrus_bus::Destination;
use cirrus_bus::SubscriberFn;
use cirrus_common::api::error::Error;
use cirrus_flow::ChainState;
use cirrus_orchestrator::destinations;
use cirrus_orchestrator::ResourceUsageEvent;
use cirrus_orchestrator::UsageAction;
use std::sync::Arc;
use std::sync::Mutex;

#[tokio::test]
async fn test_vm_create_destroy() {
    let cptestctx = test_setup("test_vm_create_destroy").await;
    let orchestrator = &cptestctx.orchestrator;
    let before = cptestctx.snapshots();

    let mut params = vm_params("web-0", 2048, 20);
    params.network = Some("l3-public".to_owned());
    let instance = orchestrator.create_vm(&params).await.unwrap();

    // The most-available host wins, and storage attached to another cluster
    // is never eligible even though it has the most room.
    assert_eq!(instance.host_id, cptestctx.host_id(HOST_LARGE));
    assert_eq!(instance.storage_id, cptestctx.storage_id(STORAGE_ZONE_WIDE));
    assert_eq!(instance.memory_mib, 2048);
    assert_eq!(instance.disk_gib, 20);

    let host = cptestctx.capacity(instance.host_id);
    assert_eq!(host.used, 2048);
    assert_eq!(host.reserved, 0);
    assert_eq!(host.available, 8192 - 2048);
    let storage = cptestctx.capacity(instance.storage_id);
    assert_eq!(storage.used, 20);
    assert_eq!(storage.reserved, 0);

    let agents = orchestrator.agents();
    let running = agents.host.instances();
    assert_eq!(running.len(), 1);
    assert_eq!(running[&instance.id].host_id, instance.host_id);
    let volumes = agents.storage.volumes();
    assert_eq!(volumes[&instance.volume_id].storage_id, instance.storage_id);
    let nic_id = instance.nic_id.expect("instance has no NIC");
    let nics = agents.network.nics();
    assert_eq!(nics[&nic_id].network, "l3-public");
    assert_eq!(nics[&nic_id].attached_to, Some(instance.host_id));

    assert_eq!(orchestrator.instances(), vec![instance.clone()]);
    let status = orchestrator.executor().chain_get(instance.chain_id).unwrap();
    assert_eq!(status.name, "create-vm");
    assert_eq!(status.state, ChainState::Succeeded);
    assert!(orchestrator.orphaned_reservations().is_empty());

    let destroyed = orchestrator.destroy_vm(instance.id).await.unwrap();
    assert_eq!(destroyed, instance);
    assert_eq!(cptestctx.snapshots(), before);
    assert_agents_idle(agents);
    assert!(orchestrator.instances().is_empty());

    let error = orchestrator.destroy_vm(instance.id).await.unwrap_err();
    assert_matches!(error, Error::ObjectNotFound { .. });

    cptestctx.teardown().await;
}

#[tokio::test]
async fn test_vm_create_without_network() {
    let cptestctx = test_setup("test_vm_create_without_network").await;
    let orchestrator = &cptestctx.orchestrator;

    let instance =
        orchestrator.create_vm(&vm_params("batch-0", 1024, 10)).await.unwrap();
    assert_eq!(instance.nic_id, None);
    assert!(orchestrator.agents().network.nics().is_empty());
    assert_eq!(orchestrator.agents().host.instances().len(), 1);

    orchestrator.destroy_vm(instance.id).await.unwrap();
    assert_agents_idle(orchestrator.agents());
    cptestctx.teardown().await;
}

#[tokio::test]
async fn test_vm_placement_constraints() {
    let cptestctx = test_setup("test_vm_placement_constraints").await;
    let orchestrator = &cptestctx.orchestrator;

    let mut params = vm_params("pinned", 1024, 10);
    params.avoid_hosts.insert(cptestctx.host_id(HOST_LARGE));
    let instance = orchestrator.create_vm(&params).await.unwrap();
    assert_eq!(instance.host_id, cptestctx.host_id(HOST_SMALL));

    // The other cluster has storage but no hosts.
    let mut params = vm_params("elsewhere", 1024, 10);
    params.cluster_id = Some(cptestctx.cluster_id(EMPTY_CLUSTER));
    let error = orchestrator.create_vm(&params).await.unwrap_err();
    assert_matches!(
        error,
        Error::StepFailure { ref step, ref cause }
            if step == "allocate-host"
            && matches!(**cause, Error::NoEligibleResource { .. })
    );
    let storage = cptestctx.capacity(cptestctx.storage_id(STORAGE_CLUSTER));
    assert_eq!(storage.used + storage.reserved, 0);

    orchestrator.destroy_vm(instance.id).await.unwrap();
    cptestctx.teardown().await;
}

#[tokio::test]
async fn test_concurrent_creates_respect_capacity() {
    let cptestctx =
        test_setup("test_concurrent_creates_respect_capacity").await;
    let orchestrator = &cptestctx.orchestrator;

    // Room for exactly three of these across both hosts.
    let results = futures::future::join_all((0..4).map(|i| {
        let params = vm_params(&format!("vm-{}", i), 4096, 10);
        async move { orchestrator.create_vm(&params).await }
    }))
    .await;

    let (created, failed): (Vec<_>, Vec<_>) =
        results.into_iter().partition(|r| r.is_ok());
    assert_eq!(created.len(), 3);
    assert_eq!(failed.len(), 1);
    assert_matches!(
        failed[0],
        Err(Error::StepFailure { ref step, ref cause })
            if step == "allocate-host"
            && matches!(**cause, Error::NoEligibleResource { .. })
    );

    let large = cptestctx.capacity(cptestctx.host_id(HOST_LARGE));
    let small = cptestctx.capacity(cptestctx.host_id(HOST_SMALL));
    assert_eq!((large.used, large.available), (8192, 0));
    assert_eq!((small.used, small.available), (4096, 0));
    let storage = cptestctx.capacity(cptestctx.storage_id(STORAGE_ZONE_WIDE));
    assert_eq!(storage.used, 30);
    assert_eq!(orchestrator.agents().storage.volumes().len(), 3);

    for instance in created {
        orchestrator.destroy_vm(instance.unwrap().id).await.unwrap();
    }
    assert_agents_idle(orchestrator.agents());
    cptestctx.teardown().await;
}

#[tokio::test]
async fn test_usage_events() {
    let cptestctx = test_setup("test_usage_events").await;
    let orchestrator = &cptestctx.orchestrator;

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    orchestrator.bus().subscribe(
        &Destination::from_static(destinations::RESOURCE_USAGE),
        SubscriberFn::new(move |event| {
            let sink = Arc::clone(&sink);
            async move {
                let usage: ResourceUsageEvent = event.payload()?;
                sink.lock().unwrap().push(usage);
                Ok(())
            }
        }),
    );
    // A broken subscriber doesn't keep the others from hearing about it.
    orchestrator.bus().subscribe(
        &Destination::from_static(destinations::RESOURCE_USAGE),
        SubscriberFn::new(|_| async { Err(Error::handler("not listening")) }),
    );

    let instance =
        orchestrator.create_vm(&vm_params("metered", 512, 5)).await.unwrap();
    orchestrator.destroy_vm(instance.id).await.unwrap();

    // Events are published before the intent replies.
    let received = received.lock().unwrap().clone();
    let actions: Vec<_> = received.iter().map(|e| e.action).collect();
    assert_eq!(actions, vec![UsageAction::Started, UsageAction::Stopped]);
    for event in &received {
        assert_eq!(event.instance_id, instance.id);
        assert_eq!(event.host_id, instance.host_id);
        assert_eq!(event.memory_mib, 512);
        assert_eq!(event.disk_gib, 5);
    }

    cptestctx.teardown().await;
}
