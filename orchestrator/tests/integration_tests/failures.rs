// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Agent failures during VM creation and destruction

use crate::common::assert_agents_idle;
use crate::common::test_config;
use crate::common::test_setup;
use crate::common::test_setup_with_config;
use crate::common::vm_params;
use crate::common::CLUSTER;
use crate::common::HOST_LARGE;
use crate::common::HOST_SMALL;
use crate::common::STORAGE_ZONE_WIDE;
use assert_matches::assert_matches;
use cirrus_common::api::error::Error;
use cirrus_flow::ChainState;
use cirrus_orchestrator::FaultInjector;
use cirrus_orchestrator::SimAgents;
use cirrus_orchestrator::SimMode;
use cirrus_test_utils::dev::poll::wait_for_condition;
use cirrus_test_utils::dev::poll::CondCheckError;
use cirrus_uuid_kinds::ChainUuid;
use cirrus_uuid_kinds::ClusterUuid;
use std::collections::BTreeSet;
use std::convert::Infallible;
use std::time::Duration;

/// Fails `operation` on one agent, attempts a create, and checks that
/// nothing the chain did survives
#[tokio::test]
async fn test_vm_create_rolls_back_on_agent_failure() {
    let cptestctx =
        test_setup("test_vm_create_rolls_back_on_agent_failure").await;
    let orchestrator = &cptestctx.orchestrator;
    let before = cptestctx.snapshots();

    let cases = [
        ("storage", "create_volume", "create-volume", None),
        ("network", "create_nic", "configure-network", Some("create-nic")),
        ("network", "attach_nic", "configure-network", Some("attach-nic")),
        ("host", "start_instance", "start-instance", None),
    ];

    for (agent, operation, failed_step, nested_step) in cases {
        let agents = orchestrator.agents();
        faults(agents, agent).set_mode(operation, SimMode::Fail);

        let mut params = vm_params(&format!("fail-{}", operation), 2048, 20);
        params.network = Some("l3-private".to_owned());
        let error = orchestrator.create_vm(&params).await.unwrap_err();
        let (step, cause) = match error {
            Error::StepFailure { step, cause } => (step, cause),
            error => panic!("unexpected error for {}: {:?}", operation, error),
        };
        assert_eq!(step, failed_step);
        match nested_step {
            None => assert_matches!(*cause, Error::Handler { .. }),
            Some(nested_step) => assert_matches!(
                *cause,
                Error::StepFailure { ref step, ref cause }
                    if step == nested_step
                    && matches!(**cause, Error::Handler { .. })
            ),
        }

        assert_eq!(
            cptestctx.snapshots(),
            before,
            "after failing {}",
            operation
        );
        assert_agents_idle(agents);
        assert!(orchestrator.instances().is_empty());
        assert!(orchestrator.orphaned_reservations().is_empty());
        agents.reset_faults();
    }

    let failed = orchestrator
        .executor()
        .chain_list()
        .into_iter()
        .filter(|c| c.name == "create-vm" && c.state == ChainState::Failed)
        .count();
    assert_eq!(failed, 4);

    // With the faults cleared the same request goes through.
    let mut params = vm_params("recovered", 2048, 20);
    params.network = Some("l3-private".to_owned());
    let instance = orchestrator.create_vm(&params).await.unwrap();
    orchestrator.destroy_vm(instance.id).await.unwrap();
    assert_eq!(cptestctx.snapshots(), before);

    cptestctx.teardown().await;
}

fn faults<'a>(agents: &'a SimAgents, agent: &str) -> &'a FaultInjector {
    match agent {
        "host" => agents.host.faults(),
        "storage" => agents.storage.faults(),
        "network" => agents.network.faults(),
        _ => panic!("no agent {:?}", agent),
    }
}

#[tokio::test]
async fn test_vm_create_agent_timeout() {
    let mut config = test_config();
    config.intents.agent_timeout_ms = 250;
    let cptestctx =
        test_setup_with_config("test_vm_create_agent_timeout", config).await;
    let orchestrator = &cptestctx.orchestrator;
    let before = cptestctx.snapshots();

    orchestrator
        .agents()
        .host
        .faults()
        .set_mode("start_instance", SimMode::Hang);
    let error = orchestrator
        .create_vm(&vm_params("stuck", 1024, 10))
        .await
        .unwrap_err();
    assert_matches!(
        error,
        Error::StepFailure { ref step, ref cause }
            if step == "start-instance"
            && matches!(**cause, Error::Timeout { .. })
    );
    assert_eq!(cptestctx.snapshots(), before);
    assert_agents_idle(orchestrator.agents());
    // The step gave up on the start, so it asked the agent to stop the
    // instance in case the start goes through after all.
    assert_eq!(
        orchestrator.agents().host.faults().completed("stop_instance"),
        1
    );

    // The hung request doesn't hold up the agent's other work.
    orchestrator.agents().reset_faults();
    let instance =
        orchestrator.create_vm(&vm_params("unstuck", 1024, 10)).await.unwrap();
    orchestrator.destroy_vm(instance.id).await.unwrap();

    cptestctx.teardown().await;
}

/// The agent answers only after the step has stopped waiting, and creates
/// the volume after the chain has already rolled back
#[tokio::test]
async fn test_vm_create_late_agent_reply() {
    let mut config = test_config();
    config.intents.agent_timeout_ms = 100;
    config.simulation.latency_ms = 300;
    let cptestctx =
        test_setup_with_config("test_vm_create_late_agent_reply", config).await;
    let orchestrator = &cptestctx.orchestrator;
    let before = cptestctx.snapshots();

    let error = orchestrator
        .create_vm(&vm_params("late", 1024, 10))
        .await
        .unwrap_err();
    assert_matches!(
        error,
        Error::StepFailure { ref step, ref cause }
            if step == "create-volume"
            && matches!(**cause, Error::Timeout { .. })
    );
    assert_eq!(cptestctx.snapshots(), before);

    // Wait for the agent to finish both the late create and the delete the
    // step sent after giving up on it, in whatever order it handles them.
    let storage = &orchestrator.agents().storage;
    wait_for_condition(
        || async {
            let faults = storage.faults();
            if faults.completed("create_volume") == 1
                && faults.completed("delete_volume") == 1
            {
                Ok(())
            } else {
                Err(CondCheckError::<Infallible>::NotYet)
            }
        },
        &Duration::from_millis(20),
        &Duration::from_secs(10),
    )
    .await
    .expect("storage agent never handled the requests");
    assert_agents_idle(orchestrator.agents());

    cptestctx.teardown().await;
}

/// The storage reservation disappears while the instance starts, so the
/// final commit fails after the host reservation has been committed
#[tokio::test]
async fn test_vm_create_commit_failure_returns_capacity() {
    let mut config = test_config();
    config.simulation.latency_ms = 200;
    let cptestctx = test_setup_with_config(
        "test_vm_create_commit_failure_returns_capacity",
        config,
    )
    .await;
    let orchestrator = &cptestctx.orchestrator;
    let before = cptestctx.snapshots();
    let storage_id = cptestctx.storage_id(STORAGE_ZONE_WIDE);

    let params = vm_params("uncommitted", 1024, 10);
    let create = orchestrator.create_vm(&params);
    let interfere = async {
        let reservation = wait_for_condition(
            || async {
                let starting =
                    orchestrator.executor().chain_list().into_iter().any(|c| {
                        c.name == "create-vm"
                            && c.current_step.as_deref()
                                == Some("start-instance")
                    });
                if !starting {
                    return Err(CondCheckError::<Infallible>::NotYet);
                }
                orchestrator
                    .tracker()
                    .orphaned_reservations(&BTreeSet::new())
                    .into_iter()
                    .find(|r| r.resource_id == storage_id)
                    .ok_or(CondCheckError::NotYet)
            },
            &Duration::from_millis(10),
            &Duration::from_secs(10),
        )
        .await
        .expect("chain never reached start-instance");
        orchestrator.tracker().release(&reservation).unwrap();
    };
    let (result, ()) = tokio::join!(create, interfere);

    assert_matches!(
        result,
        Err(Error::StepFailure { ref step, ref cause })
            if step == "commit-reservations"
            && matches!(**cause, Error::InvalidState { .. })
    );
    // The committed host capacity was returned by the rollback.
    assert_eq!(cptestctx.snapshots(), before);
    assert_agents_idle(orchestrator.agents());
    assert!(orchestrator.instances().is_empty());

    cptestctx.teardown().await;
}

#[tokio::test]
async fn test_vm_destroy_retry_returns_capacity_once() {
    let cptestctx =
        test_setup("test_vm_destroy_retry_returns_capacity_once").await;
    let orchestrator = &cptestctx.orchestrator;
    let tracker = orchestrator.tracker();
    let before = cptestctx.snapshots();
    let large = cptestctx.host_id(HOST_LARGE);
    let storage_id = cptestctx.storage_id(STORAGE_ZONE_WIDE);
    let avoid_small = BTreeSet::from([cptestctx.host_id(HOST_SMALL)]);

    let mut params = vm_params("first", 1024, 10);
    params.avoid_hosts = avoid_small.clone();
    let first = orchestrator.create_vm(&params).await.unwrap();
    assert_eq!(first.host_id, large);
    assert_eq!(first.storage_id, storage_id);

    // With the volume's capacity already gone from the tracker, destroying
    // returns the host's capacity and then fails on the storage.
    tracker.return_capacity(storage_id, 10).unwrap();
    let error = orchestrator.destroy_vm(first.id).await.unwrap_err();
    assert_matches!(
        error,
        Error::StepFailure { ref step, ref cause }
            if step == "return-capacity"
            && matches!(**cause, Error::InvalidState { .. })
    );
    assert_eq!(cptestctx.capacity(large).used, 0);
    let kept = orchestrator.instances();
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].capacity_returned, BTreeSet::from([large]));

    // Put the storage capacity back and start another instance on the same
    // host.  Retrying the destroy must leave that instance's memory alone.
    let reservation =
        tracker.reserve(storage_id, 10, ChainUuid::new_v4()).unwrap();
    tracker.commit(&reservation).unwrap();
    let mut params = vm_params("second", 2048, 10);
    params.avoid_hosts = avoid_small;
    let second = orchestrator.create_vm(&params).await.unwrap();

    orchestrator.destroy_vm(first.id).await.unwrap();
    assert_eq!(cptestctx.capacity(large).used, 2048);
    assert_eq!(cptestctx.capacity(storage_id).used, 10);

    orchestrator.destroy_vm(second.id).await.unwrap();
    assert_eq!(cptestctx.snapshots(), before);
    assert_agents_idle(orchestrator.agents());
    cptestctx.teardown().await;
}

#[tokio::test]
async fn test_vm_destroy_failure_keeps_instance() {
    let cptestctx = test_setup("test_vm_destroy_failure_keeps_instance").await;
    let orchestrator = &cptestctx.orchestrator;
    let before = cptestctx.snapshots();

    let mut params = vm_params("sticky", 1024, 10);
    params.network = Some("l3-public".to_owned());
    let instance = orchestrator.create_vm(&params).await.unwrap();

    orchestrator
        .agents()
        .network
        .faults()
        .set_mode("delete_nic", SimMode::Fail);
    let error = orchestrator.destroy_vm(instance.id).await.unwrap_err();
    assert_matches!(
        error,
        Error::StepFailure { ref step, .. } if step == "remove-nic"
    );
    // Destroying doesn't roll back: the instance stays known, with its
    // capacity still in use, so that it can be destroyed again.
    assert_eq!(orchestrator.instances(), vec![instance.clone()]);
    assert_eq!(cptestctx.capacity(instance.host_id).used, 1024);

    orchestrator.agents().reset_faults();
    orchestrator.destroy_vm(instance.id).await.unwrap();
    assert_eq!(cptestctx.snapshots(), before);
    assert_agents_idle(orchestrator.agents());

    cptestctx.teardown().await;
}

#[tokio::test]
async fn test_vm_create_rejects_bad_requests() {
    let cptestctx = test_setup("test_vm_create_rejects_bad_requests").await;
    let orchestrator = &cptestctx.orchestrator;
    let before = cptestctx.snapshots();

    let error =
        orchestrator.create_vm(&vm_params("tiny", 0, 10)).await.unwrap_err();
    assert_matches!(error, Error::InvalidRequest { .. });

    let mut params = vm_params("lost", 1024, 10);
    params.cluster_id = Some(ClusterUuid::new_v4());
    let error = orchestrator.create_vm(&params).await.unwrap_err();
    assert_matches!(error, Error::ObjectNotFound { .. });

    let error = orchestrator
        .create_vm(&vm_params("huge", 1 << 20, 10))
        .await
        .unwrap_err();
    assert_matches!(
        error,
        Error::StepFailure { ref step, ref cause }
            if step == "allocate-host"
            && matches!(**cause, Error::NoEligibleResource { .. })
    );

    // Disk that no reachable storage can hold fails after the host has been
    // picked, and the host reservation is given back.
    let mut params = vm_params("hoarder", 1024, 200);
    params.cluster_id = Some(cptestctx.cluster_id(CLUSTER));
    let error = orchestrator.create_vm(&params).await.unwrap_err();
    assert_matches!(
        error,
        Error::StepFailure { ref step, ref cause }
            if step == "reserve-storage"
            && matches!(**cause, Error::NoEligibleResource { .. })
    );

    assert_eq!(cptestctx.snapshots(), before);
    assert_agents_idle(orchestrator.agents());
    cptestctx.teardown().await;
}
