// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Creating and destroying VM instances
//!
//! Creating an instance runs the chain
//!
//! ```text
//! allocate-host -> reserve-storage -> create-volume
//!     -> configure-network (create-nic -> attach-nic; only with a network)
//!     -> start-instance -> commit-reservations
//! ```
//!
//! Each step but the last has an undo action.  Capacity stays reserved, not
//! used, until the final step commits it, so a failed chain normally only
//! has to release reservations.

use crate::agents::HostAgentRequest;
use crate::agents::NetworkAgentRequest;
use crate::agents::StorageAgentRequest;
use crate::context::action;
use crate::context::action_no_undo;
use crate::context::ServerContext;
use crate::destinations;
use crate::params::ResourceUsageEvent;
use crate::params::UsageAction;
use crate::params::VmCreateParams;
use crate::params::VmDestroyParams;
use crate::params::VmInstance;
use cirrus_bus::Destination;
use cirrus_bus::Message;
use cirrus_capacity::AllocationRequest;
use cirrus_capacity::Reservation;
use cirrus_capacity::ReservationState;
use cirrus_capacity::ResourceDescriptor;
use cirrus_capacity::ResourceInventory;
use cirrus_capacity::ResourceKind;
use cirrus_capacity::Scope;
use cirrus_common::api::error::Error;
use cirrus_common::api::error::InternalContext;
use cirrus_flow::FlowChain;
use cirrus_flow::FlowContext;
use cirrus_flow::StepContext;
use cirrus_flow::SubChain;
use cirrus_uuid_kinds::InstanceUuid;
use cirrus_uuid_kinds::NicUuid;
use cirrus_uuid_kinds::VolumeUuid;
use slog::info;
use slog::o;
use slog::warn;
use std::collections::BTreeSet;
use std::sync::Arc;

// Flow context keys
const PARAMS: &str = "params";
const INSTANCE_ID: &str = "instance_id";
const HOST: &str = "host";
const HOST_RESERVATION: &str = "host_reservation";
const STORAGE: &str = "storage";
const STORAGE_RESERVATION: &str = "storage_reservation";
const VOLUME_ID: &str = "volume_id";
const NIC_ID: &str = "nic_id";
const INSTANCE: &str = "instance";

/// Handles `orchestrator.vm.create`
pub(crate) async fn vm_create(
    octx: Arc<ServerContext>,
    request: Message,
) -> Result<serde_json::Value, Error> {
    let params: VmCreateParams = request.payload()?;
    if params.memory_mib == 0 || params.disk_gib == 0 {
        return Err(Error::invalid_request(
            "an instance needs non-zero memory and disk",
        ));
    }
    if let Some(cluster_id) = params.cluster_id {
        octx.topology.cluster(cluster_id)?;
    }
    if let Some(zone_id) = params.zone_id {
        octx.topology.zone(zone_id)?;
    }

    let instance_id = InstanceUuid::new_v4();
    let log = octx.log.new(o!(
        "instance_id" => instance_id.to_string(),
        "instance_name" => params.name.clone(),
    ));
    info!(log, "creating instance";
        "memory_mib" => params.memory_mib,
        "disk_gib" => params.disk_gib,
    );

    let initial = FlowContext::new()
        .with(PARAMS, &params)?
        .with(INSTANCE_ID, &instance_id)?;
    let context =
        octx.executor.execute(create_chain(&octx)?, initial).await?;
    let instance = created_instance(instance_id, &params, &context)
        .internal_context("reading result of create-vm")?;
    octx.instances.insert(instance.clone());
    info!(log, "created instance"; "host_id" => %instance.host_id);

    publish_usage(&octx, UsageAction::Started, &instance).await;
    Ok(serde_json::to_value(&instance)?)
}

fn created_instance(
    id: InstanceUuid,
    params: &VmCreateParams,
    context: &FlowContext,
) -> Result<VmInstance, Error> {
    Ok(VmInstance {
        id,
        name: params.name.clone(),
        host_id: context.lookup::<ResourceDescriptor>(HOST)?.id,
        memory_mib: params.memory_mib,
        storage_id: context.lookup::<ResourceDescriptor>(STORAGE)?.id,
        volume_id: context.lookup(VOLUME_ID)?,
        disk_gib: params.disk_gib,
        nic_id: context.lookup_opt(NIC_ID)?,
        chain_id: context.lookup::<Reservation>(HOST_RESERVATION)?.chain_id,
        capacity_returned: BTreeSet::new(),
    })
}

fn create_chain(octx: &Arc<ServerContext>) -> Result<FlowChain, Error> {
    let network = SubChain::new(
        "configure-network",
        vec![
            action(octx, "create-nic", vmc_create_nic, vmc_create_nic_undo),
            action(octx, "attach-nic", vmc_attach_nic, vmc_attach_nic_undo),
        ],
    )?
    .when(|sctx| {
        sctx.lookup::<VmCreateParams>(PARAMS)
            .map(|params| params.network.is_some())
            .unwrap_or(false)
    });

    Ok(FlowChain::builder("create-vm")
        .step(action(
            octx,
            "allocate-host",
            vmc_allocate_host,
            vmc_release_host,
        ))
        .step(action(
            octx,
            "reserve-storage",
            vmc_reserve_storage,
            vmc_release_storage,
        ))
        .step(action(
            octx,
            "create-volume",
            vmc_create_volume,
            vmc_create_volume_undo,
        ))
        .step(network.into_flow())
        .step(action(
            octx,
            "start-instance",
            vmc_start_instance,
            vmc_start_instance_undo,
        ))
        .step(action_no_undo(octx, "commit-reservations", vmc_commit))
        .build()?)
}

async fn vmc_allocate_host(
    octx: Arc<ServerContext>,
    sctx: StepContext,
) -> Result<(), Error> {
    let params: VmCreateParams = sctx.lookup(PARAMS)?;
    let scope = match (params.cluster_id, params.zone_id) {
        (Some(cluster_id), _) => Scope::cluster(cluster_id),
        (None, Some(zone_id)) => Scope::zone(zone_id),
        (None, None) => Scope::any(),
    };
    let scope = params
        .avoid_hosts
        .iter()
        .fold(scope, |scope, host_id| scope.avoiding(*host_id));

    let allocation = octx
        .allocator
        .allocate(&AllocationRequest {
            kind: ResourceKind::Host,
            required_capacity: params.memory_mib,
            scope,
            strategy: octx.strategy.build(),
            chain_id: sctx.chain_id(),
        })
        .await?;
    sctx.insert(HOST, &allocation.resource)?;
    sctx.insert(HOST_RESERVATION, &allocation.reservation)
}

async fn vmc_release_host(
    octx: Arc<ServerContext>,
    sctx: StepContext,
) -> anyhow::Result<()> {
    if let Some(reservation) =
        sctx.lookup_opt::<Reservation>(HOST_RESERVATION)?
    {
        give_back(&octx, &reservation)?;
    }
    Ok(())
}

async fn vmc_reserve_storage(
    octx: Arc<ServerContext>,
    sctx: StepContext,
) -> Result<(), Error> {
    let params: VmCreateParams = sctx.lookup(PARAMS)?;
    let host: ResourceDescriptor = sctx.lookup(HOST)?;

    // The volume must be reachable from the host: storage in the host's
    // zone that is either zone-wide or attached to the host's cluster.
    let scope = octx
        .inventory
        .resources(ResourceKind::PrimaryStorage)
        .await?
        .into_iter()
        .filter(|storage| {
            storage.cluster_id.is_some()
                && storage.cluster_id != host.cluster_id
        })
        .fold(Scope::zone(host.zone_id), |scope, storage| {
            scope.avoiding(storage.id)
        });

    let allocation = octx
        .allocator
        .allocate(&AllocationRequest {
            kind: ResourceKind::PrimaryStorage,
            required_capacity: params.disk_gib,
            scope,
            strategy: octx.strategy.build(),
            chain_id: sctx.chain_id(),
        })
        .await?;
    sctx.insert(STORAGE, &allocation.resource)?;
    sctx.insert(STORAGE_RESERVATION, &allocation.reservation)
}

async fn vmc_release_storage(
    octx: Arc<ServerContext>,
    sctx: StepContext,
) -> anyhow::Result<()> {
    if let Some(reservation) =
        sctx.lookup_opt::<Reservation>(STORAGE_RESERVATION)?
    {
        give_back(&octx, &reservation)?;
    }
    Ok(())
}

/// Undoes a reservation made by this chain
///
/// The commit step may have committed some reservations before failing, so
/// a reservation the tracker reports as Committed has its capacity returned
/// rather than released.
fn give_back(
    octx: &ServerContext,
    reservation: &Reservation,
) -> Result<(), Error> {
    let state = octx.tracker.reservation(reservation.id).map(|r| r.state);
    if state == Some(ReservationState::Committed) {
        octx.tracker
            .return_capacity(reservation.resource_id, reservation.amount)?;
    } else {
        octx.tracker.release(reservation)?;
    }
    Ok(())
}

async fn vmc_create_volume(
    octx: Arc<ServerContext>,
    sctx: StepContext,
) -> Result<(), Error> {
    let params: VmCreateParams = sctx.lookup(PARAMS)?;
    let storage: ResourceDescriptor = sctx.lookup(STORAGE)?;
    let volume_id = VolumeUuid::new_v4();
    octx.call_agent_or_compensate(
        &sctx,
        destinations::STORAGE_AGENT,
        &StorageAgentRequest::CreateVolume {
            volume_id,
            storage_id: storage.id,
            size_gib: params.disk_gib,
        },
        &StorageAgentRequest::DeleteVolume { volume_id },
    )
    .await?;
    sctx.insert(VOLUME_ID, &volume_id)
}

async fn vmc_create_volume_undo(
    octx: Arc<ServerContext>,
    sctx: StepContext,
) -> anyhow::Result<()> {
    if let Some(volume_id) = sctx.lookup_opt::<VolumeUuid>(VOLUME_ID)? {
        octx.call_agent(
            &sctx,
            destinations::STORAGE_AGENT,
            &StorageAgentRequest::DeleteVolume { volume_id },
        )
        .await?;
    }
    Ok(())
}

async fn vmc_create_nic(
    octx: Arc<ServerContext>,
    sctx: StepContext,
) -> Result<(), Error> {
    let params: VmCreateParams = sctx.lookup(PARAMS)?;
    let network = params.network.ok_or_else(|| {
        Error::internal_error("configuring network without a network")
    })?;
    let nic_id = NicUuid::new_v4();
    octx.call_agent_or_compensate(
        &sctx,
        destinations::NETWORK_AGENT,
        &NetworkAgentRequest::CreateNic {
            nic_id,
            instance_id: sctx.lookup(INSTANCE_ID)?,
            network,
        },
        &NetworkAgentRequest::DeleteNic { nic_id },
    )
    .await?;
    sctx.insert(NIC_ID, &nic_id)
}

async fn vmc_create_nic_undo(
    octx: Arc<ServerContext>,
    sctx: StepContext,
) -> anyhow::Result<()> {
    if let Some(nic_id) = sctx.lookup_opt::<NicUuid>(NIC_ID)? {
        octx.call_agent(
            &sctx,
            destinations::NETWORK_AGENT,
            &NetworkAgentRequest::DeleteNic { nic_id },
        )
        .await?;
        sctx.remove(NIC_ID);
    }
    Ok(())
}

async fn vmc_attach_nic(
    octx: Arc<ServerContext>,
    sctx: StepContext,
) -> Result<(), Error> {
    let host: ResourceDescriptor = sctx.lookup(HOST)?;
    octx.call_agent(
        &sctx,
        destinations::NETWORK_AGENT,
        &NetworkAgentRequest::AttachNic {
            nic_id: sctx.lookup(NIC_ID)?,
            host_id: host.id,
        },
    )
    .await
}

async fn vmc_attach_nic_undo(
    octx: Arc<ServerContext>,
    sctx: StepContext,
) -> anyhow::Result<()> {
    octx.call_agent(
        &sctx,
        destinations::NETWORK_AGENT,
        &NetworkAgentRequest::DetachNic { nic_id: sctx.lookup(NIC_ID)? },
    )
    .await?;
    Ok(())
}

async fn vmc_start_instance(
    octx: Arc<ServerContext>,
    sctx: StepContext,
) -> Result<(), Error> {
    let params: VmCreateParams = sctx.lookup(PARAMS)?;
    let host: ResourceDescriptor = sctx.lookup(HOST)?;
    let instance_id = sctx.lookup(INSTANCE_ID)?;
    octx.call_agent_or_compensate(
        &sctx,
        destinations::HOST_AGENT,
        &HostAgentRequest::StartInstance {
            instance_id,
            host_id: host.id,
            memory_mib: params.memory_mib,
        },
        &HostAgentRequest::StopInstance { instance_id },
    )
    .await
}

async fn vmc_start_instance_undo(
    octx: Arc<ServerContext>,
    sctx: StepContext,
) -> anyhow::Result<()> {
    octx.call_agent(
        &sctx,
        destinations::HOST_AGENT,
        &HostAgentRequest::StopInstance {
            instance_id: sctx.lookup(INSTANCE_ID)?,
        },
    )
    .await?;
    Ok(())
}

async fn vmc_commit(
    octx: Arc<ServerContext>,
    sctx: StepContext,
) -> Result<(), Error> {
    // Nothing after this step can fail.  If the second commit fails, the
    // rollback of the earlier steps returns what the first one committed.
    for key in [HOST_RESERVATION, STORAGE_RESERVATION] {
        let reservation: Reservation = sctx.lookup(key)?;
        let committed = octx.tracker.commit(&reservation)?;
        sctx.insert(key, &committed)?;
    }
    Ok(())
}

/// Handles `orchestrator.vm.destroy`
///
/// Destroying has no rollback.  A failed destroy leaves the instance in
/// place to be destroyed again: the agent requests are safe to repeat, and
/// the instance records which capacity has already been returned so that
/// none is returned twice.
pub(crate) async fn vm_destroy(
    octx: Arc<ServerContext>,
    request: Message,
) -> Result<serde_json::Value, Error> {
    let params: VmDestroyParams = request.payload()?;
    let instance = octx.instances.take(params.instance_id)?;
    let log = octx.log.new(o!("instance_id" => instance.id.to_string()));
    info!(log, "destroying instance");

    let chain = FlowChain::builder("destroy-vm")
        .step(action_no_undo(&octx, "stop-instance", vmd_stop_instance))
        .step_if(
            instance.nic_id.is_some(),
            action_no_undo(&octx, "remove-nic", vmd_remove_nic),
        )
        .step(action_no_undo(&octx, "delete-volume", vmd_delete_volume))
        .step(action_no_undo(&octx, "return-capacity", vmd_return_capacity))
        .build()?;
    let initial = FlowContext::new().with(INSTANCE, &instance)?;
    let stopped = octx
        .executor
        .prepare(chain, initial)
        .start()
        .wait_until_stopped()
        .await;
    let progress = stopped.report().context.lookup::<VmInstance>(INSTANCE);
    if let Err(error) = stopped.into_result() {
        warn!(log, "failed to destroy instance"; "error" => %error);
        octx.instances.insert(progress.unwrap_or(instance));
        return Err(error.into());
    }

    info!(log, "destroyed instance");
    publish_usage(&octx, UsageAction::Stopped, &instance).await;
    Ok(serde_json::to_value(&instance)?)
}

async fn vmd_stop_instance(
    octx: Arc<ServerContext>,
    sctx: StepContext,
) -> Result<(), Error> {
    let instance: VmInstance = sctx.lookup(INSTANCE)?;
    octx.call_agent(
        &sctx,
        destinations::HOST_AGENT,
        &HostAgentRequest::StopInstance { instance_id: instance.id },
    )
    .await
}

async fn vmd_remove_nic(
    octx: Arc<ServerContext>,
    sctx: StepContext,
) -> Result<(), Error> {
    let instance: VmInstance = sctx.lookup(INSTANCE)?;
    if let Some(nic_id) = instance.nic_id {
        octx.call_agent(
            &sctx,
            destinations::NETWORK_AGENT,
            &NetworkAgentRequest::DetachNic { nic_id },
        )
        .await?;
        octx.call_agent(
            &sctx,
            destinations::NETWORK_AGENT,
            &NetworkAgentRequest::DeleteNic { nic_id },
        )
        .await?;
    }
    Ok(())
}

async fn vmd_delete_volume(
    octx: Arc<ServerContext>,
    sctx: StepContext,
) -> Result<(), Error> {
    let instance: VmInstance = sctx.lookup(INSTANCE)?;
    octx.call_agent(
        &sctx,
        destinations::STORAGE_AGENT,
        &StorageAgentRequest::DeleteVolume { volume_id: instance.volume_id },
    )
    .await
}

async fn vmd_return_capacity(
    octx: Arc<ServerContext>,
    sctx: StepContext,
) -> Result<(), Error> {
    let mut instance: VmInstance = sctx.lookup(INSTANCE)?;
    let claims = [
        (instance.host_id, instance.memory_mib),
        (instance.storage_id, instance.disk_gib),
    ];
    for (resource_id, amount) in claims {
        if instance.capacity_returned.contains(&resource_id) {
            continue;
        }
        octx.tracker.return_capacity(resource_id, amount)?;
        instance.capacity_returned.insert(resource_id);
        sctx.insert(INSTANCE, &instance)?;
    }
    Ok(())
}

async fn publish_usage(
    octx: &ServerContext,
    action: UsageAction,
    instance: &VmInstance,
) {
    let event = match Message::event(
        Destination::from_static(destinations::RESOURCE_USAGE),
        &ResourceUsageEvent::for_instance(action, instance),
    ) {
        Ok(event) => event,
        Err(error) => {
            warn!(octx.log, "failed to build usage event"; "error" => %error);
            return;
        }
    };
    match octx.bus.publish(event, None).await {
        Ok(failures) => {
            for failure in failures {
                warn!(octx.log, "usage event not delivered";
                    "subscription_id" => %failure.subscription_id,
                    "error" => %failure.error,
                );
            }
        }
        Err(error) => {
            warn!(octx.log, "failed to publish usage event"; "error" => %error);
        }
    }
}
