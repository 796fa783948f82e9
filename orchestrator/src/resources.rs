// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Adding hosts and primary storage

use crate::context::action;
use crate::context::ServerContext;
use crate::params::HostAddParams;
use crate::params::PrimaryStorageAddParams;
use cirrus_bus::Message;
use cirrus_capacity::ResourceDescriptor;
use cirrus_capacity::ResourceKind;
use cirrus_capacity::ResourceState;
use cirrus_common::api::error::Error;
use cirrus_flow::FlowChain;
use cirrus_flow::FlowContext;
use cirrus_flow::StepContext;
use cirrus_uuid_kinds::ResourceUuid;
use slog::info;
use std::sync::Arc;

// Flow context keys
const RESOURCE: &str = "resource";
const TOTAL: &str = "total";

/// Handles `orchestrator.host.add`
pub(crate) async fn host_add(
    octx: Arc<ServerContext>,
    request: Message,
) -> Result<serde_json::Value, Error> {
    let params: HostAddParams = request.payload()?;
    let cluster = octx.topology.cluster(params.cluster_id)?;
    let host = ResourceDescriptor {
        id: ResourceUuid::new_v4(),
        name: params.name,
        kind: ResourceKind::Host,
        zone_id: cluster.zone_id,
        cluster_id: Some(cluster.id),
        state: ResourceState::Enabled,
    };
    let host = add_resource(&octx, host, params.memory_mib).await?;
    Ok(serde_json::to_value(&host)?)
}

/// Handles `orchestrator.primary-storage.add`
pub(crate) async fn primary_storage_add(
    octx: Arc<ServerContext>,
    request: Message,
) -> Result<serde_json::Value, Error> {
    let params: PrimaryStorageAddParams = request.payload()?;
    octx.topology.zone(params.zone_id)?;
    if let Some(cluster_id) = params.cluster_id {
        let cluster = octx.topology.cluster(cluster_id)?;
        if cluster.zone_id != params.zone_id {
            return Err(Error::invalid_request(format!(
                "cluster {} is not in zone {}",
                cluster_id, params.zone_id
            )));
        }
    }
    let storage = ResourceDescriptor {
        id: ResourceUuid::new_v4(),
        name: params.name,
        kind: ResourceKind::PrimaryStorage,
        zone_id: params.zone_id,
        cluster_id: params.cluster_id,
        state: ResourceState::Enabled,
    };
    let storage = add_resource(&octx, storage, params.capacity_gib).await?;
    Ok(serde_json::to_value(&storage)?)
}

/// Makes `resource` available for placement with `total` units of capacity
///
/// The capacity is registered before the resource shows up in the
/// inventory, so the allocator never sees a resource it can't query.
pub(crate) async fn add_resource(
    octx: &Arc<ServerContext>,
    resource: ResourceDescriptor,
    total: u64,
) -> Result<ResourceDescriptor, Error> {
    if total == 0 {
        return Err(Error::invalid_request(format!(
            "{} {:?} has no capacity",
            resource.kind, resource.name
        )));
    }
    let chain_name = format!("add-{}", kind_label(resource.kind));
    let chain = FlowChain::builder(chain_name)
        .step(action(
            octx,
            "register-capacity",
            ra_register_capacity,
            ra_register_capacity_undo,
        ))
        .step(action(
            octx,
            "add-to-inventory",
            ra_add_to_inventory,
            ra_add_to_inventory_undo,
        ))
        .build()?;
    let initial =
        FlowContext::new().with(RESOURCE, &resource)?.with(TOTAL, &total)?;
    octx.executor.execute(chain, initial).await?;
    info!(octx.log, "added resource";
        "kind" => %resource.kind,
        "resource_id" => %resource.id,
        "name" => &resource.name,
        "total" => total,
    );
    Ok(resource)
}

fn kind_label(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::Host => "host",
        ResourceKind::PrimaryStorage => "primary-storage",
        ResourceKind::BackupStorage => "backup-storage",
    }
}

async fn ra_register_capacity(
    octx: Arc<ServerContext>,
    sctx: StepContext,
) -> Result<(), Error> {
    let resource: ResourceDescriptor = sctx.lookup(RESOURCE)?;
    let total: u64 = sctx.lookup(TOTAL)?;
    octx.tracker.register(
        resource.id,
        total,
        octx.capacity.ratio_for(resource.kind),
    )?;
    Ok(())
}

async fn ra_register_capacity_undo(
    octx: Arc<ServerContext>,
    sctx: StepContext,
) -> anyhow::Result<()> {
    let resource: ResourceDescriptor = sctx.lookup(RESOURCE)?;
    octx.tracker.unregister(resource.id)?;
    Ok(())
}

async fn ra_add_to_inventory(
    octx: Arc<ServerContext>,
    sctx: StepContext,
) -> Result<(), Error> {
    let resource: ResourceDescriptor = sctx.lookup(RESOURCE)?;
    octx.inventory.upsert(resource);
    Ok(())
}

async fn ra_add_to_inventory_undo(
    octx: Arc<ServerContext>,
    sctx: StepContext,
) -> anyhow::Result<()> {
    let resource: ResourceDescriptor = sctx.lookup(RESOURCE)?;
    octx.inventory.remove(resource.id);
    Ok(())
}
