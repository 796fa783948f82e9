// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared state used by intent handlers and their chain steps

use crate::config::ClusterConfig;
use crate::config::InventoryConfig;
use crate::config::ZoneConfig;
use crate::params::VmInstance;
use cirrus_bus::Destination;
use cirrus_bus::MessageBus;
use cirrus_capacity::CapacityConfig;
use cirrus_capacity::CapacityTracker;
use cirrus_capacity::InMemoryInventory;
use cirrus_capacity::ResourceAllocator;
use cirrus_capacity::StrategyKind;
use cirrus_common::api::error::Error;
use cirrus_common::api::error::ResourceType;
use cirrus_flow::ChainExecutor;
use cirrus_flow::Flow;
use cirrus_flow::FlowFunc;
use cirrus_flow::StepContext;
use cirrus_uuid_kinds::ClusterUuid;
use cirrus_uuid_kinds::InstanceUuid;
use cirrus_uuid_kinds::ZoneUuid;
use serde::Serialize;
use slog::info;
use slog::warn;
use slog::Logger;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

/// Shared state used by intent handlers
pub struct ServerContext {
    pub log: Logger,
    pub bus: MessageBus,
    pub tracker: Arc<CapacityTracker>,
    pub inventory: Arc<InMemoryInventory>,
    pub allocator: ResourceAllocator,
    pub executor: ChainExecutor,
    pub topology: Topology,
    pub instances: InstanceStore,
    pub capacity: CapacityConfig,
    pub strategy: StrategyKind,
    /// deadline for each request sent to an agent
    pub agent_timeout: Duration,
}

impl ServerContext {
    /// Sends `body` to an agent and waits for it to finish, giving up if the
    /// chain is cancelled first
    pub async fn call_agent<T>(
        &self,
        sctx: &StepContext,
        agent: &'static str,
        body: &T,
    ) -> Result<(), Error>
    where
        T: Serialize + Sync,
    {
        let destination = Destination::from_static(agent);
        sctx.until_cancelled(self.bus.call::<_, serde_json::Value>(
            &destination,
            body,
            Some(self.agent_timeout),
        ))
        .await
        .map(|_| ())
    }

    /// Like [`ServerContext::call_agent()`], for a request that creates
    /// something on the agent
    ///
    /// If no reply arrives (the request timed out or the chain was
    /// cancelled), the agent may still carry the request out later, after
    /// the chain has rolled back.  In that case `undo` is sent as well,
    /// whether or not the chain has been cancelled.  Agents refuse to create
    /// an object they have already been asked to delete, so the two requests
    /// may be handled in either order.
    pub async fn call_agent_or_compensate<T, U>(
        &self,
        sctx: &StepContext,
        agent: &'static str,
        body: &T,
        undo: &U,
    ) -> Result<(), Error>
    where
        T: Serialize + Sync,
        U: Serialize + Sync,
    {
        let result = self.call_agent(sctx, agent, body).await;
        let Err(error @ (Error::Timeout { .. } | Error::Cancelled)) = &result
        else {
            return result;
        };

        let destination = Destination::from_static(agent);
        match self
            .bus
            .call::<_, serde_json::Value>(
                &destination,
                undo,
                Some(self.agent_timeout),
            )
            .await
        {
            Ok(_) => {
                info!(sctx.log(), "compensated for unanswered agent request";
                    "agent" => agent,
                    "error" => %error,
                );
            }
            Err(undo_error) => {
                warn!(sctx.log(), "failed to compensate for agent request";
                    "agent" => agent,
                    "error" => %error,
                    "undo_error" => %undo_error,
                );
            }
        }
        result
    }
}

/// Zones and clusters, fixed at startup
pub struct Topology {
    zones: BTreeMap<ZoneUuid, ZoneConfig>,
    clusters: BTreeMap<ClusterUuid, ClusterConfig>,
}

impl Topology {
    pub fn from_config(config: &InventoryConfig) -> Result<Topology, Error> {
        let zones: BTreeMap<_, _> =
            config.zones.iter().map(|z| (z.id, z.clone())).collect();
        let mut clusters = BTreeMap::new();
        for cluster in &config.clusters {
            if !zones.contains_key(&cluster.zone_id) {
                return Err(Error::invalid_request(format!(
                    "cluster {:?} refers to unknown zone {}",
                    cluster.name, cluster.zone_id
                )));
            }
            clusters.insert(cluster.id, cluster.clone());
        }
        Ok(Topology { zones, clusters })
    }

    pub fn zone(&self, id: ZoneUuid) -> Result<&ZoneConfig, Error> {
        self.zones
            .get(&id)
            .ok_or_else(|| Error::not_found(ResourceType::Zone, id))
    }

    pub fn cluster(&self, id: ClusterUuid) -> Result<&ClusterConfig, Error> {
        self.clusters
            .get(&id)
            .ok_or_else(|| Error::not_found(ResourceType::Cluster, id))
    }
}

/// Instances created by the orchestrator and not yet destroyed
#[derive(Default)]
pub struct InstanceStore {
    instances: Mutex<BTreeMap<InstanceUuid, VmInstance>>,
}

impl InstanceStore {
    pub fn insert(&self, instance: VmInstance) {
        self.instances.lock().unwrap().insert(instance.id, instance);
    }

    /// Removes an instance so that no one else can operate on it.
    pub fn take(&self, id: InstanceUuid) -> Result<VmInstance, Error> {
        self.instances
            .lock()
            .unwrap()
            .remove(&id)
            .ok_or_else(|| Error::not_found(ResourceType::Instance, id))
    }

    pub fn list(&self) -> Vec<VmInstance> {
        self.instances.lock().unwrap().values().cloned().collect()
    }
}

/// Builds a step whose actions get the server context along with their
/// step context
pub(crate) fn action<R, RFut, U, UFut>(
    octx: &Arc<ServerContext>,
    name: &str,
    run: R,
    undo: U,
) -> Arc<dyn Flow>
where
    R: Fn(Arc<ServerContext>, StepContext) -> RFut + Send + Sync + 'static,
    RFut: Future<Output = Result<(), Error>> + Send + 'static,
    U: Fn(Arc<ServerContext>, StepContext) -> UFut + Send + Sync + 'static,
    UFut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let run_octx = Arc::clone(octx);
    let undo_octx = Arc::clone(octx);
    FlowFunc::new(
        name,
        move |sctx| run(Arc::clone(&run_octx), sctx),
        move |sctx| undo(Arc::clone(&undo_octx), sctx),
    )
}

/// Like [`action()`], for steps with nothing to undo
pub(crate) fn action_no_undo<R, RFut>(
    octx: &Arc<ServerContext>,
    name: &str,
    run: R,
) -> Arc<dyn Flow>
where
    R: Fn(Arc<ServerContext>, StepContext) -> RFut + Send + Sync + 'static,
    RFut: Future<Output = Result<(), Error>> + Send + 'static,
{
    let octx = Arc::clone(octx);
    FlowFunc::new_no_rollback(name, move |sctx| run(Arc::clone(&octx), sctx))
}
