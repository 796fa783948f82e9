// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Composition of the orchestration core

use crate::agents::SimAgents;
use crate::config::Config;
use crate::context::InstanceStore;
use crate::context::ServerContext;
use crate::context::Topology;
use crate::destinations;
use crate::params::HostAddParams;
use crate::params::PrimaryStorageAddParams;
use crate::params::VmCreateParams;
use crate::params::VmDestroyParams;
use crate::params::VmInstance;
use crate::resources;
use crate::vm;
use cirrus_bus::Destination;
use cirrus_bus::HandlerFn;
use cirrus_bus::Message;
use cirrus_bus::MessageBus;
use cirrus_bus::RequestHandler;
use cirrus_capacity::CapacityTracker;
use cirrus_capacity::InMemoryInventory;
use cirrus_capacity::Reservation;
use cirrus_capacity::ResourceAllocator;
use cirrus_capacity::ResourceDescriptor;
use cirrus_capacity::ResourceKind;
use cirrus_common::api::error::Error;
use cirrus_flow::ChainExecutor;
use cirrus_uuid_kinds::InstanceUuid;
use serde::de::DeserializeOwned;
use serde::Serialize;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::future::Future;
use std::sync::Arc;

/// Owner name the intent destinations are registered under
const OWNER: &str = "orchestrator";

/// A running orchestrator
///
/// Intents are served over the [`MessageBus`] returned by
/// [`Orchestrator::bus()`].  The methods named after intents are
/// conveniences that send the intent over the bus and wait for the reply.
pub struct Orchestrator {
    octx: Arc<ServerContext>,
    agents: SimAgents,
}

impl Orchestrator {
    /// Builds every component from `config`, registers the simulated agents
    /// and the intent handlers, and adds the configured inventory
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start(
        config: &Config,
        log: &Logger,
    ) -> Result<Orchestrator, Error> {
        let log = log.new(o!("component" => "Orchestrator"));
        config.capacity.validate()?;
        let topology = Topology::from_config(&config.inventory)?;

        let bus = MessageBus::new(&log, config.bus.clone());
        let tracker = Arc::new(CapacityTracker::new(&log));
        let inventory = Arc::new(InMemoryInventory::new());
        let allocator =
            ResourceAllocator::new(&log, inventory.clone(), tracker.clone());
        let executor = ChainExecutor::new(&log, &config.flow);

        let octx = Arc::new(ServerContext {
            log: log.clone(),
            bus: bus.clone(),
            tracker,
            inventory,
            allocator,
            executor,
            topology,
            instances: InstanceStore::default(),
            capacity: config.capacity.clone(),
            strategy: config.allocator.strategy,
            agent_timeout: config.intents.agent_timeout(),
        });

        let agents = SimAgents::new(&log, &config.simulation);
        agents.register(&bus, config.intents.handler_parallelism)?;

        let intents: [(&'static str, Arc<dyn RequestHandler>); 4] = [
            (destinations::VM_CREATE, intent_handler(&octx, vm::vm_create)),
            (destinations::VM_DESTROY, intent_handler(&octx, vm::vm_destroy)),
            (
                destinations::HOST_ADD,
                intent_handler(&octx, resources::host_add),
            ),
            (
                destinations::PRIMARY_STORAGE_ADD,
                intent_handler(&octx, resources::primary_storage_add),
            ),
        ];
        for (name, handler) in intents {
            bus.register_handler_with_parallelism(
                &Destination::from_static(name),
                OWNER,
                handler,
                config.intents.handler_parallelism,
            )?;
        }

        for host in &config.inventory.hosts {
            let cluster = octx.topology.cluster(host.cluster_id)?;
            let descriptor = ResourceDescriptor {
                id: host.id,
                name: host.name.clone(),
                kind: ResourceKind::Host,
                zone_id: cluster.zone_id,
                cluster_id: Some(cluster.id),
                state: host.state,
            };
            resources::add_resource(&octx, descriptor, host.memory_mib).await?;
        }
        for storage in &config.inventory.primary_storage {
            octx.topology.zone(storage.zone_id)?;
            if let Some(cluster_id) = storage.cluster_id {
                octx.topology.cluster(cluster_id)?;
            }
            let descriptor = ResourceDescriptor {
                id: storage.id,
                name: storage.name.clone(),
                kind: ResourceKind::PrimaryStorage,
                zone_id: storage.zone_id,
                cluster_id: storage.cluster_id,
                state: storage.state,
            };
            resources::add_resource(&octx, descriptor, storage.capacity_gib)
                .await?;
        }

        info!(log, "orchestrator started";
            "hosts" => config.inventory.hosts.len(),
            "primary_storage" => config.inventory.primary_storage.len(),
        );
        Ok(Orchestrator { octx, agents })
    }

    pub fn bus(&self) -> &MessageBus {
        &self.octx.bus
    }

    pub fn tracker(&self) -> &Arc<CapacityTracker> {
        &self.octx.tracker
    }

    pub fn inventory(&self) -> &Arc<InMemoryInventory> {
        &self.octx.inventory
    }

    pub fn executor(&self) -> &ChainExecutor {
        &self.octx.executor
    }

    pub fn agents(&self) -> &SimAgents {
        &self.agents
    }

    /// Instances that have been created and not destroyed
    pub fn instances(&self) -> Vec<VmInstance> {
        self.octx.instances.list()
    }

    pub async fn create_vm(
        &self,
        params: &VmCreateParams,
    ) -> Result<VmInstance, Error> {
        self.call(destinations::VM_CREATE, params).await
    }

    pub async fn destroy_vm(
        &self,
        instance_id: InstanceUuid,
    ) -> Result<VmInstance, Error> {
        self.call(destinations::VM_DESTROY, &VmDestroyParams { instance_id })
            .await
    }

    pub async fn add_host(
        &self,
        params: &HostAddParams,
    ) -> Result<ResourceDescriptor, Error> {
        self.call(destinations::HOST_ADD, params).await
    }

    pub async fn add_primary_storage(
        &self,
        params: &PrimaryStorageAddParams,
    ) -> Result<ResourceDescriptor, Error> {
        self.call(destinations::PRIMARY_STORAGE_ADD, params).await
    }

    async fn call<T, R>(
        &self,
        intent: &'static str,
        body: &T,
    ) -> Result<R, Error>
    where
        T: Serialize + Sync,
        R: DeserializeOwned,
    {
        self.octx
            .bus
            .call(&Destination::from_static(intent), body, None)
            .await
    }

    /// Held reservations whose chain is no longer running
    ///
    /// Every reservation is released or committed by the chain that made
    /// it, so anything returned here is a bug.
    pub fn orphaned_reservations(&self) -> Vec<Reservation> {
        let live = self.octx.executor.live_chain_ids();
        self.octx.tracker.orphaned_reservations(&live)
    }

    /// Releases the reservations [`Orchestrator::orphaned_reservations()`]
    /// would return.
    pub fn release_orphans(&self) -> Vec<Reservation> {
        let live = self.octx.executor.live_chain_ids();
        let released = self.octx.tracker.release_orphans(&live);
        if !released.is_empty() {
            warn!(self.octx.log, "released orphaned reservations";
                "count" => released.len());
        }
        released
    }

    /// Unbinds the intent and agent destinations.  Chains already running
    /// are left to finish.
    pub fn stop(&self) -> Result<(), Error> {
        for name in [
            destinations::VM_CREATE,
            destinations::VM_DESTROY,
            destinations::HOST_ADD,
            destinations::PRIMARY_STORAGE_ADD,
        ] {
            self.octx
                .bus
                .unregister_handler(&Destination::from_static(name), OWNER)?;
        }
        self.agents.unregister(&self.octx.bus)?;
        info!(self.octx.log, "orchestrator stopped");
        Ok(())
    }
}

/// Wraps an intent handler function as a bus handler
fn intent_handler<F, Fut>(
    octx: &Arc<ServerContext>,
    handler: F,
) -> Arc<dyn RequestHandler>
where
    F: Fn(Arc<ServerContext>, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, Error>> + Send + 'static,
{
    let octx = Arc::clone(octx);
    HandlerFn::new(move |request| handler(Arc::clone(&octx), request))
}
