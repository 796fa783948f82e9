// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated agents
//!
//! These stand in for the hypervisor, storage and network drivers.  Each is
//! an ordinary bus handler that keeps its state in memory, so chains can be
//! exercised end to end, and each operation can be made to fail or hang.
//!
//! Like real drivers, they remember what they have been asked to delete or
//! stop and refuse to create it afterwards, so a create request that arrives
//! after its own compensation has no effect.

use crate::config::SimulationConfig;
use crate::destinations;
use async_trait::async_trait;
use cirrus_bus::Destination;
use cirrus_bus::Message;
use cirrus_bus::MessageBus;
use cirrus_bus::RequestHandler;
use cirrus_common::api::error::Error;
use cirrus_common::api::error::ResourceType;
use cirrus_uuid_kinds::InstanceUuid;
use cirrus_uuid_kinds::NicUuid;
use cirrus_uuid_kinds::ResourceUuid;
use cirrus_uuid_kinds::VolumeUuid;
use serde::Deserialize;
use serde::Serialize;
use slog::debug;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

/// Owner name the simulated agents register their destinations under
const SIM_OWNER: &str = "sim-agents";

/// How a simulated operation behaves
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SimMode {
    #[default]
    Succeed,
    /// reply with a handler error
    Fail,
    /// never reply
    Hang,
}

/// Per-operation behavior of one simulated agent
pub struct FaultInjector {
    agent: &'static str,
    default_mode: SimMode,
    latency: Duration,
    overrides: Mutex<BTreeMap<String, SimMode>>,
    completed: Mutex<BTreeMap<&'static str, usize>>,
}

impl FaultInjector {
    fn new(agent: &'static str, config: &SimulationConfig) -> FaultInjector {
        FaultInjector {
            agent,
            default_mode: config.mode,
            latency: Duration::from_millis(config.latency_ms),
            overrides: Mutex::new(BTreeMap::new()),
            completed: Mutex::new(BTreeMap::new()),
        }
    }

    /// Makes `operation` (e.g., "create_volume") behave as `mode` from now on
    pub fn set_mode(&self, operation: &str, mode: SimMode) {
        self.overrides.lock().unwrap().insert(operation.to_owned(), mode);
    }

    /// Reverts every operation to the configured mode.
    pub fn reset(&self) {
        self.overrides.lock().unwrap().clear();
    }

    pub fn mode(&self, operation: &str) -> SimMode {
        self.overrides
            .lock()
            .unwrap()
            .get(operation)
            .copied()
            .unwrap_or(self.default_mode)
    }

    /// Number of `operation` requests the agent has carried out or refused.
    /// Injected failures and hangs are not counted.
    pub fn completed(&self, operation: &str) -> usize {
        self.completed.lock().unwrap().get(operation).copied().unwrap_or(0)
    }

    fn record_completed(&self, operation: &'static str) {
        *self.completed.lock().unwrap().entry(operation).or_default() += 1;
    }

    async fn inject(&self, log: &Logger, operation: &str) -> Result<(), Error> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match self.mode(operation) {
            SimMode::Succeed => Ok(()),
            SimMode::Fail => {
                warn!(log, "injecting failure"; "operation" => operation);
                Err(Error::handler(format!(
                    "{}: injected failure in {}",
                    self.agent, operation
                )))
            }
            SimMode::Hang => {
                warn!(log, "injecting hang"; "operation" => operation);
                futures::future::pending().await
            }
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum HostAgentRequest {
    StartInstance {
        instance_id: InstanceUuid,
        host_id: ResourceUuid,
        memory_mib: u64,
    },
    StopInstance {
        instance_id: InstanceUuid,
    },
}

impl HostAgentRequest {
    fn operation(&self) -> &'static str {
        match self {
            HostAgentRequest::StartInstance { .. } => "start_instance",
            HostAgentRequest::StopInstance { .. } => "stop_instance",
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StorageAgentRequest {
    CreateVolume {
        volume_id: VolumeUuid,
        storage_id: ResourceUuid,
        size_gib: u64,
    },
    DeleteVolume {
        volume_id: VolumeUuid,
    },
}

impl StorageAgentRequest {
    fn operation(&self) -> &'static str {
        match self {
            StorageAgentRequest::CreateVolume { .. } => "create_volume",
            StorageAgentRequest::DeleteVolume { .. } => "delete_volume",
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum NetworkAgentRequest {
    CreateNic {
        nic_id: NicUuid,
        instance_id: InstanceUuid,
        network: String,
    },
    AttachNic {
        nic_id: NicUuid,
        host_id: ResourceUuid,
    },
    DetachNic {
        nic_id: NicUuid,
    },
    DeleteNic {
        nic_id: NicUuid,
    },
}

impl NetworkAgentRequest {
    fn operation(&self) -> &'static str {
        match self {
            NetworkAgentRequest::CreateNic { .. } => "create_nic",
            NetworkAgentRequest::AttachNic { .. } => "attach_nic",
            NetworkAgentRequest::DetachNic { .. } => "detach_nic",
            NetworkAgentRequest::DeleteNic { .. } => "delete_nic",
        }
    }
}

/// An instance running on the simulated hypervisor
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SimInstance {
    pub host_id: ResourceUuid,
    pub memory_mib: u64,
}

pub struct SimHostAgent {
    log: Logger,
    faults: FaultInjector,
    instances: Mutex<BTreeMap<InstanceUuid, SimInstance>>,
    /// instances that have been stopped and may not start again
    stopped: Mutex<BTreeSet<InstanceUuid>>,
}

impl SimHostAgent {
    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    pub fn instances(&self) -> BTreeMap<InstanceUuid, SimInstance> {
        self.instances.lock().unwrap().clone()
    }

    fn apply(&self, body: HostAgentRequest) -> Result<(), Error> {
        let mut instances = self.instances.lock().unwrap();
        let mut stopped = self.stopped.lock().unwrap();
        match body {
            HostAgentRequest::StartInstance {
                instance_id,
                host_id,
                memory_mib,
            } => {
                if instances.contains_key(&instance_id) {
                    return Err(Error::already_exists(
                        ResourceType::Instance,
                        instance_id,
                    ));
                }
                if stopped.contains(&instance_id) {
                    return Err(Error::invalid_request(format!(
                        "instance {} has already been stopped",
                        instance_id
                    )));
                }
                info!(self.log, "starting instance";
                    "instance_id" => %instance_id,
                    "host_id" => %host_id,
                );
                instances
                    .insert(instance_id, SimInstance { host_id, memory_mib });
            }
            HostAgentRequest::StopInstance { instance_id } => {
                stopped.insert(instance_id);
                if instances.remove(&instance_id).is_some() {
                    info!(self.log, "stopped instance";
                        "instance_id" => %instance_id);
                } else {
                    debug!(self.log, "instance already stopped";
                        "instance_id" => %instance_id);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RequestHandler for SimHostAgent {
    async fn handle(
        &self,
        request: &Message,
    ) -> Result<serde_json::Value, Error> {
        let body: HostAgentRequest = request.payload()?;
        let operation = body.operation();
        self.faults.inject(&self.log, operation).await?;
        let result = self.apply(body);
        self.faults.record_completed(operation);
        result.map(|()| serde_json::Value::Null)
    }
}

/// A volume on simulated storage
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SimVolume {
    pub storage_id: ResourceUuid,
    pub size_gib: u64,
}

pub struct SimStorageAgent {
    log: Logger,
    faults: FaultInjector,
    volumes: Mutex<BTreeMap<VolumeUuid, SimVolume>>,
    deleted: Mutex<BTreeSet<VolumeUuid>>,
}

impl SimStorageAgent {
    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    pub fn volumes(&self) -> BTreeMap<VolumeUuid, SimVolume> {
        self.volumes.lock().unwrap().clone()
    }

    fn apply(&self, body: StorageAgentRequest) -> Result<(), Error> {
        let mut volumes = self.volumes.lock().unwrap();
        let mut deleted = self.deleted.lock().unwrap();
        match body {
            StorageAgentRequest::CreateVolume {
                volume_id,
                storage_id,
                size_gib,
            } => {
                if volumes.contains_key(&volume_id) {
                    return Err(Error::already_exists(
                        ResourceType::Volume,
                        volume_id,
                    ));
                }
                if deleted.contains(&volume_id) {
                    return Err(Error::invalid_request(format!(
                        "volume {} has already been deleted",
                        volume_id
                    )));
                }
                info!(self.log, "created volume";
                    "volume_id" => %volume_id,
                    "storage_id" => %storage_id,
                    "size_gib" => size_gib,
                );
                volumes.insert(volume_id, SimVolume { storage_id, size_gib });
            }
            StorageAgentRequest::DeleteVolume { volume_id } => {
                deleted.insert(volume_id);
                if volumes.remove(&volume_id).is_some() {
                    info!(self.log, "deleted volume";
                        "volume_id" => %volume_id);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RequestHandler for SimStorageAgent {
    async fn handle(
        &self,
        request: &Message,
    ) -> Result<serde_json::Value, Error> {
        let body: StorageAgentRequest = request.payload()?;
        let operation = body.operation();
        self.faults.inject(&self.log, operation).await?;
        let result = self.apply(body);
        self.faults.record_completed(operation);
        result.map(|()| serde_json::Value::Null)
    }
}

/// A NIC on the simulated network
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SimNic {
    pub instance_id: InstanceUuid,
    pub network: String,
    pub attached_to: Option<ResourceUuid>,
}

pub struct SimNetworkAgent {
    log: Logger,
    faults: FaultInjector,
    nics: Mutex<BTreeMap<NicUuid, SimNic>>,
    deleted: Mutex<BTreeSet<NicUuid>>,
}

impl SimNetworkAgent {
    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    pub fn nics(&self) -> BTreeMap<NicUuid, SimNic> {
        self.nics.lock().unwrap().clone()
    }

    fn apply(&self, body: NetworkAgentRequest) -> Result<(), Error> {
        let mut nics = self.nics.lock().unwrap();
        let mut deleted = self.deleted.lock().unwrap();
        match body {
            NetworkAgentRequest::CreateNic { nic_id, instance_id, network } => {
                if nics.contains_key(&nic_id) {
                    return Err(Error::already_exists(
                        ResourceType::Nic,
                        nic_id,
                    ));
                }
                if deleted.contains(&nic_id) {
                    return Err(Error::invalid_request(format!(
                        "nic {} has already been deleted",
                        nic_id
                    )));
                }
                info!(self.log, "created nic";
                    "nic_id" => %nic_id,
                    "network" => &network,
                );
                nics.insert(
                    nic_id,
                    SimNic { instance_id, network, attached_to: None },
                );
            }
            NetworkAgentRequest::AttachNic { nic_id, host_id } => {
                let nic = nics.get_mut(&nic_id).ok_or_else(|| {
                    Error::not_found(ResourceType::Nic, nic_id)
                })?;
                if let Some(other) = nic.attached_to.filter(|h| *h != host_id) {
                    return Err(Error::invalid_request(format!(
                        "nic {} is already attached to host {}",
                        nic_id, other
                    )));
                }
                nic.attached_to = Some(host_id);
            }
            NetworkAgentRequest::DetachNic { nic_id } => {
                if let Some(nic) = nics.get_mut(&nic_id) {
                    nic.attached_to = None;
                }
            }
            NetworkAgentRequest::DeleteNic { nic_id } => {
                deleted.insert(nic_id);
                nics.remove(&nic_id);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RequestHandler for SimNetworkAgent {
    async fn handle(
        &self,
        request: &Message,
    ) -> Result<serde_json::Value, Error> {
        let body: NetworkAgentRequest = request.payload()?;
        let operation = body.operation();
        self.faults.inject(&self.log, operation).await?;
        let result = self.apply(body);
        self.faults.record_completed(operation);
        result.map(|()| serde_json::Value::Null)
    }
}

/// The full set of simulated agents
#[derive(Clone)]
pub struct SimAgents {
    pub host: Arc<SimHostAgent>,
    pub storage: Arc<SimStorageAgent>,
    pub network: Arc<SimNetworkAgent>,
}

impl SimAgents {
    pub fn new(log: &Logger, config: &SimulationConfig) -> SimAgents {
        let log = log.new(o!("component" => "SimAgents"));
        SimAgents {
            host: Arc::new(SimHostAgent {
                log: log.new(o!("agent" => destinations::HOST_AGENT)),
                faults: FaultInjector::new(destinations::HOST_AGENT, config),
                instances: Mutex::new(BTreeMap::new()),
                stopped: Mutex::new(BTreeSet::new()),
            }),
            storage: Arc::new(SimStorageAgent {
                log: log.new(o!("agent" => destinations::STORAGE_AGENT)),
                faults: FaultInjector::new(destinations::STORAGE_AGENT, config),
                volumes: Mutex::new(BTreeMap::new()),
                deleted: Mutex::new(BTreeSet::new()),
            }),
            network: Arc::new(SimNetworkAgent {
                log: log.new(o!("agent" => destinations::NETWORK_AGENT)),
                faults: FaultInjector::new(destinations::NETWORK_AGENT, config),
                nics: Mutex::new(BTreeMap::new()),
                deleted: Mutex::new(BTreeSet::new()),
            }),
        }
    }

    /// Binds the agents' destinations on `bus`
    ///
    /// Agents serve up to `parallelism` requests at once so that one hung
    /// operation does not hold up the rest.
    pub fn register(
        &self,
        bus: &MessageBus,
        parallelism: usize,
    ) -> Result<(), Error> {
        let handlers: [(&'static str, Arc<dyn RequestHandler>); 3] = [
            (destinations::HOST_AGENT, self.host.clone()),
            (destinations::STORAGE_AGENT, self.storage.clone()),
            (destinations::NETWORK_AGENT, self.network.clone()),
        ];
        for (name, handler) in handlers {
            bus.register_handler_with_parallelism(
                &Destination::from_static(name),
                SIM_OWNER,
                handler,
                parallelism,
            )?;
        }
        Ok(())
    }

    pub fn unregister(&self, bus: &MessageBus) -> Result<(), Error> {
        for name in [
            destinations::HOST_AGENT,
            destinations::STORAGE_AGENT,
            destinations::NETWORK_AGENT,
        ] {
            bus.unregister_handler(&Destination::from_static(name), SIM_OWNER)?;
        }
        Ok(())
    }

    /// Reverts every agent to its configured behavior.
    pub fn reset_faults(&self) {
        self.host.faults.reset();
        self.storage.faults.reset();
        self.network.faults.reset();
    }
}
