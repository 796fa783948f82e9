// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The orchestrator: operator intents turned into flow chains
//!
//! [`Orchestrator::start()`] builds the message bus, the capacity tracker,
//! the resource allocator and the chain executor, binds the simulated
//! agents, and binds a handler for each intent.  Every intent handler builds
//! a flow chain, runs it, and replies with the outcome.

mod agents;
mod config;
mod context;
mod orchestrator;
mod params;
mod resources;
mod vm;

pub use agents::FaultInjector;
pub use agents::HostAgentRequest;
pub use agents::NetworkAgentRequest;
pub use agents::SimAgents;
pub use agents::SimHostAgent;
pub use agents::SimInstance;
pub use agents::SimMode;
pub use agents::SimNetworkAgent;
pub use agents::SimNic;
pub use agents::SimStorageAgent;
pub use agents::SimVolume;
pub use agents::StorageAgentRequest;
pub use config::AllocatorConfig;
pub use config::ClusterConfig;
pub use config::Config;
pub use config::HostConfig;
pub use config::IntentsConfig;
pub use config::InventoryConfig;
pub use config::LoadError;
pub use config::PrimaryStorageConfig;
pub use config::SimulationConfig;
pub use config::ZoneConfig;
pub use orchestrator::Orchestrator;
pub use params::HostAddParams;
pub use params::PrimaryStorageAddParams;
pub use params::ResourceUsageEvent;
pub use params::UsageAction;
pub use params::VmCreateParams;
pub use params::VmDestroyParams;
pub use params::VmInstance;

/// Names of the destinations the orchestrator binds and publishes to
pub mod destinations {
    pub const VM_CREATE: &str = "orchestrator.vm.create";
    pub const VM_DESTROY: &str = "orchestrator.vm.destroy";
    pub const HOST_ADD: &str = "orchestrator.host.add";
    pub const PRIMARY_STORAGE_ADD: &str = "orchestrator.primary-storage.add";

    pub const HOST_AGENT: &str = "agent.host";
    pub const STORAGE_AGENT: &str = "agent.storage";
    pub const NETWORK_AGENT: &str = "agent.network";

    /// events describing capacity consumed and given back by instances
    pub const RESOURCE_USAGE: &str = "event.resource-usage";
}
