// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for parsing configuration files and working with an
//! orchestrator configuration

use crate::agents::SimMode;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use cirrus_bus::BusConfig;
use cirrus_capacity::CapacityConfig;
use cirrus_capacity::ResourceState;
use cirrus_capacity::StrategyKind;
use cirrus_common::logging::ConfigLogging;
use cirrus_flow::ExecutorConfig;
use cirrus_uuid_kinds::ClusterUuid;
use cirrus_uuid_kinds::ResourceUuid;
use cirrus_uuid_kinds::ZoneUuid;
use serde::Deserialize;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Configuration for an orchestrator
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Server-wide logging configuration.
    #[serde(default)]
    pub log: ConfigLogging,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub capacity: CapacityConfig,
    #[serde(default)]
    pub allocator: AllocatorConfig,
    #[serde(default)]
    pub flow: ExecutorConfig,
    #[serde(default)]
    pub intents: IntentsConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    /// Resources known at startup.
    #[serde(default)]
    pub inventory: InventoryConfig,
}

impl Config {
    /// Load a `Config` from the given TOML file
    ///
    /// This config object can then be used to start a new orchestrator.
    pub fn from_file(path: &Utf8Path) -> Result<Config, LoadError> {
        let file_contents = std::fs::read_to_string(path)
            .map_err(|err| LoadError::Io { path: path.into(), err })?;
        let config_parsed: Config = toml::from_str(&file_contents)
            .map_err(|err| LoadError::Parse { path: path.into(), err })?;
        Ok(config_parsed)
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("error reading \"{path}\": {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("error parsing \"{path}\": {err}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AllocatorConfig {
    /// placement strategy used for every intent
    pub strategy: StrategyKind,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct IntentsConfig {
    /// deadline for each request a chain step sends to an agent
    pub agent_timeout_ms: u64,
    /// how many intents of one kind may be in flight at once
    pub handler_parallelism: usize,
}

impl IntentsConfig {
    pub fn agent_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_timeout_ms)
    }
}

impl Default for IntentsConfig {
    fn default() -> Self {
        IntentsConfig { agent_timeout_ms: 10_000, handler_parallelism: 16 }
    }
}

/// Behavior of the simulated agents
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationConfig {
    /// delay before an agent answers any request
    pub latency_ms: u64,
    /// initial mode of every agent operation
    pub mode: SimMode,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct InventoryConfig {
    pub zones: Vec<ZoneConfig>,
    pub clusters: Vec<ClusterConfig>,
    pub hosts: Vec<HostConfig>,
    pub primary_storage: Vec<PrimaryStorageConfig>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ZoneConfig {
    pub id: ZoneUuid,
    pub name: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    pub id: ClusterUuid,
    pub name: String,
    pub zone_id: ZoneUuid,
}

fn default_state() -> ResourceState {
    ResourceState::Enabled
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    pub id: ResourceUuid,
    pub name: String,
    pub cluster_id: ClusterUuid,
    pub memory_mib: u64,
    #[serde(default = "default_state")]
    pub state: ResourceState,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PrimaryStorageConfig {
    pub id: ResourceUuid,
    pub name: String,
    pub zone_id: ZoneUuid,
    /// storage shared by a whole zone has no cluster
    pub cluster_id: Option<ClusterUuid>,
    pub capacity_gib: u64,
    #[serde(default = "default_state")]
    pub state: ResourceState,
}
