// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Over-provisioning policy (the `[capacity]` table of the orchestrator
//! config)

use crate::inventory::ResourceKind;
use cirrus_common::api::error::Error;
use serde::Deserialize;
use serde::Serialize;

/// Checks that `ratio` can be used as an over-provisioning ratio.
pub fn validate_ratio(ratio: f64) -> Result<(), Error> {
    if ratio.is_finite() && ratio >= 1.0 {
        Ok(())
    } else {
        Err(Error::invalid_request(format!(
            "over-provisioning ratio must be a finite number >= 1.0 \
             (got {})",
            ratio
        )))
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CapacityConfig {
    /// ratio applied to resources of a kind without an override
    pub default_overprovisioning_ratio: f64,
    pub host_overprovisioning_ratio: Option<f64>,
    pub primary_storage_overprovisioning_ratio: Option<f64>,
    pub backup_storage_overprovisioning_ratio: Option<f64>,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        CapacityConfig {
            default_overprovisioning_ratio: 1.0,
            host_overprovisioning_ratio: None,
            primary_storage_overprovisioning_ratio: None,
            backup_storage_overprovisioning_ratio: None,
        }
    }
}

impl CapacityConfig {
    pub fn ratio_for(&self, kind: ResourceKind) -> f64 {
        let specific = match kind {
            ResourceKind::Host => self.host_overprovisioning_ratio,
            ResourceKind::PrimaryStorage => {
                self.primary_storage_overprovisioning_ratio
            }
            ResourceKind::BackupStorage => {
                self.backup_storage_overprovisioning_ratio
            }
        };
        specific.unwrap_or(self.default_overprovisioning_ratio)
    }

    pub fn validate(&self) -> Result<(), Error> {
        validate_ratio(self.default_overprovisioning_ratio)?;
        for ratio in [
            self.host_overprovisioning_ratio,
            self.primary_storage_overprovisioning_ratio,
            self.backup_storage_overprovisioning_ratio,
        ]
        .into_iter()
        .flatten()
        {
            validate_ratio(ratio)?;
        }
        Ok(())
    }
}
