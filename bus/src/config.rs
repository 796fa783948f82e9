// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bus configuration (the `[bus]` table of the orchestrator config)

use serde::Deserialize;
use serde::Serialize;
use std::time::Duration;

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BusConfig {
    /// deadline applied to `send` calls that don't supply one
    pub default_timeout_ms: u64,
    /// number of queued requests per destination before senders wait
    pub mailbox_depth: usize,
    /// number of requests a destination's handler may serve at once
    ///
    /// With the default of 1, a destination handles its requests strictly
    /// one at a time in submission order.
    pub handler_parallelism: usize,
}

impl BusConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig {
            default_timeout_ms: 30_000,
            mailbox_depth: 256,
            handler_parallelism: 1,
        }
    }
}
