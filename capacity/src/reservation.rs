// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use cirrus_uuid_kinds::ChainUuid;
use cirrus_uuid_kinds::ReservationUuid;
use cirrus_uuid_kinds::ResourceUuid;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;

/// Lifecycle of a [`Reservation`]
///
/// ```text
/// Held --commit--> Committed
///   |
///   +---release--> Released (release is idempotent)
/// ```
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationState {
    Held,
    Committed,
    Released,
}

impl fmt::Display for ReservationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReservationState::Held => "held",
            ReservationState::Committed => "committed",
            ReservationState::Released => "released",
        };
        f.write_str(s)
    }
}

/// A provisional claim on part of a resource's capacity on behalf of one
/// flow chain
///
/// The tracker owns the authoritative copy; values handed out to callers are
/// snapshots that identify the reservation for `commit` and `release`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Reservation {
    pub id: ReservationUuid,
    pub resource_id: ResourceUuid,
    pub amount: u64,
    pub chain_id: ChainUuid,
    pub state: ReservationState,
}
