// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-resource capacity accounting
//!
//! Every resource known to the tracker has a capacity record:
//!
//! ```text
//! effective_total = floor(total * ratio)
//! available       = effective_total - used - reserved
//! ```
//!
//! and every mutation keeps `used + reserved <= effective_total`.  Mutations
//! of one resource are serialized by that resource's own lock; the map of
//! records is only locked exclusively to register or unregister a resource.
//!
//! A record keeps its Held reservations and the last
//! [`FINISHED_RESERVATIONS_KEPT`] Committed or Released ones, so memory stays
//! bounded no matter how many reservations come and go.  Releasing or looking
//! up a reservation that has aged out of that history fails with
//! `ObjectNotFound`.

use crate::policy::validate_ratio;
use crate::reservation::Reservation;
use crate::reservation::ReservationState;
use cirrus_common::api::error::Error;
use cirrus_common::api::error::ResourceType;
use cirrus_uuid_kinds::ChainUuid;
use cirrus_uuid_kinds::ReservationUuid;
use cirrus_uuid_kinds::ResourceUuid;
use serde::Deserialize;
use serde::Serialize;
use slog::debug;
use slog::error;
use slog::info;
use slog::o;
use slog::Logger;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;

/// Point-in-time view of one resource's capacity
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct CapacitySnapshot {
    pub resource_id: ResourceUuid,
    pub total: u64,
    pub ratio: f64,
    pub effective_total: u64,
    pub used: u64,
    pub reserved: u64,
    pub available: u64,
}

/// How many Committed or Released reservations each resource remembers
pub const FINISHED_RESERVATIONS_KEPT: usize = 64;

#[derive(Debug)]
struct CapacityRecord {
    total: u64,
    ratio: f64,
    used: u64,
    reserved: u64,
    held: BTreeMap<ReservationUuid, Reservation>,
    // Oldest first.  Kept so that release stays idempotent and lookups keep
    // working for a while after a reservation finishes.
    finished: VecDeque<Reservation>,
}

fn effective_total(total: u64, ratio: f64) -> u64 {
    // `as` saturates for floats out of range.
    (total as f64 * ratio).floor() as u64
}

impl CapacityRecord {
    fn effective_total(&self) -> u64 {
        effective_total(self.total, self.ratio)
    }

    fn available(&self) -> u64 {
        self.effective_total().saturating_sub(self.used + self.reserved)
    }

    fn snapshot(&self, resource_id: ResourceUuid) -> CapacitySnapshot {
        CapacitySnapshot {
            resource_id,
            total: self.total,
            ratio: self.ratio,
            effective_total: self.effective_total(),
            used: self.used,
            reserved: self.reserved,
            available: self.available(),
        }
    }

    fn reservation(&self, id: ReservationUuid) -> Option<&Reservation> {
        self.held
            .get(&id)
            .or_else(|| self.finished.iter().rev().find(|r| r.id == id))
    }

    /// Moves a Held reservation into the finished history in `state`.
    /// Returns the finished reservation and the one that aged out, if any.
    fn finish(
        &mut self,
        id: ReservationUuid,
        state: ReservationState,
    ) -> Option<(Reservation, Option<Reservation>)> {
        let mut reservation = self.held.remove(&id)?;
        reservation.state = state;
        self.finished.push_back(reservation.clone());
        let evicted = if self.finished.len() > FINISHED_RESERVATIONS_KEPT {
            self.finished.pop_front()
        } else {
            None
        };
        Some((reservation, evicted))
    }
}

/// Tracks capacity and reservations for every registered resource
#[derive(Debug)]
pub struct CapacityTracker {
    log: Logger,
    records: RwLock<BTreeMap<ResourceUuid, Arc<Mutex<CapacityRecord>>>>,
    /// resource of every reservation some record still remembers
    ///
    /// Lock order: `records`, then a record, then this.
    index: Mutex<BTreeMap<ReservationUuid, ResourceUuid>>,
}

impl CapacityTracker {
    pub fn new(log: &Logger) -> CapacityTracker {
        CapacityTracker {
            log: log.new(o!("component" => "CapacityTracker")),
            records: RwLock::new(BTreeMap::new()),
            index: Mutex::new(BTreeMap::new()),
        }
    }

    /// Number of reservations the tracker remembers, held or finished
    pub fn reservation_count(&self) -> usize {
        self.index.lock().unwrap().len()
    }

    fn record(
        &self,
        resource_id: ResourceUuid,
    ) -> Result<Arc<Mutex<CapacityRecord>>, Error> {
        self.records
            .read()
            .unwrap()
            .get(&resource_id)
            .cloned()
            .ok_or_else(|| {
                Error::not_found(ResourceType::Resource, resource_id)
            })
    }

    /// Starts tracking `resource_id` with the given total and
    /// over-provisioning ratio.
    pub fn register(
        &self,
        resource_id: ResourceUuid,
        total: u64,
        ratio: f64,
    ) -> Result<CapacitySnapshot, Error> {
        validate_ratio(ratio)?;
        let mut records = self.records.write().unwrap();
        if records.contains_key(&resource_id) {
            return Err(Error::already_exists(
                ResourceType::Resource,
                resource_id,
            ));
        }
        let record = CapacityRecord {
            total,
            ratio,
            used: 0,
            reserved: 0,
            held: BTreeMap::new(),
            finished: VecDeque::new(),
        };
        let snapshot = record.snapshot(resource_id);
        records.insert(resource_id, Arc::new(Mutex::new(record)));
        info!(self.log, "registered resource capacity";
            "resource_id" => %resource_id,
            "total" => total,
            "ratio" => ratio,
        );
        Ok(snapshot)
    }

    /// Stops tracking `resource_id`.  Fails if any capacity is still held or
    /// in use.
    pub fn unregister(
        &self,
        resource_id: ResourceUuid,
    ) -> Result<CapacitySnapshot, Error> {
        let mut records = self.records.write().unwrap();
        let record = records.get(&resource_id).ok_or_else(|| {
            Error::not_found(ResourceType::Resource, resource_id)
        })?;
        let record = record.lock().unwrap();
        let snapshot = record.snapshot(resource_id);
        if snapshot.used > 0 || snapshot.reserved > 0 {
            return Err(Error::invalid_request(format!(
                "resource {} still has {} used and {} reserved",
                resource_id, snapshot.used, snapshot.reserved
            )));
        }
        let mut index = self.index.lock().unwrap();
        for reservation in &record.finished {
            index.remove(&reservation.id);
        }
        drop(index);
        drop(record);
        records.remove(&resource_id);
        info!(self.log, "unregistered resource capacity";
            "resource_id" => %resource_id);
        Ok(snapshot)
    }

    /// Claims `amount` of `resource_id`'s capacity for `chain_id`
    pub fn reserve(
        &self,
        resource_id: ResourceUuid,
        amount: u64,
        chain_id: ChainUuid,
    ) -> Result<Reservation, Error> {
        if amount == 0 {
            return Err(Error::invalid_request(
                "cannot reserve zero capacity",
            ));
        }
        let record = self.record(resource_id)?;
        let mut record = record.lock().unwrap();
        let available = record.available();
        if amount > available {
            debug!(self.log, "insufficient capacity";
                "resource_id" => %resource_id,
                "requested" => amount,
                "available" => available,
            );
            return Err(Error::InsufficientCapacity {
                resource_id,
                requested: amount,
                available,
            });
        }

        let reservation = Reservation {
            id: ReservationUuid::new_v4(),
            resource_id,
            amount,
            chain_id,
            state: ReservationState::Held,
        };
        record.reserved += amount;
        record.held.insert(reservation.id, reservation.clone());
        self.index.lock().unwrap().insert(reservation.id, resource_id);
        debug!(self.log, "reserved capacity";
            "resource_id" => %resource_id,
            "reservation_id" => %reservation.id,
            "chain_id" => %chain_id,
            "amount" => amount,
            "available" => record.available(),
        );
        Ok(reservation)
    }

    /// Converts a Held reservation into used capacity
    pub fn commit(
        &self,
        reservation: &Reservation,
    ) -> Result<Reservation, Error> {
        let record = self.record(reservation.resource_id)?;
        let mut record = record.lock().unwrap();
        let current = record.reservation(reservation.id).ok_or_else(|| {
            Error::not_found(ResourceType::Reservation, reservation.id)
        })?;
        if current.state != ReservationState::Held {
            return Err(Error::invalid_state(format!(
                "cannot commit reservation {}: it is {}",
                current.id, current.state
            )));
        }
        let Some((committed, evicted)) =
            record.finish(reservation.id, ReservationState::Committed)
        else {
            return Err(Error::internal_error("held reservation vanished"));
        };
        record.reserved -= committed.amount;
        record.used += committed.amount;
        self.forget(evicted);
        debug!(self.log, "committed reservation";
            "resource_id" => %committed.resource_id,
            "reservation_id" => %committed.id,
            "amount" => committed.amount,
        );
        Ok(committed)
    }

    /// Gives a Held reservation's capacity back
    ///
    /// Releasing an already Released reservation is a no-op.  Releasing a
    /// Committed one is an error: committed capacity is given back with
    /// [`CapacityTracker::return_capacity`].
    pub fn release(
        &self,
        reservation: &Reservation,
    ) -> Result<Reservation, Error> {
        let record = self.record(reservation.resource_id)?;
        let mut record = record.lock().unwrap();
        let current = record.reservation(reservation.id).ok_or_else(|| {
            Error::not_found(ResourceType::Reservation, reservation.id)
        })?;
        match current.state {
            ReservationState::Released => return Ok(current.clone()),
            ReservationState::Committed => {
                return Err(Error::invalid_state(format!(
                    "cannot release reservation {}: it is committed",
                    current.id
                )));
            }
            ReservationState::Held => (),
        }
        let Some((released, evicted)) =
            record.finish(reservation.id, ReservationState::Released)
        else {
            return Err(Error::internal_error("held reservation vanished"));
        };
        record.reserved -= released.amount;
        self.forget(evicted);
        debug!(self.log, "released reservation";
            "resource_id" => %released.resource_id,
            "reservation_id" => %released.id,
            "amount" => released.amount,
        );
        Ok(released)
    }

    /// Gives back `amount` of used capacity (the compensating action for a
    /// committed reservation)
    pub fn return_capacity(
        &self,
        resource_id: ResourceUuid,
        amount: u64,
    ) -> Result<CapacitySnapshot, Error> {
        let record = self.record(resource_id)?;
        let mut record = record.lock().unwrap();
        if amount > record.used {
            return Err(Error::invalid_state(format!(
                "cannot return {} to resource {}: only {} is in use",
                amount, resource_id, record.used
            )));
        }
        record.used -= amount;
        debug!(self.log, "returned capacity";
            "resource_id" => %resource_id,
            "amount" => amount,
        );
        Ok(record.snapshot(resource_id))
    }

    /// Replaces the resource's total capacity
    ///
    /// Rejected if the new effective total could not cover what is already
    /// used and reserved.
    pub fn update_total(
        &self,
        resource_id: ResourceUuid,
        total: u64,
    ) -> Result<CapacitySnapshot, Error> {
        let record = self.record(resource_id)?;
        let mut record = record.lock().unwrap();
        let claimed = record.used + record.reserved;
        let effective = effective_total(total, record.ratio);
        if effective < claimed {
            return Err(Error::invalid_request(format!(
                "new total {} (effective {}) for resource {} is below the \
                 {} already used or reserved",
                total, effective, resource_id, claimed
            )));
        }
        record.total = total;
        info!(self.log, "updated resource total";
            "resource_id" => %resource_id,
            "total" => total,
        );
        Ok(record.snapshot(resource_id))
    }

    /// Replaces the resource's over-provisioning ratio
    ///
    /// Rejected if the new effective total could not cover what is already
    /// used and reserved.
    pub fn update_ratio(
        &self,
        resource_id: ResourceUuid,
        ratio: f64,
    ) -> Result<CapacitySnapshot, Error> {
        validate_ratio(ratio)?;
        let record = self.record(resource_id)?;
        let mut record = record.lock().unwrap();
        let claimed = record.used + record.reserved;
        let effective = effective_total(record.total, ratio);
        if effective < claimed {
            return Err(Error::invalid_request(format!(
                "new ratio {} (effective {}) for resource {} is below the \
                 {} already used or reserved",
                ratio, effective, resource_id, claimed
            )));
        }
        record.ratio = ratio;
        info!(self.log, "updated over-provisioning ratio";
            "resource_id" => %resource_id,
            "ratio" => ratio,
        );
        Ok(record.snapshot(resource_id))
    }

    pub fn query(
        &self,
        resource_id: ResourceUuid,
    ) -> Result<CapacitySnapshot, Error> {
        let record = self.record(resource_id)?;
        let snapshot = record.lock().unwrap().snapshot(resource_id);
        Ok(snapshot)
    }

    /// Snapshots of every registered resource, ordered by resource id
    pub fn snapshots(&self) -> Vec<CapacitySnapshot> {
        let records: Vec<_> = self
            .records
            .read()
            .unwrap()
            .iter()
            .map(|(id, record)| (*id, Arc::clone(record)))
            .collect();
        records
            .into_iter()
            .map(|(id, record)| {
                let snapshot = record.lock().unwrap().snapshot(id);
                snapshot
            })
            .collect()
    }

    fn forget(&self, evicted: Option<Reservation>) {
        if let Some(evicted) = evicted {
            self.index.lock().unwrap().remove(&evicted.id);
        }
    }

    /// Current state of a reservation, if the tracker still remembers it
    pub fn reservation(&self, id: ReservationUuid) -> Option<Reservation> {
        let resource_id = *self.index.lock().unwrap().get(&id)?;
        let record = self.record(resource_id).ok()?;
        let reservation = record.lock().unwrap().reservation(id).cloned();
        reservation
    }

    fn held_reservations(&self) -> Vec<Reservation> {
        let records: Vec<_> =
            self.records.read().unwrap().values().cloned().collect();
        records
            .into_iter()
            .flat_map(|record| {
                let held: Vec<_> =
                    record.lock().unwrap().held.values().cloned().collect();
                held
            })
            .collect()
    }

    /// Held reservations whose owning chain is not in `live_chains`
    ///
    /// A chain either commits or releases every reservation it creates
    /// before it stops, so anything returned here is an invariant violation.
    pub fn orphaned_reservations(
        &self,
        live_chains: &BTreeSet<ChainUuid>,
    ) -> Vec<Reservation> {
        self.held_reservations()
            .into_iter()
            .filter(|r| !live_chains.contains(&r.chain_id))
            .collect()
    }

    /// Releases every orphaned reservation (see
    /// [`CapacityTracker::orphaned_reservations`]) and returns them
    pub fn release_orphans(
        &self,
        live_chains: &BTreeSet<ChainUuid>,
    ) -> Vec<Reservation> {
        let mut released = Vec::new();
        for orphan in self.orphaned_reservations(live_chains) {
            error!(self.log, "releasing orphaned reservation";
                "reservation_id" => %orphan.id,
                "resource_id" => %orphan.resource_id,
                "chain_id" => %orphan.chain_id,
                "amount" => orphan.amount,
            );
            // The reservation may have been committed or released since the
            // audit looked at it; only still-held ones are reported.
            if let Ok(r) = self.release(&orphan) {
                if r.state == ReservationState::Released {
                    released.push(r);
                }
            }
        }
        released
    }
}
