// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Capacity-aware placement

use crate::inventory::ResourceDescriptor;
use crate::inventory::ResourceInventory;
use crate::inventory::ResourceKind;
use crate::reservation::Reservation;
use crate::strategy::AllocationStrategy;
use crate::strategy::Candidate;
use crate::tracker::CapacityTracker;
use cirrus_common::api::error::Error;
use cirrus_uuid_kinds::ChainUuid;
use cirrus_uuid_kinds::ClusterUuid;
use cirrus_uuid_kinds::ResourceUuid;
use cirrus_uuid_kinds::ZoneUuid;
use slog::debug;
use slog::info;
use slog::o;
use slog::Logger;
use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Where a resource may be placed
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Placement {
    Any,
    Zone(ZoneUuid),
    Cluster(ClusterUuid),
}

/// The set of resources an allocation may choose from
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Scope {
    pub placement: Placement,
    /// resources to leave out (e.g., the host a previous attempt failed on)
    pub avoid: BTreeSet<ResourceUuid>,
}

impl Scope {
    pub fn any() -> Scope {
        Scope { placement: Placement::Any, avoid: BTreeSet::new() }
    }

    pub fn zone(zone_id: ZoneUuid) -> Scope {
        Scope { placement: Placement::Zone(zone_id), avoid: BTreeSet::new() }
    }

    pub fn cluster(cluster_id: ClusterUuid) -> Scope {
        Scope {
            placement: Placement::Cluster(cluster_id),
            avoid: BTreeSet::new(),
        }
    }

    pub fn avoiding(mut self, resource_id: ResourceUuid) -> Scope {
        self.avoid.insert(resource_id);
        self
    }

    fn contains(&self, resource: &ResourceDescriptor) -> bool {
        if self.avoid.contains(&resource.id) {
            return false;
        }
        match self.placement {
            Placement::Any => true,
            Placement::Zone(zone_id) => resource.zone_id == zone_id,
            Placement::Cluster(cluster_id) => {
                resource.cluster_id == Some(cluster_id)
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct AllocationRequest {
    pub kind: ResourceKind,
    pub required_capacity: u64,
    pub scope: Scope,
    pub strategy: Arc<dyn AllocationStrategy>,
    /// chain on whose behalf the capacity is reserved
    pub chain_id: ChainUuid,
}

/// A placement decision together with the reservation backing it
#[derive(Clone, Debug)]
pub struct Allocation {
    pub resource: ResourceDescriptor,
    pub reservation: Reservation,
}

impl Allocation {
    pub fn resource_id(&self) -> ResourceUuid {
        self.resource.id
    }
}

/// Chooses a resource for a request and reserves capacity on it
pub struct ResourceAllocator {
    log: Logger,
    inventory: Arc<dyn ResourceInventory>,
    tracker: Arc<CapacityTracker>,
}

impl ResourceAllocator {
    pub fn new(
        log: &Logger,
        inventory: Arc<dyn ResourceInventory>,
        tracker: Arc<CapacityTracker>,
    ) -> ResourceAllocator {
        ResourceAllocator {
            log: log.new(o!("component" => "ResourceAllocator")),
            inventory,
            tracker,
        }
    }

    pub fn tracker(&self) -> &Arc<CapacityTracker> {
        &self.tracker
    }

    pub fn inventory(&self) -> &Arc<dyn ResourceInventory> {
        &self.inventory
    }

    /// Picks a resource for `request` and reserves the requested capacity
    /// on it
    ///
    /// Candidates are the allocatable resources of the requested kind in
    /// scope whose available capacity covers the request, ranked by the
    /// request's strategy.  If another chain wins the race for the top
    /// candidate between the capacity check and the reservation, the next
    /// candidate is tried.  Once the ranking is exhausted this fails with
    /// [`Error::NoEligibleResource`]; it never retries on its own.
    pub async fn allocate(
        &self,
        request: &AllocationRequest,
    ) -> Result<Allocation, Error> {
        if request.required_capacity == 0 {
            return Err(Error::invalid_request(
                "allocation requires a non-zero capacity",
            ));
        }
        let log = self.log.new(o!(
            "chain_id" => request.chain_id.to_string(),
            "kind" => request.kind.to_string(),
            "strategy" => request.strategy.name(),
        ));

        let resources = self.inventory.resources(request.kind).await?;
        let in_scope = resources.len();
        let mut candidates: Vec<Candidate> = resources
            .into_iter()
            .filter(|r| r.state.is_allocatable() && request.scope.contains(r))
            .filter_map(|resource| {
                // A resource the tracker doesn't know has no capacity to
                // offer.
                let capacity = self.tracker.query(resource.id).ok()?;
                (capacity.available >= request.required_capacity)
                    .then_some(Candidate { resource, capacity })
            })
            .collect();
        debug!(log, "ranking candidates";
            "required" => request.required_capacity,
            "resources" => in_scope,
            "candidates" => candidates.len(),
        );

        candidates.sort_by_cached_key(|c| {
            (Reverse(request.strategy.score(c, request)), c.resource.id)
        });

        for candidate in candidates {
            match self.tracker.reserve(
                candidate.resource.id,
                request.required_capacity,
                request.chain_id,
            ) {
                Ok(reservation) => {
                    info!(log, "allocated";
                        "resource_id" => %candidate.resource.id,
                        "resource_name" => &candidate.resource.name,
                        "reservation_id" => %reservation.id,
                        "amount" => reservation.amount,
                    );
                    return Ok(Allocation {
                        resource: candidate.resource,
                        reservation,
                    });
                }
                Err(Error::InsufficientCapacity { available, .. }) => {
                    debug!(log, "lost reservation race; trying next candidate";
                        "resource_id" => %candidate.resource.id,
                        "available" => available,
                    );
                }
                Err(error) => return Err(error),
            }
        }

        Err(Error::NoEligibleResource {
            message: format!(
                "no {} in scope has {} available ({} considered)",
                request.kind, request.required_capacity, in_scope
            ),
        })
    }
}
