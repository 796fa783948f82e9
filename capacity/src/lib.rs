// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Capacity tracking and placement
//!
//! The [`CapacityTracker`] is the single authority on how much of each
//! resource is used or reserved.  The [`ResourceAllocator`] combines it with
//! a [`ResourceInventory`] (what exists, where, in what state) and an
//! [`AllocationStrategy`] to choose a placement target and reserve capacity
//! on it in one step.  Reservations are committed or released by the flow
//! chain that created them.

mod allocator;
mod inventory;
mod policy;
mod reservation;
mod strategy;
mod tracker;

pub use allocator::Allocation;
pub use allocator::AllocationRequest;
pub use allocator::Placement;
pub use allocator::ResourceAllocator;
pub use allocator::Scope;
pub use inventory::InMemoryInventory;
pub use inventory::ResourceDescriptor;
pub use inventory::ResourceInventory;
pub use inventory::ResourceKind;
pub use inventory::ResourceState;
pub use policy::validate_ratio;
pub use policy::CapacityConfig;
pub use reservation::Reservation;
pub use reservation::ReservationState;
pub use strategy::AllocationStrategy;
pub use strategy::Candidate;
pub use strategy::LeastAvailable;
pub use strategy::MostAvailable;
pub use strategy::Random;
pub use strategy::StrategyKind;
pub use tracker::CapacitySnapshot;
pub use tracker::CapacityTracker;
pub use tracker::FINISHED_RESERVATIONS_KEPT;
