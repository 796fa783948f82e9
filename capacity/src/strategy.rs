// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Placement strategies
//!
//! A strategy ranks the candidates that survived eligibility and capacity
//! filtering; the allocator reserves on the highest-scoring one.  Equal
//! scores are broken by resource id so placement is deterministic for a
//! given state.

use crate::allocator::AllocationRequest;
use crate::inventory::ResourceDescriptor;
use crate::tracker::CapacitySnapshot;
use cirrus_uuid_kinds::GenericUuid;
use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use serde::Deserialize;
use serde::Serialize;
use std::fmt::Debug;
use std::sync::Arc;

/// A resource under consideration, with its capacity as of the start of
/// the allocation
#[derive(Clone, Debug)]
pub struct Candidate {
    pub resource: ResourceDescriptor,
    pub capacity: CapacitySnapshot,
}

pub trait AllocationStrategy: Debug + Send + Sync {
    fn name(&self) -> &'static str;

    /// Higher scores are preferred.
    fn score(&self, candidate: &Candidate, request: &AllocationRequest) -> i64;
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Prefers the candidate with the most capacity left (spreads load)
#[derive(Clone, Copy, Debug, Default)]
pub struct MostAvailable;

impl AllocationStrategy for MostAvailable {
    fn name(&self) -> &'static str {
        "most_available"
    }

    fn score(&self, candidate: &Candidate, _: &AllocationRequest) -> i64 {
        saturating_i64(candidate.capacity.available)
    }
}

/// Prefers the candidate with the least capacity left that still fits
/// (packs load onto as few resources as possible)
#[derive(Clone, Copy, Debug, Default)]
pub struct LeastAvailable;

impl AllocationStrategy for LeastAvailable {
    fn name(&self) -> &'static str {
        "least_available"
    }

    fn score(&self, candidate: &Candidate, _: &AllocationRequest) -> i64 {
        -saturating_i64(candidate.capacity.available)
    }
}

/// Ranks candidates randomly
///
/// The score of a candidate depends only on the seed and the candidate's id,
/// so a request built with the same seed places the same way against the
/// same state.
#[derive(Clone, Copy, Debug)]
pub struct Random {
    pub seed: u64,
}

impl Random {
    pub fn new(seed: u64) -> Random {
        Random { seed }
    }

    pub fn from_entropy() -> Random {
        Random { seed: rand::thread_rng().gen() }
    }
}

impl AllocationStrategy for Random {
    fn name(&self) -> &'static str {
        "random"
    }

    fn score(&self, candidate: &Candidate, _: &AllocationRequest) -> i64 {
        let (high, low) =
            candidate.resource.id.into_untyped_uuid().as_u64_pair();
        let mut rng = StdRng::seed_from_u64(self.seed ^ high ^ low);
        rng.gen()
    }
}

/// Configurable choice of built-in strategy (`[allocator] strategy`)
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    MostAvailable,
    LeastAvailable,
    /// without a seed, each built strategy draws its own
    Random { seed: Option<u64> },
}

impl StrategyKind {
    pub fn build(&self) -> Arc<dyn AllocationStrategy> {
        match self {
            StrategyKind::MostAvailable => Arc::new(MostAvailable),
            StrategyKind::LeastAvailable => Arc::new(LeastAvailable),
            StrategyKind::Random { seed: Some(seed) } => {
                Arc::new(Random::new(*seed))
            }
            StrategyKind::Random { seed: None } => {
                Arc::new(Random::from_entropy())
            }
        }
    }
}
