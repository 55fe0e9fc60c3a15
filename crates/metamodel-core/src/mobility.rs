//! Move policies and the move behaviour.

use crate::config::AgentParams;
use crate::substrate::{Agent, BehaviorError, DistributedId, PartitionScope};
use ordered_float::OrderedFloat;
use rand::Rng;
use rand::seq::{IndexedRandom, SliceRandom};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors raised while picking a destination.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("mobility field is empty")]
    EmptyField,
}

/// How an agent picks its next cell from its mobility field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MovePolicy {
    /// Utility-proportional draw.
    #[default]
    Random,
    /// Highest utility, ties broken uniformly.
    Max,
}

impl MovePolicy {
    /// Picks one cell out of `field`, a list of `(cell, utility)` pairs.
    pub fn select<R: Rng + ?Sized>(
        self,
        field: &[(DistributedId, f32)],
        rng: &mut R,
    ) -> Result<DistributedId, PolicyError> {
        match self {
            Self::Random => select_weighted(field, rng),
            Self::Max => select_max(field, rng),
        }
    }
}

fn select_weighted<R: Rng + ?Sized>(
    field: &[(DistributedId, f32)],
    rng: &mut R,
) -> Result<DistributedId, PolicyError> {
    // Keyed by the cumulative utility preceding each cell, so each cell owns
    // the interval [key, key + utility).
    let mut intervals: BTreeMap<OrderedFloat<f32>, DistributedId> = BTreeMap::new();
    let mut null_cells = Vec::new();
    let mut total = 0.0f32;
    for &(cell, utility) in field {
        if utility > 0.0 {
            intervals.insert(OrderedFloat(total), cell);
            total += utility;
        } else {
            null_cells.push(cell);
        }
    }
    if intervals.is_empty() {
        return null_cells.choose(rng).copied().ok_or(PolicyError::EmptyField);
    }
    // u lies in (0, total].
    let u = total - rng.random_range(0.0..total);
    intervals
        .range(..=OrderedFloat(u))
        .next_back()
        .map(|(_, &cell)| cell)
        .ok_or(PolicyError::EmptyField)
}

fn select_max<R: Rng + ?Sized>(
    field: &[(DistributedId, f32)],
    rng: &mut R,
) -> Result<DistributedId, PolicyError> {
    let mut shuffled = field.to_vec();
    shuffled.shuffle(rng);
    let mut candidates = shuffled.into_iter();
    let mut best = candidates.next().ok_or(PolicyError::EmptyField)?;
    for candidate in candidates {
        if candidate.1 > best.1 {
            best = candidate;
        }
    }
    Ok(best.0)
}

/// Moves `agent` to a cell of its mobility field chosen by its policy.
pub fn move_agent(
    agent: &mut Agent,
    scope: &mut PartitionScope<'_>,
    params: &AgentParams,
) -> Result<(), BehaviorError> {
    let field = scope.mobility_field(agent.location(), params.range_size)?;
    let mut weighted = Vec::with_capacity(field.len());
    for cell in field {
        let view = scope.read_cell(cell)?;
        weighted.push((view.id, view.utility));
    }
    let target = params
        .move_policy
        .select(&weighted, scope.rng())
        .map_err(|_| BehaviorError::EmptyMobilityField { agent: agent.id() })?;
    scope.move_to(agent, target)
}
