//! Cell behaviours: synchronization patterns against successors and dynamic
//! edge weights.

use crate::config::CellInteraction;
use crate::substrate::{BehaviorError, Cell, DistributedId, Layer, PartitionScope};
use rand::seq::IndexedRandom;

/// Acquires the successors of `cell` following `pattern`.
pub fn interact(
    pattern: CellInteraction,
    cell: &Cell,
    scope: &mut PartitionScope<'_>,
) -> Result<(), BehaviorError> {
    if pattern == CellInteraction::None {
        return Ok(());
    }
    let successors: Vec<DistributedId> = scope
        .outgoing_edges(cell.id(), Layer::CellSuccessor)
        .into_iter()
        .map(|edge| edge.target)
        .collect();
    match pattern {
        CellInteraction::None => {}
        CellInteraction::ReadAll => read_all(&successors, scope)?,
        CellInteraction::WriteAll => write_all(&successors, scope)?,
        CellInteraction::ReadOne => {
            if let Some(&target) = successors.choose(scope.rng()) {
                scope.read_cell(target)?;
            }
        }
        CellInteraction::WriteOne => write_one(&successors, scope)?,
        CellInteraction::ReadAllWriteOne => {
            read_all(&successors, scope)?;
            write_one(&successors, scope)?;
        }
        CellInteraction::ReadAllWriteAll => {
            read_all(&successors, scope)?;
            write_all(&successors, scope)?;
        }
    }
    Ok(())
}

fn read_all(successors: &[DistributedId], scope: &mut PartitionScope<'_>) -> Result<(), BehaviorError> {
    for &target in successors {
        scope.read_cell(target)?;
    }
    Ok(())
}

fn write_all(successors: &[DistributedId], scope: &mut PartitionScope<'_>) -> Result<(), BehaviorError> {
    for &target in successors {
        scope.write_cell(target)?;
    }
    Ok(())
}

fn write_one(successors: &[DistributedId], scope: &mut PartitionScope<'_>) -> Result<(), BehaviorError> {
    if let Some(&target) = successors.choose(scope.rng()) {
        scope.write_cell(target)?;
    }
    Ok(())
}

/// Sets the weight of every `CELL_SUCCESSOR` edge leaving `cell` to
/// `base + occupancy`, occupancy being the published agent count of `cell`.
pub fn update_edge_weights(
    cell: &Cell,
    scope: &mut PartitionScope<'_>,
    base: f32,
) -> Result<(), BehaviorError> {
    let weight = base + scope.occupancy(cell.id()) as f32;
    for edge in scope.outgoing_edges(cell.id(), Layer::CellSuccessor) {
        scope.set_edge_weight(&edge, weight);
    }
    Ok(())
}
