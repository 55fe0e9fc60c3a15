//! Phase ordering and barrier enforcement.

use crate::Tick;
use crate::config::{CellInteraction, ModelConfig};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Unit of work executed by every partition between two barriers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    CreateRelationsFromNeighborhood,
    CreateRelationsFromContacts,
    HandleNewContacts,
    Move,
    UpdateCellEdgeWeights,
    CellInteractions,
}

impl Phase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreateRelationsFromNeighborhood => "create_relations_from_neighborhood",
            Self::CreateRelationsFromContacts => "create_relations_from_contacts",
            Self::HandleNewContacts => "handle_new_contacts",
            Self::Move => "move",
            Self::UpdateCellEdgeWeights => "update_cell_edge_weights",
            Self::CellInteractions => "cell_interactions",
        }
    }

    /// Whether the phase runs agent behaviours (as opposed to cell behaviours).
    #[must_use]
    pub fn is_agent_phase(self) -> bool {
        !matches!(self, Self::UpdateCellEdgeWeights | Self::CellInteractions)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Barrier protocol violations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("phase {next} started before the barrier closing {previous}")]
    MissingBarrier { previous: Phase, next: Phase },
    #[error("phase {next} started while NEW_CONTACT proposals are still uncommitted")]
    UncommittedProposals { next: Phase },
}

/// Tracks barrier placement between phases.
///
/// A phase may only start once the previous one has been closed by a barrier,
/// and once proposals have been published the next phase must commit them.
#[derive(Debug, Clone, Default)]
pub struct PhaseGate {
    open: Option<Phase>,
    proposals_pending: bool,
}

impl PhaseGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Phase started and not yet closed by a barrier.
    #[must_use]
    pub fn open_phase(&self) -> Option<Phase> {
        self.open
    }

    pub fn begin(&mut self, phase: Phase) -> Result<(), ScheduleError> {
        if let Some(previous) = self.open {
            return Err(ScheduleError::MissingBarrier {
                previous,
                next: phase,
            });
        }
        if self.proposals_pending && phase != Phase::HandleNewContacts {
            return Err(ScheduleError::UncommittedProposals { next: phase });
        }
        self.open = Some(phase);
        Ok(())
    }

    /// Records a barrier, closing the open phase.
    pub fn barrier(&mut self) {
        match self.open.take() {
            Some(Phase::CreateRelationsFromContacts) => self.proposals_pending = true,
            Some(Phase::HandleNewContacts) => self.proposals_pending = false,
            _ => {}
        }
    }
}

/// Periodic phase plan of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    refresh_local_contacts: u64,
    refresh_distant_contacts: u64,
    contacts: bool,
    agents: bool,
    edge_weights: bool,
    cell_interactions: bool,
}

impl Schedule {
    #[must_use]
    pub fn from_config(config: &ModelConfig) -> Self {
        let agents = config.agent_count() > 0;
        Self {
            refresh_local_contacts: config.refresh_local_contacts,
            refresh_distant_contacts: config.refresh_distant_contacts,
            contacts: agents && config.contacts_enabled(),
            agents,
            edge_weights: config.dynamic_cell_edge_weights,
            cell_interactions: config.cell_interactions != CellInteraction::None,
        }
    }

    /// Phases due at `tick`, in execution order. Every phase is followed by a
    /// barrier.
    #[must_use]
    pub fn phases_at(&self, tick: Tick) -> Vec<Phase> {
        let mut phases = Vec::with_capacity(6);
        if self.contacts {
            if tick.is_due(self.refresh_local_contacts) {
                phases.push(Phase::CreateRelationsFromNeighborhood);
            }
            if tick.is_due(self.refresh_distant_contacts) {
                phases.push(Phase::CreateRelationsFromContacts);
                phases.push(Phase::HandleNewContacts);
            }
        }
        if self.agents {
            phases.push(Phase::Move);
        }
        if self.edge_weights {
            phases.push(Phase::UpdateCellEdgeWeights);
        }
        if self.cell_interactions {
            phases.push(Phase::CellInteractions);
        }
        phases
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentInteractions;

    #[test]
    fn contact_phases_follow_their_periods() {
        let config = ModelConfig {
            refresh_local_contacts: 2,
            refresh_distant_contacts: 3,
            ..ModelConfig::default()
        };
        let schedule = Schedule::from_config(&config);
        assert_eq!(
            schedule.phases_at(Tick(0)),
            vec![
                Phase::CreateRelationsFromNeighborhood,
                Phase::CreateRelationsFromContacts,
                Phase::HandleNewContacts,
                Phase::Move,
            ]
        );
        assert_eq!(schedule.phases_at(Tick(1)), vec![Phase::Move]);
        assert_eq!(
            schedule.phases_at(Tick(2)),
            vec![Phase::CreateRelationsFromNeighborhood, Phase::Move]
        );
        assert_eq!(
            schedule.phases_at(Tick(3)),
            vec![
                Phase::CreateRelationsFromContacts,
                Phase::HandleNewContacts,
                Phase::Move
            ]
        );
    }

    #[test]
    fn disabled_features_drop_their_phases() {
        let config = ModelConfig {
            agent_interactions: AgentInteractions::None,
            dynamic_cell_edge_weights: true,
            cell_interactions: CellInteraction::ReadOne,
            ..ModelConfig::default()
        };
        assert_eq!(
            Schedule::from_config(&config).phases_at(Tick(0)),
            vec![Phase::Move, Phase::UpdateCellEdgeWeights, Phase::CellInteractions]
        );
        let empty = ModelConfig {
            occupation_rate: 0.0,
            ..ModelConfig::default()
        };
        assert!(Schedule::from_config(&empty).phases_at(Tick(0)).is_empty());
    }

    #[test]
    fn gate_requires_barrier_between_phases() {
        let mut gate = PhaseGate::new();
        gate.begin(Phase::CreateRelationsFromContacts).expect("first phase");
        assert_eq!(
            gate.begin(Phase::HandleNewContacts),
            Err(ScheduleError::MissingBarrier {
                previous: Phase::CreateRelationsFromContacts,
                next: Phase::HandleNewContacts,
            })
        );
        gate.barrier();
        gate.begin(Phase::HandleNewContacts).expect("commit after barrier");
        gate.barrier();
        gate.begin(Phase::Move).expect("move after commit");
    }

    #[test]
    fn gate_rejects_skipping_the_commit_phase() {
        let mut gate = PhaseGate::new();
        gate.begin(Phase::CreateRelationsFromContacts).expect("proposals");
        gate.barrier();
        assert_eq!(
            gate.begin(Phase::Move),
            Err(ScheduleError::UncommittedProposals { next: Phase::Move })
        );
        assert_eq!(gate.open_phase(), None);
    }
}
