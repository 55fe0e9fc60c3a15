//! Core types shared across the metamodel workspace.
//!
//! Agents move across a cell network owned by a set of partitions and keep a
//! bounded list of contacts that grows through a three-phase protocol. Every
//! write performed by a partition during a phase is buffered until the next
//! synchronization barrier, after which it becomes visible everywhere.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;

pub mod config;
pub mod contacts;
pub mod interactions;
pub mod maintainer;
pub mod mobility;
pub mod model;
pub mod schedule;
pub mod substrate;
pub mod utility;

pub use config::{
    AgentInteractions, AgentParams, CellInteraction, ConfigError, Environment, ModelConfig,
};
pub use contacts::ContactList;
pub use metamodel_index::{GraphIndex, GridPoint, IndexError, MooreGridIndex, NeighborhoodIndex};
pub use mobility::{MovePolicy, PolicyError};
pub use model::{Model, ModelError};
pub use schedule::{Phase, PhaseGate, Schedule, ScheduleError};
pub use substrate::{
    Agent, AgentView, BehaviorError, Cell, CellView, DistributedId, Edge, EdgeStore, Layer,
    Partition, PartitionScope, Probes, Rank, ReadGuard, SharedGraph, Substrate, SyncStats,
    WriteGuard,
};
pub use utility::{Attractor, UtilityField, UtilityKind};

/// Discrete simulation time step.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub struct Tick(pub u64);

impl Tick {
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns true when a task scheduled every `period` ticks from tick 0 runs now.
    #[must_use]
    pub fn is_due(self, period: u64) -> bool {
        period > 0 && self.0.is_multiple_of(period)
    }
}

/// Summary emitted to persistence hooks each tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickSummary {
    pub tick: Tick,
    pub agent_count: usize,
    pub contact_edges: usize,
    pub new_contact_edges: usize,
    pub average_contacts: f32,
    pub saturated_agents: usize,
    pub probes: Probes,
}

/// Scalar metric sampled during persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub name: Cow<'static, str>,
    pub value: f64,
}

impl MetricSample {
    /// Creates a new metric sample.
    #[must_use]
    pub fn new(name: impl Into<Cow<'static, str>>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    /// Helper for counters.
    #[must_use]
    pub fn from_count(name: &'static str, value: u64) -> Self {
        Self::new(name, value as f64)
    }
}

/// Externally visible snapshot of one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentState {
    pub id: DistributedId,
    pub location: DistributedId,
    pub location_point: Option<GridPoint>,
    pub contacts: ContactList,
    pub perceptions: Vec<DistributedId>,
}

/// Aggregate payload forwarded to persistence sinks.
#[derive(Debug, Clone)]
pub struct PersistenceBatch {
    pub summary: TickSummary,
    pub metrics: Vec<MetricSample>,
    pub agents: Vec<AgentState>,
}

/// Persistence sink invoked after each persisted tick.
pub trait ModelPersistence: Send {
    fn on_tick(&mut self, payload: &PersistenceBatch);
}

/// No-op persistence sink.
#[derive(Debug, Default)]
pub struct NullPersistence;

impl ModelPersistence for NullPersistence {
    fn on_tick(&mut self, _payload: &PersistenceBatch) {}
}
