//! Model assembly and the tick loop.

use crate::config::{AgentParams, CellInteraction, ConfigError, Environment, ModelConfig};
use crate::schedule::{Phase, PhaseGate, Schedule, ScheduleError};
use crate::substrate::{
    Agent, BehaviorError, Cell, DistributedId, Layer, Partition, SharedGraph, Substrate,
    SyncStats,
};
use crate::utility::UtilityField;
use crate::{
    AgentState, MetricSample, ModelPersistence, NullPersistence, PersistenceBatch, Tick,
    TickSummary, interactions, maintainer, mobility,
};
use metamodel_index::{GraphIndex, IndexError, MooreGridIndex, NeighborhoodIndex};
use rand::Rng;
use rayon::prelude::*;
use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, trace};

/// Errors raised while building or stepping a model.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error("failed to place agents: {0}")]
    Placement(BehaviorError),
    #[error("phase {phase} failed: {source}")]
    Behavior {
        phase: Phase,
        source: BehaviorError,
    },
}

/// Behaviour parameters handed to every partition.
#[derive(Debug, Clone, Copy)]
struct Behaviors {
    agent: AgentParams,
    cell_edge_weight: f32,
    cell_interactions: CellInteraction,
}

/// A partitioned agent model and its tick loop.
pub struct Model {
    config: ModelConfig,
    substrate: Substrate,
    schedule: Schedule,
    gate: PhaseGate,
    behaviors: Behaviors,
    tick: Tick,
    history: VecDeque<TickSummary>,
    persistence: Box<dyn ModelPersistence>,
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("tick", &self.tick)
            .field("substrate", &self.substrate)
            .field("schedule", &self.schedule)
            .finish_non_exhaustive()
    }
}

impl Model {
    /// Builds a model without persistence.
    pub fn new(config: ModelConfig) -> Result<Self, ModelError> {
        Self::with_persistence(config, Box::new(NullPersistence))
    }

    /// Builds the environment, places agents uniformly at random and wires
    /// the persistence sink.
    pub fn with_persistence(
        config: ModelConfig,
        persistence: Box<dyn ModelPersistence>,
    ) -> Result<Self, ModelError> {
        config.validate()?;
        let mut rng = config.seeded_rng();
        let topology: Box<dyn NeighborhoodIndex> = match config.environment {
            Environment::Grid => Box::new(MooreGridIndex::new(
                config.grid_width,
                config.grid_height,
            )?),
            Environment::Random => Box::new(GraphIndex::uniform(
                config.num_cells,
                config.output_degree,
                &mut rng,
            )?),
            Environment::Clustered => Box::new(GraphIndex::clustered(
                config.num_cells,
                config.output_degree,
                &mut rng,
            )?),
            Environment::SmallWorld => Box::new(GraphIndex::small_world(
                config.num_cells,
                config.output_degree,
                config.p,
                &mut rng,
            )?),
        };
        let field = UtilityField::new(config.utility, config.attractors.clone());
        let mut substrate = Substrate::new(
            topology,
            &field,
            config.partitions,
            config.cell_size,
            config.cell_edge_weight,
            &mut rng,
        );
        let cells = substrate.graph().cells().len();
        for _ in 0..config.agent_count() {
            let cell = rng.random_range(0..cells);
            substrate
                .spawn_agent(cell)
                .map_err(ModelError::Placement)?;
        }
        info!(
            environment = ?config.environment,
            cells,
            agents = substrate.agent_count(),
            partitions = config.partitions,
            "model initialised"
        );
        let behaviors = Behaviors {
            agent: config.agent,
            cell_edge_weight: config.cell_edge_weight,
            cell_interactions: config.cell_interactions,
        };
        Ok(Self {
            schedule: Schedule::from_config(&config),
            history: VecDeque::with_capacity(config.history_capacity),
            config,
            substrate,
            gate: PhaseGate::new(),
            behaviors,
            tick: Tick::zero(),
            persistence,
        })
    }

    #[must_use]
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Next tick to execute.
    #[must_use]
    pub fn tick(&self) -> Tick {
        self.tick
    }

    #[must_use]
    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    #[must_use]
    pub fn substrate(&self) -> &Substrate {
        &self.substrate
    }

    /// Graph as of the last barrier.
    #[must_use]
    pub fn graph(&self) -> &SharedGraph {
        self.substrate.graph()
    }

    #[must_use]
    pub fn agent(&self, id: DistributedId) -> Option<&Agent> {
        self.substrate.agent(id)
    }

    /// Live agents, by rank then id.
    pub fn agents(&self) -> impl Iterator<Item = &Agent> {
        self.substrate.agents()
    }

    /// Recent tick summaries, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &TickSummary> {
        self.history.iter()
    }

    /// Replaces the persistence sink.
    pub fn set_persistence(&mut self, persistence: Box<dyn ModelPersistence>) {
        self.persistence = persistence;
    }

    /// Runs one phase on every partition in parallel. The caller must close
    /// it with [`Model::synchronize`] before starting another.
    pub fn run_phase(&mut self, phase: Phase) -> Result<(), ModelError> {
        self.gate.begin(phase)?;
        let behaviors = self.behaviors;
        let (graph, partitions) = self.substrate.split();
        partitions
            .par_iter_mut()
            .try_for_each(|partition| run_partition(partition, graph, phase, &behaviors))
            .map_err(|source| ModelError::Behavior { phase, source })
    }

    /// Barrier: publishes every buffered write.
    pub fn synchronize(&mut self) -> SyncStats {
        let stats = self.substrate.synchronize();
        self.gate.barrier();
        stats
    }

    /// Edges buffered on `layer` by phases not yet synchronized.
    #[must_use]
    pub fn pending_edges(&self, layer: Layer) -> usize {
        self.substrate.pending_edges(layer)
    }

    /// Executes every phase due at the current tick, each followed by a barrier.
    pub fn step(&mut self) -> Result<TickSummary, ModelError> {
        let tick = self.tick;
        let started = Instant::now();
        let mut sync = SyncStats::default();
        for phase in self.schedule.phases_at(tick) {
            let phase_started = Instant::now();
            self.run_phase(phase)?;
            let stats = self.synchronize();
            trace!(
                tick = tick.0,
                phase = %phase,
                linked = stats.linked,
                unlinked = stats.unlinked,
                elapsed_us = phase_started.elapsed().as_micros() as u64,
                "phase synchronized"
            );
            sync += stats;
        }
        let summary = self.summarize(tick);
        debug!(
            tick = tick.0,
            contacts = summary.contact_edges,
            average_contacts = summary.average_contacts,
            "tick complete"
        );

        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary.clone());

        let interval = self.config.persistence_interval;
        if interval > 0 && tick.is_due(u64::from(interval)) {
            let batch = PersistenceBatch {
                summary: summary.clone(),
                metrics: self.metrics(&summary, sync, started),
                agents: self.agent_states(),
            };
            self.persistence.on_tick(&batch);
        }
        self.tick = tick.next();
        Ok(summary)
    }

    /// Runs `steps` ticks.
    pub fn run(&mut self, steps: u64) -> Result<(), ModelError> {
        for _ in 0..steps {
            self.step()?;
        }
        Ok(())
    }

    /// Snapshot of every agent with its current perceptions.
    #[must_use]
    pub fn agent_states(&self) -> Vec<AgentState> {
        let graph = self.substrate.graph();
        let range = self.config.agent.range_size;
        self.substrate
            .agents()
            .map(|agent| {
                let mut perceptions = graph
                    .agents_within(agent.location(), range)
                    .unwrap_or_default();
                perceptions.retain(|&other| other != agent.id());
                AgentState {
                    id: agent.id(),
                    location: agent.location(),
                    location_point: graph.cell(agent.location()).and_then(Cell::point),
                    contacts: agent.contacts().clone(),
                    perceptions,
                }
            })
            .collect()
    }

    /// Checks that every contact list is within capacity, duplicate free and
    /// mirrored by the published `CONTACT` layer. Only meaningful right after
    /// a barrier.
    pub fn check_contacts(&self) -> Result<(), BehaviorError> {
        let graph = self.substrate.graph();
        for agent in self.substrate.agents() {
            let mut listed = agent.contacts().to_vec();
            let mut linked: Vec<DistributedId> = graph
                .edges()
                .outgoing(agent.id(), Layer::Contact)
                .map(|edge| edge.target)
                .collect();
            listed.sort_unstable();
            linked.sort_unstable();
            let over_capacity = listed.len() > self.config.agent.max_contacts;
            let duplicated = listed.windows(2).any(|pair| pair[0] == pair[1]);
            if over_capacity || duplicated || listed != linked || listed.contains(&agent.id()) {
                let contact = listed
                    .iter()
                    .chain(linked.iter())
                    .copied()
                    .next()
                    .unwrap_or(agent.id());
                return Err(BehaviorError::BrokenContactMirror {
                    agent: agent.id(),
                    contact,
                });
            }
        }
        Ok(())
    }

    fn summarize(&mut self, tick: Tick) -> TickSummary {
        let probes = self.substrate.take_probes();
        let graph = self.substrate.graph();
        let max_contacts = self.config.agent.max_contacts;
        let agent_count = self.substrate.agent_count();
        let mut total_contacts = 0usize;
        let mut saturated_agents = 0usize;
        for agent in self.substrate.agents() {
            let contacts = agent.contacts().len();
            total_contacts += contacts;
            if self.config.contacts_enabled() && contacts >= max_contacts {
                saturated_agents += 1;
            }
        }
        let average_contacts = if agent_count == 0 {
            0.0
        } else {
            total_contacts as f32 / agent_count as f32
        };
        TickSummary {
            tick,
            agent_count,
            contact_edges: graph.edges().count(Layer::Contact),
            new_contact_edges: graph.edges().count(Layer::NewContact),
            average_contacts,
            saturated_agents,
            probes,
        }
    }

    fn metrics(&self, summary: &TickSummary, sync: SyncStats, started: Instant) -> Vec<MetricSample> {
        let probes = summary.probes;
        vec![
            MetricSample::new("tick_micros", started.elapsed().as_micros() as f64),
            MetricSample::from_count("local_reads", probes.local_reads),
            MetricSample::from_count("distant_reads", probes.distant_reads),
            MetricSample::from_count("local_writes", probes.local_writes),
            MetricSample::from_count("distant_writes", probes.distant_writes),
            MetricSample::from_count("links", probes.links),
            MetricSample::from_count("unlinks", probes.unlinks),
            MetricSample::from_count("published_agents", sync.published as u64),
            MetricSample::from_count(
                "cell_successor_edges",
                self.graph().edges().count(Layer::CellSuccessor) as u64,
            ),
        ]
    }
}

fn run_partition(
    partition: &mut Partition,
    graph: &SharedGraph,
    phase: Phase,
    behaviors: &Behaviors,
) -> Result<(), BehaviorError> {
    let agent = &behaviors.agent;
    match phase {
        Phase::CreateRelationsFromNeighborhood => partition.for_each_agent(graph, |a, scope| {
            maintainer::create_relations_from_neighborhood(a, scope, agent)
        }),
        Phase::CreateRelationsFromContacts => partition.for_each_agent(graph, |a, scope| {
            maintainer::create_relations_from_contacts(a, scope, agent)
        }),
        Phase::HandleNewContacts => partition.for_each_agent(graph, |a, scope| {
            maintainer::handle_new_contacts(a, scope, agent)
        }),
        Phase::Move => {
            partition.for_each_agent(graph, |a, scope| mobility::move_agent(a, scope, agent))
        }
        Phase::UpdateCellEdgeWeights => partition.for_each_cell(graph, |cell, scope| {
            interactions::update_edge_weights(cell, scope, behaviors.cell_edge_weight)
        }),
        Phase::CellInteractions => partition.for_each_cell(graph, |cell, scope| {
            interactions::interact(behaviors.cell_interactions, cell, scope)
        }),
    }
}
