//! Partitioned graph substrate.
//!
//! Cells, agents and edges form one multi-layer directed graph whose nodes are
//! owned by partitions. During a phase each partition runs its own agents and
//! cells against a read-only published graph; links, unlinks, moves and cell
//! acquisitions are buffered per partition and only become visible to other
//! partitions once [`Substrate::synchronize`] folds them in rank order.

use crate::contacts::ContactList;
use crate::utility::UtilityField;
use metamodel_index::{GridPoint, NeighborhoodIndex};
use rand::{Rng, SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::mem;
use std::ops::{AddAssign, Deref};
use thiserror::Error;

/// Partition index.
pub type Rank = u32;

/// Globally unique node or edge identifier: the creating partition and a
/// counter local to it.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct DistributedId {
    pub rank: Rank,
    pub id: u64,
}

impl DistributedId {
    #[must_use]
    pub const fn new(rank: Rank, id: u64) -> Self {
        Self { rank, id }
    }
}

impl fmt::Display for DistributedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.rank, self.id)
    }
}

const LAYER_COUNT: usize = 5;

/// Edge layers of the model graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Layer {
    /// Agent to the cell it occupies.
    Location,
    /// Agent to an agent it perceives.
    Perception,
    /// Agent to each entry of its contact list.
    Contact,
    /// Transient proposal, alive for exactly one barrier.
    NewContact,
    /// Static cell adjacency.
    CellSuccessor,
}

impl Layer {
    pub const ALL: [Layer; LAYER_COUNT] = [
        Layer::Location,
        Layer::Perception,
        Layer::Contact,
        Layer::NewContact,
        Layer::CellSuccessor,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Location => "LOCATION",
            Self::Perception => "PERCEPTION",
            Self::Contact => "CONTACT",
            Self::NewContact => "NEW_CONTACT",
            Self::CellSuccessor => "CELL_SUCCESSOR",
        }
    }

    fn slot(self) -> usize {
        self as usize
    }
}

/// Directed, weighted edge on a single layer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: DistributedId,
    pub layer: Layer,
    pub source: DistributedId,
    pub target: DistributedId,
    pub weight: f32,
}

/// Edge table indexed by source and layer.
#[derive(Debug, Clone, Default)]
pub struct EdgeStore {
    edges: BTreeMap<DistributedId, Edge>,
    outgoing: HashMap<(DistributedId, Layer), BTreeSet<DistributedId>>,
    counts: [usize; LAYER_COUNT],
}

impl EdgeStore {
    #[must_use]
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    #[must_use]
    pub fn get(&self, id: DistributedId) -> Option<&Edge> {
        self.edges.get(&id)
    }

    /// Edges in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Edge> {
        self.edges.values()
    }

    /// Outgoing edges of `source` on `layer`, in id order.
    pub fn outgoing(&self, source: DistributedId, layer: Layer) -> impl Iterator<Item = &Edge> {
        self.outgoing
            .get(&(source, layer))
            .into_iter()
            .flatten()
            .filter_map(|id| self.edges.get(id))
    }

    /// Number of edges on `layer`.
    #[must_use]
    pub fn count(&self, layer: Layer) -> usize {
        self.counts[layer.slot()]
    }

    pub(crate) fn insert(&mut self, edge: Edge) {
        if let Some(previous) = self.edges.insert(edge.id, edge) {
            self.detach(&previous);
        }
        self.outgoing
            .entry((edge.source, edge.layer))
            .or_default()
            .insert(edge.id);
        self.counts[edge.layer.slot()] += 1;
    }

    pub(crate) fn remove(&mut self, id: DistributedId) -> Option<Edge> {
        let edge = self.edges.remove(&id)?;
        self.detach(&edge);
        Some(edge)
    }

    pub(crate) fn set_weight(&mut self, id: DistributedId, weight: f32) -> bool {
        match self.edges.get_mut(&id) {
            Some(edge) => {
                edge.weight = weight;
                true
            }
            None => false,
        }
    }

    fn detach(&mut self, edge: &Edge) {
        let key = (edge.source, edge.layer);
        if let Some(ids) = self.outgoing.get_mut(&key) {
            ids.remove(&edge.id);
            if ids.is_empty() {
                self.outgoing.remove(&key);
            }
        }
        self.counts[edge.layer.slot()] -= 1;
    }
}

/// A location of the environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    id: DistributedId,
    index: usize,
    point: Option<GridPoint>,
    utility: f32,
    payload: Vec<u8>,
    acquisitions: u64,
}

impl Cell {
    fn new(
        id: DistributedId,
        index: usize,
        point: Option<GridPoint>,
        utility: f32,
        size: usize,
    ) -> Self {
        Self {
            id,
            index,
            point,
            utility,
            payload: vec![0; size],
            acquisitions: 0,
        }
    }

    #[must_use]
    pub fn id(&self) -> DistributedId {
        self.id
    }

    /// Dense index in the topology.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn point(&self) -> Option<GridPoint> {
        self.point
    }

    #[must_use]
    pub fn utility(&self) -> f32 {
        self.utility
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Exclusive acquisitions committed so far.
    #[must_use]
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions
    }

    #[must_use]
    pub fn view(&self) -> CellView {
        CellView {
            id: self.id,
            point: self.point,
            utility: self.utility,
        }
    }
}

/// Read-only copy of a cell handed out by read and write guards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CellView {
    pub id: DistributedId,
    pub point: Option<GridPoint>,
    pub utility: f32,
}

/// Live agent state, owned by exactly one partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub(crate) id: DistributedId,
    pub(crate) location: DistributedId,
    pub(crate) location_edge: Edge,
    pub(crate) contacts: ContactList,
}

impl Agent {
    #[must_use]
    pub fn id(&self) -> DistributedId {
        self.id
    }

    /// Cell the agent currently occupies.
    #[must_use]
    pub fn location(&self) -> DistributedId {
        self.location
    }

    #[must_use]
    pub fn contacts(&self) -> &ContactList {
        &self.contacts
    }

    #[must_use]
    pub fn view(&self) -> AgentView {
        AgentView {
            id: self.id,
            location: self.location,
            contacts: self.contacts.clone(),
        }
    }
}

/// Agent state as published at the last barrier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentView {
    pub id: DistributedId,
    pub location: DistributedId,
    pub contacts: ContactList,
}

/// Errors raised by agent and cell behaviours.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BehaviorError {
    #[error("cell {0} does not exist")]
    UnknownCell(DistributedId),
    #[error("agent {0} does not exist")]
    UnknownAgent(DistributedId),
    #[error("agent {agent} has an empty mobility field")]
    EmptyMobilityField { agent: DistributedId },
    /// The contact list and the `CONTACT` layer disagree.
    #[error("agent {agent} lists contact {contact} without a matching CONTACT edge")]
    BrokenContactMirror {
        agent: DistributedId,
        contact: DistributedId,
    },
}

/// Synchronization counters, split by owner locality.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Probes {
    pub local_reads: u64,
    pub distant_reads: u64,
    pub local_writes: u64,
    pub distant_writes: u64,
    pub links: u64,
    pub unlinks: u64,
}

impl Probes {
    fn record_read(&mut self, local: bool) {
        if local {
            self.local_reads += 1;
        } else {
            self.distant_reads += 1;
        }
    }

    fn record_write(&mut self, local: bool) {
        if local {
            self.local_writes += 1;
        } else {
            self.distant_writes += 1;
        }
    }
}

impl AddAssign for Probes {
    fn add_assign(&mut self, other: Self) {
        self.local_reads += other.local_reads;
        self.distant_reads += other.distant_reads;
        self.local_writes += other.local_writes;
        self.distant_writes += other.distant_writes;
        self.links += other.links;
        self.unlinks += other.unlinks;
    }
}

/// Work folded into the published graph by one barrier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub linked: usize,
    pub unlinked: usize,
    pub published: usize,
}

impl AddAssign for SyncStats {
    fn add_assign(&mut self, other: Self) {
        self.linked += other.linked;
        self.unlinked += other.unlinked;
        self.published += other.published;
    }
}

/// Writes buffered by one partition until the next barrier.
#[derive(Debug, Default)]
pub(crate) struct PendingWrites {
    linked: HashMap<(DistributedId, Layer), Vec<Edge>>,
    unlinked: HashSet<DistributedId>,
    weights: Vec<(DistributedId, f32)>,
    acquisitions: Vec<usize>,
    dirty: BTreeSet<DistributedId>,
}

impl PendingWrites {
    fn linked_on(&self, layer: Layer) -> usize {
        self.linked
            .iter()
            .filter(|((_, edge_layer), _)| *edge_layer == layer)
            .map(|(_, edges)| edges.len())
            .sum()
    }
}

#[derive(Debug, Clone)]
struct IdAllocator {
    rank: Rank,
    next: u64,
}

impl IdAllocator {
    fn next_id(&mut self) -> DistributedId {
        let id = DistributedId::new(self.rank, self.next);
        self.next += 1;
        id
    }
}

/// Agents and cells owned by one rank, plus its buffered writes.
#[derive(Debug)]
pub struct Partition {
    rank: Rank,
    agents: Vec<Agent>,
    cells: Vec<usize>,
    ids: IdAllocator,
    rng: SmallRng,
    pending: PendingWrites,
    probes: Probes,
}

impl Partition {
    fn new(rank: Rank, rng: SmallRng) -> Self {
        Self {
            rank,
            agents: Vec::new(),
            cells: Vec::new(),
            ids: IdAllocator { rank, next: 0 },
            rng,
            pending: PendingWrites::default(),
            probes: Probes::default(),
        }
    }

    #[must_use]
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Local agents in id order.
    #[must_use]
    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    /// Dense indices of the local cells.
    #[must_use]
    pub fn cells(&self) -> &[usize] {
        &self.cells
    }

    /// Probes accumulated since the last [`Substrate::take_probes`].
    #[must_use]
    pub fn probes(&self) -> Probes {
        self.probes
    }

    fn agent_position(&self, id: DistributedId) -> Option<usize> {
        self.agents.binary_search_by_key(&id, Agent::id).ok()
    }

    fn scope<'a>(&'a mut self, graph: &'a SharedGraph) -> (PartitionScope<'a>, &'a mut [Agent]) {
        let Self {
            rank,
            agents,
            ids,
            rng,
            pending,
            probes,
            ..
        } = self;
        let scope = PartitionScope {
            rank: *rank,
            graph,
            ids,
            rng,
            pending,
            probes,
        };
        (scope, agents.as_mut_slice())
    }

    /// Runs `behavior` on every local agent in id order.
    pub fn for_each_agent<F>(&mut self, graph: &SharedGraph, mut behavior: F) -> Result<(), BehaviorError>
    where
        F: FnMut(&mut Agent, &mut PartitionScope<'_>) -> Result<(), BehaviorError>,
    {
        let (mut scope, agents) = self.scope(graph);
        for agent in agents {
            behavior(agent, &mut scope)?;
        }
        Ok(())
    }

    /// Runs `behavior` on every local cell.
    pub fn for_each_cell<F>(&mut self, graph: &SharedGraph, mut behavior: F) -> Result<(), BehaviorError>
    where
        F: FnMut(&Cell, &mut PartitionScope<'_>) -> Result<(), BehaviorError>,
    {
        let cells = mem::take(&mut self.cells);
        let (mut scope, _) = self.scope(graph);
        let outcome = cells
            .iter()
            .filter_map(|&index| graph.cells.get(index))
            .try_for_each(|cell| behavior(cell, &mut scope));
        self.cells = cells;
        outcome
    }
}

/// Graph state as of the last barrier, shared read-only during phases.
pub struct SharedGraph {
    topology: Box<dyn NeighborhoodIndex>,
    cells: Vec<Cell>,
    cell_lookup: HashMap<DistributedId, usize>,
    agents: BTreeMap<DistributedId, AgentView>,
    occupancy: Vec<Vec<DistributedId>>,
    edges: EdgeStore,
}

impl fmt::Debug for SharedGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedGraph")
            .field("cells", &self.cells.len())
            .field("agents", &self.agents.len())
            .field("edges", &self.edges.len())
            .finish()
    }
}

impl SharedGraph {
    #[must_use]
    pub fn topology(&self) -> &dyn NeighborhoodIndex {
        self.topology.as_ref()
    }

    #[must_use]
    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    #[must_use]
    pub fn cell(&self, id: DistributedId) -> Option<&Cell> {
        self.cell_index(id).map(|index| &self.cells[index])
    }

    #[must_use]
    pub fn cell_index(&self, id: DistributedId) -> Option<usize> {
        self.cell_lookup.get(&id).copied()
    }

    #[must_use]
    pub fn agent(&self, id: DistributedId) -> Option<&AgentView> {
        self.agents.get(&id)
    }

    /// Published agents in id order.
    pub fn agents(&self) -> impl Iterator<Item = &AgentView> {
        self.agents.values()
    }

    /// Agents located on `cell`, in id order.
    #[must_use]
    pub fn agents_on(&self, cell: DistributedId) -> &[DistributedId] {
        self.cell_index(cell)
            .map_or(&[][..], |index| self.occupancy[index].as_slice())
    }

    #[must_use]
    pub fn edges(&self) -> &EdgeStore {
        &self.edges
    }

    /// Cells within `range` of `location`, `location` included, in topology order.
    pub fn neighborhood(
        &self,
        location: DistributedId,
        range: u32,
    ) -> Result<Vec<DistributedId>, BehaviorError> {
        let index = self
            .cell_index(location)
            .ok_or(BehaviorError::UnknownCell(location))?;
        let mut cells = Vec::new();
        self.topology.neighbors_within(index, range, &mut |neighbor| {
            cells.push(self.cells[neighbor].id);
        });
        Ok(cells)
    }

    /// Agents published on the cells within `range` of `location`.
    pub fn agents_within(
        &self,
        location: DistributedId,
        range: u32,
    ) -> Result<Vec<DistributedId>, BehaviorError> {
        Ok(self
            .neighborhood(location, range)?
            .into_iter()
            .flat_map(|cell| self.agents_on(cell).iter().copied())
            .collect())
    }

    fn publish(&mut self, view: AgentView) {
        let id = view.id;
        let location = view.location;
        let Some(&target) = self.cell_lookup.get(&location) else {
            return;
        };
        if let Some(previous) = self.agents.insert(id, view) {
            if previous.location == location {
                return;
            }
            if let Some(&old) = self.cell_lookup.get(&previous.location) {
                let occupants = &mut self.occupancy[old];
                if let Ok(position) = occupants.binary_search(&id) {
                    occupants.remove(position);
                }
            }
        }
        let occupants = &mut self.occupancy[target];
        if let Err(position) = occupants.binary_search(&id) {
            occupants.insert(position, id);
        }
    }

    fn apply(&mut self, writes: PendingWrites, agents: &[Agent]) -> SyncStats {
        let mut stats = SyncStats::default();
        for id in writes.unlinked {
            if self.edges.remove(id).is_some() {
                stats.unlinked += 1;
            }
        }
        for edge in writes.linked.into_values().flatten() {
            self.edges.insert(edge);
            stats.linked += 1;
        }
        for (id, weight) in writes.weights {
            self.edges.set_weight(id, weight);
        }
        for index in writes.acquisitions {
            if let Some(cell) = self.cells.get_mut(index) {
                cell.acquisitions += 1;
            }
        }
        for id in writes.dirty {
            if let Ok(position) = agents.binary_search_by_key(&id, Agent::id) {
                self.publish(agents[position].view());
                stats.published += 1;
            }
        }
        stats
    }
}

/// Access a partition's behaviours have to the graph during a phase.
///
/// Reads go through the published graph; writes land in the partition's
/// buffer and stay invisible to other partitions until the next barrier.
pub struct PartitionScope<'a> {
    rank: Rank,
    graph: &'a SharedGraph,
    ids: &'a mut IdAllocator,
    rng: &'a mut SmallRng,
    pending: &'a mut PendingWrites,
    probes: &'a mut Probes,
}

impl<'a> PartitionScope<'a> {
    #[must_use]
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Whether `node` is owned by this partition.
    #[must_use]
    pub fn is_local(&self, node: DistributedId) -> bool {
        node.rank == self.rank
    }

    pub fn rng(&mut self) -> &mut SmallRng {
        self.rng
    }

    #[must_use]
    pub fn graph(&self) -> &'a SharedGraph {
        self.graph
    }

    /// Cells reachable from `location` within `range`.
    pub fn mobility_field(
        &self,
        location: DistributedId,
        range: u32,
    ) -> Result<Vec<DistributedId>, BehaviorError> {
        self.graph.neighborhood(location, range)
    }

    /// Other agents on the cells within `range` of `agent`.
    pub fn perception_field(
        &self,
        agent: &Agent,
        range: u32,
    ) -> Result<Vec<DistributedId>, BehaviorError> {
        let mut perceived = self.graph.agents_within(agent.location, range)?;
        perceived.retain(|&other| other != agent.id);
        Ok(perceived)
    }

    /// Shared snapshot of a cell.
    pub fn read_cell(&mut self, id: DistributedId) -> Result<ReadGuard<CellView>, BehaviorError> {
        let cell = self.graph.cell(id).ok_or(BehaviorError::UnknownCell(id))?;
        let local = self.is_local(id);
        self.probes.record_read(local);
        Ok(ReadGuard { value: cell.view() })
    }

    /// Shared snapshot of an agent as of the last barrier.
    pub fn read_agent(&mut self, id: DistributedId) -> Result<ReadGuard<AgentView>, BehaviorError> {
        let agent = self
            .graph
            .agent(id)
            .ok_or(BehaviorError::UnknownAgent(id))?;
        let local = self.is_local(id);
        self.probes.record_read(local);
        Ok(ReadGuard {
            value: agent.clone(),
        })
    }

    /// Exclusive acquisition of a cell, committed at the next barrier.
    pub fn write_cell(&mut self, id: DistributedId) -> Result<WriteGuard<'_>, BehaviorError> {
        let index = self
            .graph
            .cell_index(id)
            .ok_or(BehaviorError::UnknownCell(id))?;
        let local = self.is_local(id);
        self.probes.record_write(local);
        Ok(WriteGuard {
            cell: self.graph.cells[index].view(),
            index,
            released: &mut self.pending.acquisitions,
        })
    }

    /// Creates an edge, visible to this partition at once and to others after
    /// the next barrier.
    pub fn link(
        &mut self,
        source: DistributedId,
        target: DistributedId,
        layer: Layer,
        weight: f32,
    ) -> Edge {
        let edge = Edge {
            id: self.ids.next_id(),
            layer,
            source,
            target,
            weight,
        };
        self.pending
            .linked
            .entry((source, layer))
            .or_default()
            .push(edge);
        self.probes.links += 1;
        edge
    }

    /// Removes an edge; unlinking a link buffered in the same phase cancels it.
    pub fn unlink(&mut self, edge: Edge) {
        self.probes.unlinks += 1;
        if let Some(buffered) = self.pending.linked.get_mut(&(edge.source, edge.layer))
            && let Some(position) = buffered.iter().position(|linked| linked.id == edge.id)
        {
            buffered.remove(position);
            return;
        }
        self.pending.unlinked.insert(edge.id);
    }

    /// Outgoing edges of `source` on `layer` as this partition sees them:
    /// published edges minus local unlinks, plus local links.
    #[must_use]
    pub fn outgoing_edges(&self, source: DistributedId, layer: Layer) -> Vec<Edge> {
        let mut edges: Vec<Edge> = self
            .graph
            .edges
            .outgoing(source, layer)
            .filter(|edge| !self.pending.unlinked.contains(&edge.id))
            .copied()
            .collect();
        if let Some(buffered) = self.pending.linked.get(&(source, layer)) {
            edges.extend(buffered.iter().copied());
        }
        edges
    }

    pub fn set_edge_weight(&mut self, edge: &Edge, weight: f32) {
        self.pending.weights.push((edge.id, weight));
    }

    /// Published number of agents on `cell`.
    #[must_use]
    pub fn occupancy(&self, cell: DistributedId) -> usize {
        self.graph.agents_on(cell).len()
    }

    /// Schedules `agent` to be republished at the next barrier.
    pub fn mark_dirty(&mut self, agent: DistributedId) {
        self.pending.dirty.insert(agent);
    }

    /// Moves `agent` to `cell`, replacing its `LOCATION` edge.
    pub fn move_to(&mut self, agent: &mut Agent, cell: DistributedId) -> Result<(), BehaviorError> {
        if agent.location == cell {
            return Ok(());
        }
        if self.graph.cell_index(cell).is_none() {
            return Err(BehaviorError::UnknownCell(cell));
        }
        self.unlink(agent.location_edge);
        agent.location_edge = self.link(agent.id, cell, Layer::Location, 1.0);
        agent.location = cell;
        self.mark_dirty(agent.id);
        Ok(())
    }
}

/// Shared access to a node, released when dropped.
#[derive(Debug, Clone)]
pub struct ReadGuard<T> {
    value: T,
}

impl<T> ReadGuard<T> {
    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> Deref for ReadGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

/// Exclusive access to a cell; the acquisition is committed on drop.
#[derive(Debug)]
pub struct WriteGuard<'s> {
    cell: CellView,
    index: usize,
    released: &'s mut Vec<usize>,
}

impl Deref for WriteGuard<'_> {
    type Target = CellView;

    fn deref(&self) -> &CellView {
        &self.cell
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.released.push(self.index);
    }
}

/// Published graph plus the partitions that own its nodes.
#[derive(Debug)]
pub struct Substrate {
    graph: SharedGraph,
    partitions: Vec<Partition>,
}

impl Substrate {
    /// Lays out one cell per topology index, splits them into contiguous
    /// blocks across `ranks` partitions and links `CELL_SUCCESSOR` edges.
    pub fn new<R: Rng + ?Sized>(
        topology: Box<dyn NeighborhoodIndex>,
        field: &UtilityField,
        ranks: Rank,
        cell_size: usize,
        cell_edge_weight: f32,
        rng: &mut R,
    ) -> Self {
        let ranks = ranks.max(1);
        let mut partitions: Vec<Partition> = (0..ranks)
            .map(|rank| Partition::new(rank, SmallRng::seed_from_u64(rng.random())))
            .collect();
        let len = topology.len();
        let mut cells = Vec::with_capacity(len);
        let mut cell_lookup = HashMap::with_capacity(len);
        for index in 0..len {
            let partition = &mut partitions[owner_of(index, len, ranks) as usize];
            let id = partition.ids.next_id();
            partition.cells.push(index);
            let point = topology.locate(index);
            let utility = point.map_or(1.0, |point| field.utility_at(point));
            cell_lookup.insert(id, index);
            cells.push(Cell::new(id, index, point, utility, cell_size));
        }
        let mut edges = EdgeStore::default();
        for (index, cell) in cells.iter().enumerate() {
            let partition = &mut partitions[cell.id.rank as usize];
            for successor in topology.successors(index) {
                edges.insert(Edge {
                    id: partition.ids.next_id(),
                    layer: Layer::CellSuccessor,
                    source: cell.id,
                    target: cells[successor].id,
                    weight: cell_edge_weight,
                });
            }
        }
        let graph = SharedGraph {
            topology,
            occupancy: vec![Vec::new(); len],
            cells,
            cell_lookup,
            agents: BTreeMap::new(),
            edges,
        };
        Self { graph, partitions }
    }

    /// Creates an agent on the cell at `cell_index`, owned by that cell's
    /// partition and published immediately.
    pub fn spawn_agent(&mut self, cell_index: usize) -> Result<DistributedId, BehaviorError> {
        let cell = self
            .graph
            .cells
            .get(cell_index)
            .map(Cell::id)
            .ok_or(BehaviorError::UnknownCell(DistributedId::new(0, cell_index as u64)))?;
        let partition = &mut self.partitions[cell.rank as usize];
        let id = partition.ids.next_id();
        let location_edge = Edge {
            id: partition.ids.next_id(),
            layer: Layer::Location,
            source: id,
            target: cell,
            weight: 1.0,
        };
        let agent = Agent {
            id,
            location: cell,
            location_edge,
            contacts: ContactList::new(),
        };
        self.graph.edges.insert(location_edge);
        self.graph.publish(agent.view());
        partition.agents.push(agent);
        Ok(id)
    }

    #[must_use]
    pub fn graph(&self) -> &SharedGraph {
        &self.graph
    }

    #[must_use]
    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    /// Published graph and mutable partitions, for running a phase.
    pub fn split(&mut self) -> (&SharedGraph, &mut [Partition]) {
        (&self.graph, &mut self.partitions)
    }

    /// Live state of an agent, including unsynchronized changes.
    #[must_use]
    pub fn agent(&self, id: DistributedId) -> Option<&Agent> {
        let partition = self.partitions.get(id.rank as usize)?;
        partition
            .agent_position(id)
            .map(|position| &partition.agents[position])
    }

    /// Live agents, by rank then id.
    pub fn agents(&self) -> impl Iterator<Item = &Agent> {
        self.partitions.iter().flat_map(|partition| partition.agents.iter())
    }

    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.partitions.iter().map(|partition| partition.agents.len()).sum()
    }

    /// Runs `behavior` on a single agent inside its partition's scope.
    pub fn with_agent<T>(
        &mut self,
        id: DistributedId,
        behavior: impl FnOnce(&mut Agent, &mut PartitionScope<'_>) -> T,
    ) -> Option<T> {
        let partition = self.partitions.get_mut(id.rank as usize)?;
        let position = partition.agent_position(id)?;
        let (mut scope, agents) = partition.scope(&self.graph);
        Some(behavior(&mut agents[position], &mut scope))
    }

    /// Edges buffered on `layer` and not yet published.
    #[must_use]
    pub fn pending_edges(&self, layer: Layer) -> usize {
        self.partitions
            .iter()
            .map(|partition| partition.pending.linked_on(layer))
            .sum()
    }

    /// Barrier: folds every partition's buffered writes into the published
    /// graph, in rank order.
    pub fn synchronize(&mut self) -> SyncStats {
        let mut stats = SyncStats::default();
        for partition in &mut self.partitions {
            let writes = mem::take(&mut partition.pending);
            stats += self.graph.apply(writes, &partition.agents);
        }
        stats
    }

    /// Sums and resets the probes of every partition.
    pub fn take_probes(&mut self) -> Probes {
        let mut total = Probes::default();
        for partition in &mut self.partitions {
            total += mem::take(&mut partition.probes);
        }
        total
    }
}

fn owner_of(index: usize, len: usize, ranks: Rank) -> Rank {
    (index as u64 * u64::from(ranks) / len as u64) as Rank
}
