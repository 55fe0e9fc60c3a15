//! DuckDB-backed persistence layer and file reports for metamodel runs.

use duckdb::{Connection, Transaction, params};
use metamodel_core::{AgentState, DistributedId, ModelPersistence, PersistenceBatch};
use std::{
    sync::{Arc, Mutex, mpsc},
    thread,
};
use thiserror::Error;
use tracing::{error, warn};

pub mod report;

pub use report::ReportError;

const DEFAULT_TICK_BUFFER: usize = 32;
const DEFAULT_AGENT_BUFFER: usize = 1024;
const DEFAULT_METRIC_BUFFER: usize = 256;
const DEFAULT_CONTACT_BUFFER: usize = 4096;

/// Storage error wrapper.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("duckdb error: {0}")]
    DuckDb(#[from] duckdb::Error),
    #[error("storage worker error: {0}")]
    Worker(String),
}

/// Summary row written to the `ticks` table.
#[derive(Debug, Clone)]
struct TickRow {
    tick: i64,
    agent_count: i64,
    contact_edges: i64,
    new_contact_edges: i64,
    average_contacts: f64,
    saturated_agents: i64,
    local_reads: i64,
    distant_reads: i64,
    local_writes: i64,
    distant_writes: i64,
}

/// Metric row written to the `metrics` table.
#[derive(Debug, Clone)]
struct MetricRow {
    tick: i64,
    name: String,
    value: f64,
}

/// Per-agent snapshot row written to the `agents` table.
#[derive(Debug, Clone)]
struct AgentRow {
    tick: i64,
    rank: i64,
    agent_id: i64,
    cell_rank: i64,
    cell_id: i64,
    x: Option<i64>,
    y: Option<i64>,
    contact_count: i64,
    perception_count: i64,
}

/// One contact list entry written to the `contacts` table.
#[derive(Debug, Clone)]
struct ContactRow {
    tick: i64,
    rank: i64,
    agent_id: i64,
    position: i64,
    contact_rank: i64,
    contact_id: i64,
}

/// Latest metric reading fetched for analytics displays.
#[derive(Debug, Clone)]
pub struct MetricReading {
    pub tick: i64,
    pub name: String,
    pub value: f64,
}

/// Agents ranked by their average contact count across recorded ticks.
#[derive(Debug, Clone)]
pub struct ConnectivityStats {
    pub agent: DistributedId,
    pub avg_contacts: f64,
    pub max_contacts: i64,
    pub last_tick: i64,
}

#[derive(Default)]
struct StorageBuffer {
    ticks: Vec<TickRow>,
    metrics: Vec<MetricRow>,
    agents: Vec<AgentRow>,
    contacts: Vec<ContactRow>,
}

impl StorageBuffer {
    fn is_empty(&self) -> bool {
        self.ticks.is_empty()
            && self.metrics.is_empty()
            && self.agents.is_empty()
            && self.contacts.is_empty()
    }

    fn clear(&mut self) {
        self.ticks.clear();
        self.metrics.clear();
        self.agents.clear();
        self.contacts.clear();
    }
}

/// DuckDB-backed persistence sink with buffered writes.
pub struct Storage {
    conn: Connection,
    buffer: StorageBuffer,
    tick_flush_threshold: usize,
    agent_flush_threshold: usize,
    metric_flush_threshold: usize,
    contact_flush_threshold: usize,
}

impl Storage {
    /// Open or create a DuckDB database at the provided path with default buffering thresholds.
    pub fn open(path: &str) -> Result<Self, StorageError> {
        Self::with_thresholds(
            path,
            DEFAULT_TICK_BUFFER,
            DEFAULT_AGENT_BUFFER,
            DEFAULT_METRIC_BUFFER,
        )
    }

    /// Override flush thresholds for ticks, agents, and metrics respectively.
    pub fn with_thresholds(
        path: &str,
        tick: usize,
        agent: usize,
        metric: usize,
    ) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let mut storage = Self {
            conn,
            buffer: StorageBuffer::default(),
            tick_flush_threshold: tick,
            agent_flush_threshold: agent,
            metric_flush_threshold: metric,
            contact_flush_threshold: DEFAULT_CONTACT_BUFFER,
        };
        storage.initialize_schema()?;
        Ok(storage)
    }

    fn initialize_schema(&mut self) -> Result<(), StorageError> {
        self.conn.execute_batch(
            "create table if not exists ticks (
                tick bigint primary key,
                agent_count bigint,
                contact_edges bigint,
                new_contact_edges bigint,
                average_contacts double,
                saturated_agents bigint,
                local_reads bigint,
                distant_reads bigint,
                local_writes bigint,
                distant_writes bigint
            );
            create table if not exists metrics (
                tick bigint,
                name text,
                value double,
                primary key (tick, name)
            );
            create table if not exists agents (
                tick bigint,
                rank bigint,
                agent_id bigint,
                cell_rank bigint,
                cell_id bigint,
                x bigint,
                y bigint,
                contact_count bigint,
                perception_count bigint,
                primary key (tick, rank, agent_id)
            );
            create table if not exists contacts (
                tick bigint,
                rank bigint,
                agent_id bigint,
                position bigint,
                contact_rank bigint,
                contact_id bigint,
                primary key (tick, rank, agent_id, position)
            );",
        )?;
        Ok(())
    }

    fn enqueue(&mut self, payload: &PersistenceBatch) -> Result<(), StorageError> {
        let summary = &payload.summary;
        let tick = summary.tick.0 as i64;
        let probes = summary.probes;

        self.buffer.ticks.push(TickRow {
            tick,
            agent_count: summary.agent_count as i64,
            contact_edges: summary.contact_edges as i64,
            new_contact_edges: summary.new_contact_edges as i64,
            average_contacts: f64::from(summary.average_contacts),
            saturated_agents: summary.saturated_agents as i64,
            local_reads: probes.local_reads as i64,
            distant_reads: probes.distant_reads as i64,
            local_writes: probes.local_writes as i64,
            distant_writes: probes.distant_writes as i64,
        });

        for metric in &payload.metrics {
            self.buffer.metrics.push(MetricRow {
                tick,
                name: metric.name.to_string(),
                value: metric.value,
            });
        }

        for agent in &payload.agents {
            self.buffer.agents.push(agent_row_from_state(tick, agent));
            self.buffer.contacts.extend(
                agent
                    .contacts
                    .iter()
                    .enumerate()
                    .map(|(position, contact)| ContactRow {
                        tick,
                        rank: i64::from(agent.id.rank),
                        agent_id: agent.id.id as i64,
                        position: position as i64,
                        contact_rank: i64::from(contact.rank),
                        contact_id: contact.id as i64,
                    }),
            );
        }

        self.maybe_flush()?;
        Ok(())
    }

    /// Persist a simulation payload, buffering until thresholds are met.
    pub fn persist(&mut self, payload: &PersistenceBatch) -> Result<(), StorageError> {
        self.enqueue(payload)
    }

    fn maybe_flush(&mut self) -> Result<(), StorageError> {
        if self.buffer.ticks.len() >= self.tick_flush_threshold
            || self.buffer.metrics.len() >= self.metric_flush_threshold
            || self.buffer.agents.len() >= self.agent_flush_threshold
            || self.buffer.contacts.len() >= self.contact_flush_threshold
        {
            self.flush()?;
        }
        Ok(())
    }

    fn insert_ticks(tx: &Transaction<'_>, rows: &[TickRow]) -> Result<(), duckdb::Error> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut stmt = tx.prepare(
            "insert or replace into ticks (
                tick, agent_count, contact_edges, new_contact_edges, average_contacts,
                saturated_agents, local_reads, distant_reads, local_writes, distant_writes
            ) values (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )?;
        for row in rows {
            stmt.execute(params![
                row.tick,
                row.agent_count,
                row.contact_edges,
                row.new_contact_edges,
                row.average_contacts,
                row.saturated_agents,
                row.local_reads,
                row.distant_reads,
                row.local_writes,
                row.distant_writes,
            ])?;
        }
        Ok(())
    }

    fn insert_metrics(tx: &Transaction<'_>, rows: &[MetricRow]) -> Result<(), duckdb::Error> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut stmt =
            tx.prepare("insert or replace into metrics (tick, name, value) values (?, ?, ?)")?;
        for row in rows {
            stmt.execute(params![row.tick, row.name, row.value])?;
        }
        Ok(())
    }

    fn insert_agents(tx: &Transaction<'_>, rows: &[AgentRow]) -> Result<(), duckdb::Error> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut stmt = tx.prepare(
            "insert or replace into agents (
                tick, rank, agent_id, cell_rank, cell_id, x, y, contact_count, perception_count
            ) values (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )?;
        for row in rows {
            stmt.execute(params![
                row.tick,
                row.rank,
                row.agent_id,
                row.cell_rank,
                row.cell_id,
                row.x,
                row.y,
                row.contact_count,
                row.perception_count,
            ])?;
        }
        Ok(())
    }

    fn insert_contacts(tx: &Transaction<'_>, rows: &[ContactRow]) -> Result<(), duckdb::Error> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut stmt = tx.prepare(
            "insert or replace into contacts (
                tick, rank, agent_id, position, contact_rank, contact_id
            ) values (?, ?, ?, ?, ?, ?)",
        )?;
        for row in rows {
            stmt.execute(params![
                row.tick,
                row.rank,
                row.agent_id,
                row.position,
                row.contact_rank,
                row.contact_id,
            ])?;
        }
        Ok(())
    }

    /// Force flush buffered records to disk.
    pub fn flush(&mut self) -> Result<(), StorageError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let tx = self.conn.transaction()?;
        Self::insert_ticks(&tx, &self.buffer.ticks)?;
        Self::insert_metrics(&tx, &self.buffer.metrics)?;
        Self::insert_agents(&tx, &self.buffer.agents)?;
        Self::insert_contacts(&tx, &self.buffer.contacts)?;
        tx.commit()?;
        self.buffer.clear();
        Ok(())
    }

    /// Number of rows currently stored in `table`.
    pub fn row_count(&mut self, table: Table) -> Result<i64, StorageError> {
        self.flush()?;
        let count = self.conn.query_row(
            &format!("select count(*) from {}", table.as_str()),
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Return agents ranked by average contact count across all recorded ticks.
    pub fn most_connected(&mut self, limit: usize) -> Result<Vec<ConnectivityStats>, StorageError> {
        self.flush()?;
        let mut stmt = self.conn.prepare(
            "select rank,
                    agent_id,
                    avg(contact_count) as avg_contacts,
                    max(contact_count) as max_contacts,
                    max(tick) as last_tick
             from agents
             group by rank, agent_id
             order by avg_contacts desc, rank asc, agent_id asc
             limit ?",
        )?;
        let mut rows = stmt.query(params![limit as i64])?;
        let mut stats = Vec::with_capacity(limit.min(16));
        while let Some(row) = rows.next()? {
            stats.push(ConnectivityStats {
                agent: DistributedId::new(row.get::<_, i64>(0)? as u32, row.get::<_, i64>(1)? as u64),
                avg_contacts: row.get::<_, f64>(2)?,
                max_contacts: row.get::<_, i64>(3)?,
                last_tick: row.get::<_, i64>(4)?,
            });
        }
        Ok(stats)
    }

    /// Fetch the latest recorded metrics (ordered by name) up to `limit`.
    pub fn latest_metrics(&mut self, limit: usize) -> Result<Vec<MetricReading>, StorageError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        self.flush()?;
        let mut stmt = self.conn.prepare("select max(tick) from metrics")?;
        let mut rows = stmt.query([])?;
        let latest_tick = match rows.next()? {
            Some(row) => row.get::<_, Option<i64>>(0)?,
            None => None,
        };
        drop(rows);

        let Some(tick) = latest_tick else {
            return Ok(Vec::new());
        };

        let mut metrics_stmt = self.conn.prepare(
            "select name, value
             from metrics
             where tick = ?
             order by name asc
             limit ?",
        )?;
        let mut metrics_rows = metrics_stmt.query(params![tick, limit as i64])?;
        let mut readings = Vec::new();
        while let Some(row) = metrics_rows.next()? {
            readings.push(MetricReading {
                tick,
                name: row.get(0)?,
                value: row.get(1)?,
            });
        }
        Ok(readings)
    }

    /// Contact list of an agent at `tick`, oldest first.
    pub fn contacts_at(
        &mut self,
        tick: i64,
        agent: DistributedId,
    ) -> Result<Vec<DistributedId>, StorageError> {
        self.flush()?;
        let mut stmt = self.conn.prepare(
            "select contact_rank, contact_id
             from contacts
             where tick = ? and rank = ? and agent_id = ?
             order by position asc",
        )?;
        let mut rows = stmt.query(params![tick, i64::from(agent.rank), agent.id as i64])?;
        let mut contacts = Vec::new();
        while let Some(row) = rows.next()? {
            contacts.push(DistributedId::new(
                row.get::<_, i64>(0)? as u32,
                row.get::<_, i64>(1)? as u64,
            ));
        }
        Ok(contacts)
    }
}

/// Tables written by [`Storage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Ticks,
    Metrics,
    Agents,
    Contacts,
}

impl Table {
    fn as_str(self) -> &'static str {
        match self {
            Self::Ticks => "ticks",
            Self::Metrics => "metrics",
            Self::Agents => "agents",
            Self::Contacts => "contacts",
        }
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            error!(%err, "failed to flush persistence buffer on drop");
        }
    }
}

impl ModelPersistence for Storage {
    fn on_tick(&mut self, payload: &PersistenceBatch) {
        if let Err(err) = self.persist(payload) {
            warn!(tick = payload.summary.tick.0, %err, "failed to enqueue persistence data");
        }
    }
}

#[derive(Debug)]
enum StorageCommand {
    Persist(Box<PersistenceBatch>),
    Flush,
    Shutdown,
}

/// Persistence sink that hands batches to a dedicated writer thread.
pub struct StoragePipeline {
    tx: mpsc::Sender<StorageCommand>,
    storage: Arc<Mutex<Storage>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl StoragePipeline {
    /// Create an asynchronous pipeline using default buffering thresholds.
    pub fn new(path: &str) -> Result<Self, StorageError> {
        Self::from_storage(Storage::open(path)?)
    }

    /// Create an asynchronous pipeline with explicit thresholds.
    pub fn with_thresholds(
        path: &str,
        tick: usize,
        agent: usize,
        metric: usize,
    ) -> Result<Self, StorageError> {
        Self::from_storage(Storage::with_thresholds(path, tick, agent, metric)?)
    }

    fn from_storage(storage: Storage) -> Result<Self, StorageError> {
        let shared = Arc::new(Mutex::new(storage));
        let (tx, rx) = mpsc::channel::<StorageCommand>();
        let worker_storage = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("metamodel-storage-worker".into())
            .spawn(move || {
                while let Ok(command) = rx.recv() {
                    match command {
                        StorageCommand::Persist(batch) => {
                            let tick = batch.summary.tick.0;
                            let mut storage = match worker_storage.lock() {
                                Ok(storage) => storage,
                                Err(poisoned) => {
                                    warn!(tick, "storage mutex poisoned while persisting");
                                    poisoned.into_inner()
                                }
                            };
                            if let Err(err) = storage.persist(&batch) {
                                error!(tick, %err, "failed to persist tick asynchronously");
                            }
                        }
                        StorageCommand::Flush => {
                            if let Ok(mut storage) = worker_storage.lock()
                                && let Err(err) = storage.flush()
                            {
                                error!(%err, "failed to flush storage");
                            }
                        }
                        StorageCommand::Shutdown => {
                            if let Ok(mut storage) = worker_storage.lock() {
                                let _ = storage.flush();
                            }
                            break;
                        }
                    }
                }
            })
            .map_err(|err| {
                StorageError::Worker(format!("failed to spawn storage worker thread: {err}"))
            })?;

        Ok(Self {
            tx,
            storage: shared,
            handle: Some(handle),
        })
    }

    /// Exposes shared access to the underlying storage for analytics queries.
    #[must_use]
    pub fn storage(&self) -> Arc<Mutex<Storage>> {
        Arc::clone(&self.storage)
    }

    /// Request an immediate flush of buffered records.
    pub fn flush(&self) {
        let _ = self.tx.send(StorageCommand::Flush);
    }
}

impl ModelPersistence for StoragePipeline {
    fn on_tick(&mut self, payload: &PersistenceBatch) {
        if self
            .tx
            .send(StorageCommand::Persist(Box::new(payload.clone())))
            .is_err()
        {
            warn!(
                tick = payload.summary.tick.0,
                "storage worker channel closed; tick dropped"
            );
        }
    }
}

impl Drop for StoragePipeline {
    fn drop(&mut self) {
        let _ = self.tx.send(StorageCommand::Shutdown);
        if let Some(handle) = self.handle.take()
            && let Err(err) = handle.join()
        {
            error!(?err, "storage worker thread panicked");
        }
    }
}

fn agent_row_from_state(tick: i64, agent: &AgentState) -> AgentRow {
    AgentRow {
        tick,
        rank: i64::from(agent.id.rank),
        agent_id: agent.id.id as i64,
        cell_rank: i64::from(agent.location.rank),
        cell_id: agent.location.id as i64,
        x: agent.location_point.map(|point| point.x),
        y: agent.location_point.map(|point| point.y),
        contact_count: agent.contacts.len() as i64,
        perception_count: agent.perceptions.len() as i64,
    }
}
