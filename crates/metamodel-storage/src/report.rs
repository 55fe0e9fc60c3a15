//! File reports: per-rank agent dumps, grid dumps and a DOT rendering of the
//! model graph.

use metamodel_core::{AgentState, DistributedId, GridPoint, Layer, Model, Rank};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Errors raised while writing reports.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("report io error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("report serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Where an agent sits: grid coordinates when the environment is a grid,
/// the cell id otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReportLocation {
    Point(GridPoint),
    Cell(DistributedId),
}

/// One local agent of a rank report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: DistributedId,
    pub contacts: Vec<DistributedId>,
    pub perceptions: Vec<DistributedId>,
    pub location: ReportLocation,
}

/// Agent referenced by a rank's agents but owned by another rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistantRecord {
    pub id: DistributedId,
    pub rank: Rank,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridShape {
    pub width: u32,
    pub height: u32,
}

/// Agents owned by one rank at one tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentsReport {
    pub rank: Rank,
    pub tick: u64,
    pub grid: GridShape,
    pub agents: Vec<AgentRecord>,
    pub distant_agents: Vec<DistantRecord>,
}

/// Builds the report of `rank` from agent snapshots.
#[must_use]
pub fn agents_report(model: &Model, states: &[AgentState], rank: Rank) -> AgentsReport {
    let config = model.config();
    let mut distant = BTreeSet::new();
    let agents = states
        .iter()
        .filter(|state| state.id.rank == rank)
        .map(|state| {
            distant.extend(
                state
                    .contacts
                    .iter()
                    .chain(state.perceptions.iter().copied())
                    .filter(|other| other.rank != rank),
            );
            AgentRecord {
                id: state.id,
                contacts: state.contacts.to_vec(),
                perceptions: state.perceptions.clone(),
                location: state
                    .location_point
                    .map_or(ReportLocation::Cell(state.location), ReportLocation::Point),
            }
        })
        .collect();
    AgentsReport {
        rank,
        tick: model.tick().0,
        grid: GridShape {
            width: config.grid_width,
            height: config.grid_height,
        },
        agents,
        distant_agents: distant
            .into_iter()
            .map(|id: DistributedId| DistantRecord { id, rank: id.rank })
            .collect(),
    }
}

/// Writes `agents.<rank>.<tick>.json` for every rank into `dir`.
pub fn write_agents_reports(model: &Model, dir: &Path) -> Result<Vec<PathBuf>, ReportError> {
    let states = model.agent_states();
    let tick = model.tick().0;
    let mut written = Vec::new();
    for rank in 0..model.config().partitions {
        let path = dir.join(format!("agents.{rank}.{tick}.json"));
        write_json(&path, &agents_report(model, &states, rank))?;
        written.push(path);
    }
    debug!(tick, files = written.len(), "agent reports written");
    Ok(written)
}

/// Utility of every grid cell, indexed `[y][x]`. `None` for graph environments.
#[must_use]
pub fn utility_grid(model: &Model) -> Option<Vec<Vec<f32>>> {
    grid_of(model, |cell| cell.utility(), 0.0)
}

/// Owning rank of every grid cell, indexed `[y][x]`.
#[must_use]
pub fn owner_grid(model: &Model) -> Option<Vec<Vec<Rank>>> {
    grid_of(model, |cell| cell.id().rank, 0)
}

fn grid_of<T: Clone>(
    model: &Model,
    value: impl Fn(&metamodel_core::Cell) -> T,
    fill: T,
) -> Option<Vec<Vec<T>>> {
    let config = model.config();
    if !config.environment.is_grid() {
        return None;
    }
    let mut grid = vec![vec![fill; config.grid_width as usize]; config.grid_height as usize];
    for cell in model.graph().cells() {
        let point = cell.point()?;
        if let Some(slot) = grid
            .get_mut(point.y as usize)
            .and_then(|row| row.get_mut(point.x as usize))
        {
            *slot = value(cell);
        }
    }
    Some(grid)
}

/// Writes `grid.json` (utilities) and `cells.json` (owners) for grid
/// environments; graph environments produce nothing.
pub fn write_grid_reports(model: &Model, dir: &Path) -> Result<Vec<PathBuf>, ReportError> {
    let (Some(utilities), Some(owners)) = (utility_grid(model), owner_grid(model)) else {
        return Ok(Vec::new());
    };
    let grid_path = dir.join("grid.json");
    write_json(&grid_path, &utilities)?;
    let cells_path = dir.join("cells.json");
    write_json(&cells_path, &owners)?;
    Ok(vec![grid_path, cells_path])
}

fn node_name(id: DistributedId) -> String {
    format!("n{}_{}", id.rank, id.id)
}

/// Renders cells, agents and their `LOCATION`, `PERCEPTION`, `CONTACT` and
/// `CELL_SUCCESSOR` edges as an undirected Graphviz graph, colored by rank.
#[must_use]
pub fn render_dot(model: &Model) -> String {
    let graph = model.graph();
    let mut out = String::new();
    let _ = writeln!(out, "strict graph model {{");
    let _ = writeln!(
        out,
        "overlap=true;size=\"10,10\";K=1;ratio=compress;outputorder=edgesfirst;"
    );
    let _ = writeln!(out, "node [colorscheme=set19];");
    let _ = writeln!(out, "edge [colorscheme=set39,dir=none];");

    for cell in graph.cells() {
        let color = cell.id().rank + 1;
        match cell.point() {
            Some(point) => {
                let _ = writeln!(
                    out,
                    "{}[fixedsize=true,label=\"\",height=.3,width=.3,pos=\"{},{}!\",shape=diamond,style=filled,fillcolor={color},color={color}];",
                    node_name(cell.id()),
                    point.x * 2,
                    point.y * 2,
                );
            }
            None => {
                let _ = writeln!(
                    out,
                    "{}[fixedsize=true,label=\"\",height=.3,width=.3,shape=diamond,style=filled,fillcolor={color},color={color}];",
                    node_name(cell.id()),
                );
            }
        }
    }
    let states = model.agent_states();
    for state in &states {
        let color = state.id.rank + 1;
        let _ = writeln!(
            out,
            "{}[fixedsize=true,label=\"\",height=.5,width=.5,style=filled,fillcolor={color},color={color}];",
            node_name(state.id),
        );
    }

    let mut edge = |source: DistributedId, target: DistributedId, layer: Layer| {
        let color = 6 + layer as u32;
        let style = match layer {
            Layer::Location => "len=0.1,weight=10000,style=bold,",
            Layer::Perception | Layer::Contact => "style=bold,",
            Layer::NewContact | Layer::CellSuccessor => "style=solid,",
        };
        let _ = writeln!(
            out,
            "{} -- {} [color={color},{style}];",
            node_name(source),
            node_name(target)
        );
    };
    for cell in graph.cells() {
        for successor in graph.edges().outgoing(cell.id(), Layer::CellSuccessor) {
            edge(successor.source, successor.target, Layer::CellSuccessor);
        }
    }
    for state in &states {
        edge(state.id, state.location, Layer::Location);
        for &perceived in &state.perceptions {
            edge(state.id, perceived, Layer::Perception);
        }
        for contact in state.contacts.iter() {
            edge(state.id, contact, Layer::Contact);
        }
    }
    out.push_str("}\n");
    out
}

/// Writes `graph.dot` into `dir`.
pub fn write_dot(model: &Model, dir: &Path) -> Result<PathBuf, ReportError> {
    let path = dir.join("graph.dot");
    fs::write(&path, render_dot(model)).map_err(|source| ReportError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), ReportError> {
    let io_error = |source| ReportError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = File::create(path).map_err(io_error)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, value)?;
    writer.flush().map_err(io_error)?;
    Ok(())
}
