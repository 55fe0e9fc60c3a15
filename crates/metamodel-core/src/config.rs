//! Model configuration loaded from YAML or JSON files.

use crate::mobility::MovePolicy;
use crate::utility::{Attractor, UtilityKind};
use rand::{SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while validating a configuration.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// An attractor cannot shape utility with a non-positive radius.
    #[error("attractor {index} has non-positive radius {radius}")]
    AttractorRadius { index: usize, radius: f32 },
}

/// Shape of the cell network.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Environment {
    #[default]
    Grid,
    /// Successors drawn uniformly at random.
    Random,
    /// Successors are the nearest cells in a random planar embedding.
    Clustered,
    /// Ring lattice with random rewiring.
    SmallWorld,
}

impl Environment {
    #[must_use]
    pub fn is_grid(self) -> bool {
        self == Self::Grid
    }
}

/// Whether agents maintain contacts at all.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentInteractions {
    None,
    #[default]
    Contacts,
}

/// Synchronization pattern exercised by every cell against its successors.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CellInteraction {
    #[default]
    None,
    ReadAll,
    ReadOne,
    WriteAll,
    WriteOne,
    ReadAllWriteOne,
    ReadAllWriteAll,
}

/// Per-agent behaviour parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentParams {
    pub move_policy: MovePolicy,
    /// Mobility and perception range, in Moore steps or successor hops.
    pub range_size: u32,
    /// Contact list capacity.
    pub max_contacts: usize,
    /// Weight stamped on `CONTACT` and `NEW_CONTACT` edges.
    pub contact_weight: f32,
}

impl Default for AgentParams {
    fn default() -> Self {
        Self {
            move_policy: MovePolicy::Random,
            range_size: 1,
            max_contacts: 10,
            contact_weight: 1.0,
        }
    }
}

/// Static configuration for a metamodel run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    pub environment: Environment,
    /// Grid width in cells (`GRID` only).
    pub grid_width: u32,
    /// Grid height in cells (`GRID` only).
    pub grid_height: u32,
    /// Cell count of graph environments.
    pub num_cells: usize,
    /// Successors per cell in graph environments.
    pub output_degree: usize,
    /// Rewiring probability of `SMALL_WORLD`.
    pub p: f32,
    /// Number of partitions sharing the cells and agents.
    pub partitions: u32,
    /// Agents per cell; the population is `floor(cells * occupation_rate)`.
    pub occupation_rate: f32,
    /// Ticks executed by a full run.
    pub num_steps: u64,
    pub utility: UtilityKind,
    pub attractors: Vec<Attractor>,
    /// Bytes of opaque payload carried by each cell.
    pub cell_size: usize,
    pub agent_interactions: AgentInteractions,
    pub cell_interactions: CellInteraction,
    /// Recompute `CELL_SUCCESSOR` weights from occupancy each tick.
    pub dynamic_cell_edge_weights: bool,
    pub cell_edge_weight: f32,
    /// Period of the neighborhood contact phase.
    pub refresh_local_contacts: u64,
    /// Period of the proposal and commit contact phases.
    pub refresh_distant_contacts: u64,
    pub agent: AgentParams,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
    /// Emit a JSON agent report every `json_output_period` ticks.
    pub json_output: bool,
    pub json_output_period: u64,
    /// Emit a DOT rendering of the final agent graph.
    pub dot_output: bool,
    /// Interval (ticks) between persistence batches. 0 disables persistence.
    pub persistence_interval: u32,
    /// Maximum number of recent tick summaries retained in-memory.
    pub history_capacity: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Grid,
            grid_width: 100,
            grid_height: 100,
            num_cells: 1_000,
            output_degree: 4,
            p: 0.1,
            partitions: 4,
            occupation_rate: 0.5,
            num_steps: 100,
            utility: UtilityKind::Uniform,
            attractors: Vec::new(),
            cell_size: 0,
            agent_interactions: AgentInteractions::Contacts,
            cell_interactions: CellInteraction::None,
            dynamic_cell_edge_weights: false,
            cell_edge_weight: 1.0,
            refresh_local_contacts: 1,
            refresh_distant_contacts: 1,
            agent: AgentParams::default(),
            rng_seed: None,
            json_output: false,
            json_output_period: 1,
            dot_output: false,
            persistence_interval: 0,
            history_capacity: 256,
        }
    }
}

impl ModelConfig {
    /// Number of cells the configured environment produces.
    #[must_use]
    pub fn cell_count(&self) -> usize {
        if self.environment.is_grid() {
            self.grid_width as usize * self.grid_height as usize
        } else {
            self.num_cells
        }
    }

    /// Initial agent population.
    #[must_use]
    pub fn agent_count(&self) -> usize {
        (self.cell_count() as f64 * f64::from(self.occupation_rate)).floor() as usize
    }

    #[must_use]
    pub fn contacts_enabled(&self) -> bool {
        self.agent_interactions == AgentInteractions::Contacts
    }

    /// Checks every invariant the model relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.environment {
            Environment::Grid => {
                if self.grid_width == 0 || self.grid_height == 0 {
                    return Err(ConfigError::InvalidConfig(
                        "grid dimensions must be non-zero",
                    ));
                }
            }
            Environment::Random | Environment::Clustered | Environment::SmallWorld => {
                if self.num_cells < 2 {
                    return Err(ConfigError::InvalidConfig(
                        "graph environments need at least two cells",
                    ));
                }
                if self.output_degree == 0 {
                    return Err(ConfigError::InvalidConfig(
                        "output_degree must be positive",
                    ));
                }
                if self.output_degree >= self.num_cells {
                    return Err(ConfigError::InvalidConfig(
                        "output_degree must be smaller than num_cells",
                    ));
                }
            }
        }
        if !(0.0..=1.0).contains(&self.p) {
            return Err(ConfigError::InvalidConfig("p must lie in [0, 1]"));
        }
        if self.partitions == 0 {
            return Err(ConfigError::InvalidConfig("partitions must be positive"));
        }
        if !(0.0..=1.0).contains(&self.occupation_rate) {
            return Err(ConfigError::InvalidConfig(
                "occupation_rate must lie in [0, 1]",
            ));
        }
        if let Some((index, attractor)) = self
            .attractors
            .iter()
            .enumerate()
            .find(|(_, attractor)| attractor.radius <= 0.0)
        {
            return Err(ConfigError::AttractorRadius {
                index,
                radius: attractor.radius,
            });
        }
        if self.agent.range_size == 0 {
            return Err(ConfigError::InvalidConfig("agent.range_size must be positive"));
        }
        if self.contacts_enabled() && self.agent.max_contacts == 0 {
            return Err(ConfigError::InvalidConfig(
                "agent.max_contacts must be positive when contacts are enabled",
            ));
        }
        if self.refresh_local_contacts == 0 || self.refresh_distant_contacts == 0 {
            return Err(ConfigError::InvalidConfig(
                "contact refresh periods must be positive",
            ));
        }
        if self.json_output && self.json_output_period == 0 {
            return Err(ConfigError::InvalidConfig(
                "json_output_period must be positive",
            ));
        }
        if self.cell_edge_weight < 0.0 || self.agent.contact_weight < 0.0 {
            return Err(ConfigError::InvalidConfig("edge weights must be non-negative"));
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::InvalidConfig("history_capacity must be positive"));
        }
        Ok(())
    }

    /// Returns the configured RNG seed, generating one from entropy if absent.
    #[must_use]
    pub fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metamodel_index::GridPoint;

    #[test]
    fn default_config_is_valid() {
        ModelConfig::default().validate().expect("defaults validate");
    }

    #[test]
    fn rejects_zero_capacity_with_contacts() {
        let mut config = ModelConfig::default();
        config.agent.max_contacts = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidConfig(
                "agent.max_contacts must be positive when contacts are enabled"
            ))
        );
        config.agent_interactions = AgentInteractions::None;
        config.validate().expect("capacity unused without contacts");
    }

    #[test]
    fn rejects_non_positive_attractor_radius() {
        let config = ModelConfig {
            attractors: vec![
                Attractor::new(GridPoint::new(1, 1), 3.0),
                Attractor::new(GridPoint::new(4, 4), 0.0),
            ],
            ..ModelConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::AttractorRadius {
                index: 1,
                radius: 0.0
            })
        );
    }

    #[test]
    fn rejects_empty_grid_and_bad_rates() {
        let empty = ModelConfig {
            grid_width: 0,
            ..ModelConfig::default()
        };
        assert!(empty.validate().is_err());
        let crowded = ModelConfig {
            occupation_rate: 1.5,
            ..ModelConfig::default()
        };
        assert!(crowded.validate().is_err());
        let stalled = ModelConfig {
            refresh_distant_contacts: 0,
            ..ModelConfig::default()
        };
        assert!(stalled.validate().is_err());
    }

    #[test]
    fn agent_population_floors_occupation() {
        let config = ModelConfig {
            grid_width: 3,
            grid_height: 3,
            occupation_rate: 0.5,
            ..ModelConfig::default()
        };
        assert_eq!(config.cell_count(), 9);
        assert_eq!(config.agent_count(), 4);
    }

    #[test]
    fn parses_screaming_case_enums() {
        let config: ModelConfig = serde_json::from_str(
            r#"{
                "environment": "SMALL_WORLD",
                "num_cells": 50,
                "utility": "STEP",
                "attractors": [[[2, 3], 1.5]],
                "cell_interactions": "READ_ALL_WRITE_ONE",
                "agent": {"move_policy": "MAX", "max_contacts": 3}
            }"#,
        )
        .expect("config parses");
        assert_eq!(config.environment, Environment::SmallWorld);
        assert_eq!(config.utility, UtilityKind::Step);
        assert_eq!(config.cell_interactions, CellInteraction::ReadAllWriteOne);
        assert_eq!(config.agent.move_policy, MovePolicy::Max);
        assert_eq!(config.agent.max_contacts, 3);
        assert_eq!(config.agent.range_size, 1);
        assert_eq!(config.attractors[0].center, GridPoint::new(2, 3));
    }
}
