//! Model configuration files.

use metamodel_core::ModelConfig;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while reading a configuration file.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("unsupported configuration format for {0} (expected .yaml, .yml or .json)")]
    UnsupportedFormat(PathBuf),
    #[error("invalid YAML configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid JSON configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serialization formats accepted for configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Json,
}

impl ConfigFormat {
    /// Picks the format from the file extension.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        let extension = path.extension()?.to_str()?.to_ascii_lowercase();
        match extension.as_str() {
            "yaml" | "yml" => Some(Self::Yaml),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Parses a configuration document. Missing fields take their defaults.
pub fn parse_config(text: &str, format: ConfigFormat) -> Result<ModelConfig, LoadError> {
    let config = match format {
        ConfigFormat::Yaml => serde_yaml::from_str(text)?,
        ConfigFormat::Json => serde_json::from_str(text)?,
    };
    Ok(config)
}

/// Reads and parses the configuration file at `path`.
pub fn load_config(path: &Path) -> Result<ModelConfig, LoadError> {
    let format =
        ConfigFormat::from_path(path).ok_or_else(|| LoadError::UnsupportedFormat(path.into()))?;
    let text = fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.into(),
        source,
    })?;
    parse_config(&text, format)
}

#[cfg(test)]
mod tests {
    use super::*;
    use metamodel_core::{
        AgentInteractions, Attractor, CellInteraction, Environment, GridPoint, MovePolicy,
        UtilityKind,
    };

    #[test]
    fn yaml_documents_override_defaults() {
        let config = parse_config(
            "
environment: SMALL_WORLD
num_cells: 400
output_degree: 6
p: 0.05
partitions: 3
utility: STEP
attractors:
  - [[10, 20], 4.0]
agent_interactions: CONTACTS
cell_interactions: READ_ALL_WRITE_ONE
agent:
  move_policy: MAX
  max_contacts: 5
rng_seed: 9
",
            ConfigFormat::Yaml,
        )
        .expect("yaml config");
        assert_eq!(config.environment, Environment::SmallWorld);
        assert_eq!(config.num_cells, 400);
        assert_eq!(config.partitions, 3);
        assert_eq!(config.utility, UtilityKind::Step);
        assert_eq!(
            config.attractors,
            vec![Attractor::new(GridPoint::new(10, 20), 4.0)]
        );
        assert_eq!(config.agent_interactions, AgentInteractions::Contacts);
        assert_eq!(config.cell_interactions, CellInteraction::ReadAllWriteOne);
        assert_eq!(config.agent.move_policy, MovePolicy::Max);
        assert_eq!(config.agent.max_contacts, 5);
        assert_eq!(config.agent.range_size, 1);
        assert_eq!(config.rng_seed, Some(9));
        assert_eq!(config.grid_width, ModelConfig::default().grid_width);
    }

    #[test]
    fn json_documents_parse() {
        let config = parse_config(
            r#"{"grid_width": 8, "grid_height": 6, "agent": {"range_size": 2}}"#,
            ConfigFormat::Json,
        )
        .expect("json config");
        assert_eq!((config.grid_width, config.grid_height), (8, 6));
        assert_eq!(config.agent.range_size, 2);
    }

    #[test]
    fn unknown_enum_values_are_rejected() {
        let err = parse_config("environment: TORUS", ConfigFormat::Yaml).expect_err("bad enum");
        assert!(matches!(err, LoadError::Yaml(_)));
    }

    #[test]
    fn formats_follow_extensions() {
        assert_eq!(
            ConfigFormat::from_path(Path::new("run.YML")),
            Some(ConfigFormat::Yaml)
        );
        assert_eq!(
            ConfigFormat::from_path(Path::new("run.json")),
            Some(ConfigFormat::Json)
        );
        assert_eq!(ConfigFormat::from_path(Path::new("run.toml")), None);
        let err = load_config(Path::new("run.toml")).expect_err("unsupported");
        assert!(matches!(err, LoadError::UnsupportedFormat(_)));
    }

    #[test]
    fn files_are_read_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("model.yaml");
        fs::write(&path, "grid_width: 3\ngrid_height: 3\n").expect("write");
        let config = load_config(&path).expect("load");
        assert_eq!(config.cell_count(), 9);
        let missing = load_config(&dir.path().join("missing.yaml")).expect_err("missing");
        assert!(matches!(missing, LoadError::Io { .. }));
    }
}
