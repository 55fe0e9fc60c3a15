//! Run orchestration: model build, tick loop, reports and persistence.

use anyhow::{Context, Result};
use metamodel_core::{Model, ModelConfig, ModelPersistence, NullPersistence, TickSummary};
use metamodel_storage::{StoragePipeline, report};
use std::fs;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Everything a run needs beyond the model configuration file.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub config: ModelConfig,
    /// Overrides `num_steps` when set.
    pub steps: Option<u64>,
    /// Directory receiving JSON and DOT reports.
    pub output_dir: PathBuf,
    /// DuckDB database receiving persistence batches.
    pub database: Option<PathBuf>,
}

/// Outcome of a completed run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub ticks: u64,
    pub agents: usize,
    pub last_summary: Option<TickSummary>,
    pub files: Vec<PathBuf>,
}

/// Builds the model described by `options` and runs it to completion.
pub fn run(options: RunOptions) -> Result<RunReport> {
    let RunOptions {
        mut config,
        steps,
        output_dir,
        database,
    } = options;
    let steps = steps.unwrap_or(config.num_steps);

    let persistence: Box<dyn ModelPersistence> = match &database {
        Some(path) => {
            if config.persistence_interval == 0 {
                warn!(
                    path = %path.display(),
                    "persistence_interval is 0 with a database configured; persisting every tick"
                );
                config.persistence_interval = 1;
            }
            let path_str = path
                .to_str()
                .with_context(|| format!("database path {} is not UTF-8", path.display()))?;
            Box::new(
                StoragePipeline::new(path_str)
                    .with_context(|| format!("failed to open database {}", path.display()))?,
            )
        }
        None => Box::new(NullPersistence),
    };

    let writes_reports = config.json_output || config.dot_output;
    if writes_reports {
        fs::create_dir_all(&output_dir).with_context(|| {
            format!("failed to create output directory {}", output_dir.display())
        })?;
    }

    let mut model = Model::with_persistence(config, persistence).context("failed to build model")?;
    let mut files = Vec::new();
    if model.config().json_output {
        files.extend(report::write_grid_reports(&model, &output_dir)?);
    }

    let started = Instant::now();
    let mut last_summary = None;
    for _ in 0..steps {
        let summary = model
            .step()
            .with_context(|| format!("tick {} failed", model.tick().0))?;
        if model.config().json_output && summary.tick.is_due(model.config().json_output_period) {
            files.extend(report::write_agents_reports(&model, &output_dir)?);
        }
        last_summary = Some(summary);
    }
    if model.config().dot_output {
        files.push(report::write_dot(&model, &output_dir)?);
    }

    if let Some(summary) = &last_summary {
        info!(
            ticks = steps,
            agents = summary.agent_count,
            contact_edges = summary.contact_edges,
            average_contacts = summary.average_contacts,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "run complete"
        );
    } else {
        warn!("run finished without executing any tick");
    }
    debug!(files = files.len(), "reports written");

    Ok(RunReport {
        ticks: model.tick().0,
        agents: model.substrate().agent_count(),
        last_summary,
        files,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use metamodel_core::{AgentParams, Environment};

    fn options(dir: &std::path::Path) -> RunOptions {
        RunOptions {
            config: ModelConfig {
                environment: Environment::Grid,
                grid_width: 8,
                grid_height: 8,
                partitions: 2,
                occupation_rate: 0.25,
                num_steps: 4,
                rng_seed: Some(3),
                json_output: true,
                json_output_period: 2,
                dot_output: true,
                agent: AgentParams {
                    max_contacts: 2,
                    ..AgentParams::default()
                },
                ..ModelConfig::default()
            },
            steps: None,
            output_dir: dir.join("out"),
            database: None,
        }
    }

    #[test]
    fn run_writes_periodic_reports() {
        let dir = tempfile::tempdir().expect("tempdir");
        let report = run(options(dir.path())).expect("run");
        assert_eq!(report.ticks, 4);
        assert_eq!(report.agents, 16);
        // grid + cells, two ranks at ticks 1 and 3, graph
        assert_eq!(report.files.len(), 2 + 2 * 2 + 1);
        assert!(report.files.iter().all(|path| path.exists()));
        assert!(dir.path().join("out/agents.1.3.json").exists());
        assert!(dir.path().join("out/graph.dot").exists());
    }

    #[test]
    fn steps_override_and_database_persist() {
        let dir = tempfile::tempdir().expect("tempdir");
        let database = dir.path().join("run.duckdb");
        let mut options = options(dir.path());
        options.steps = Some(2);
        options.config.json_output = false;
        options.config.dot_output = false;
        options.database = Some(database.clone());
        let report = run(options).expect("run");
        assert_eq!(report.ticks, 2);
        assert!(report.files.is_empty());
        assert_eq!(report.last_summary.expect("summary").tick.0, 1);
        assert!(database.exists());
    }

    #[test]
    fn invalid_configuration_fails_the_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut options = options(dir.path());
        options.config.partitions = 0;
        let err = run(options).expect_err("invalid config");
        assert!(format!("{err:#}").contains("partitions"));
    }
}
