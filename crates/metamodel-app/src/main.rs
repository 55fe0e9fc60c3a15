use anyhow::{Context, Result};
use clap::Parser;
use metamodel_app::{RunOptions, load_config, run};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "metamodel",
    version,
    about = "Run a partitioned spatial contact-graph simulation"
)]
struct Cli {
    /// Model configuration file (.yaml, .yml or .json).
    config_file: PathBuf,
    /// RNG seed; overrides `rng_seed` from the configuration.
    #[arg(short, long, env = "METAMODEL_SEED")]
    seed: Option<u64>,
    /// Directory receiving JSON and DOT reports.
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,
    /// DuckDB database receiving tick summaries, metrics and agent snapshots.
    #[arg(long)]
    db: Option<PathBuf>,
    /// Number of ticks to run; overrides `num_steps`.
    #[arg(long)]
    steps: Option<u64>,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut config = load_config(&cli.config_file)
        .with_context(|| format!("failed to load {}", cli.config_file.display()))?;
    if let Some(seed) = cli.seed {
        config.rng_seed = Some(seed);
    }
    info!(
        config = %cli.config_file.display(),
        seed = ?config.rng_seed,
        "starting metamodel run"
    );
    let report = run(RunOptions {
        config,
        steps: cli.steps,
        output_dir: cli.output_dir,
        database: cli.db,
    })?;
    info!(ticks = report.ticks, agents = report.agents, "metamodel run finished");
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}
