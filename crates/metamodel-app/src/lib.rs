//! Shared application plumbing for the `metamodel` runner.

pub mod loader;
pub mod runner;

pub use loader::{ConfigFormat, LoadError, load_config, parse_config};
pub use runner::{RunOptions, RunReport, run};
