use std::path::PathBuf;

use clap::Args;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_STATE_FILE: &str = "adoption-state.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid log filter {filter:?}: {message}")]
    LogFilter { filter: String, message: String },
    #[error("logging already initialised: {0}")]
    Logging(String),
}

/// Options shared by every subcommand.
#[derive(Debug, Clone, Args)]
pub struct Config {
    /// JSON file holding registry, pool, credits, balances and receipts.
    #[arg(long, global = true, env = "ADOPTION_STATE", default_value = DEFAULT_STATE_FILE)]
    pub state: PathBuf,

    /// Log filter (`info`, `pet_adoption=debug`, ...). RUST_LOG takes precedence.
    #[arg(long, global = true, env = "ADOPTION_LOG", default_value = "warn")]
    pub log_level: String,

    /// Print results as JSON.
    #[arg(long, global = true)]
    pub json: bool,
}

/// Installs the stderr `fmt` subscriber.
pub fn init_logging(config: &Config) -> Result<(), ConfigError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| ConfigError::LogFilter {
            filter: config.log_level.clone(),
            message: e.to_string(),
        })?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_ansi(false)
        .try_init()
        .map_err(|e| ConfigError::Logging(e.to_string()))
}
