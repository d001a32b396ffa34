//! Initialization for applications embedding the engine
//!
//! Optional: stores created before (or without) initialization use default
//! configuration. Calling [`initialize`] loads configuration once per process
//! and can install a `tracing` subscriber.
//!
//! # Example
//!
//! ```rust,no_run
//! use eager_core::init::InitBuilder;
//!
//! InitBuilder::new()
//!     .log_filter("eager_core=debug")
//!     .install_logging(true)
//!     .init()?;
//! # Ok::<(), anyhow::Error>(())
//! ```

use anyhow::{anyhow, Context, Result};
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, LogConfig};

/// Global initialization state
static INIT_STATE: OnceLock<InitState> = OnceLock::new();

#[derive(Debug)]
struct InitState {
    config: Config,
}

/// Options for initializing the engine
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// Config file path (overrides `EAGER_CONFIG_PATH`)
    pub config_path: Option<String>,

    /// Log filter (overrides config file and env vars, not `RUST_LOG`)
    pub log_filter: Option<String>,

    /// Registry sweep threshold (overrides config file and env vars)
    pub sweep_threshold: Option<usize>,

    /// Whether to install a `tracing_subscriber` fmt subscriber
    pub install_logging: bool,
}

/// Builder for constructing InitOptions
#[derive(Debug, Default)]
pub struct InitBuilder {
    options: InitOptions,
}

impl InitBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config_path(mut self, path: impl Into<String>) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn log_filter(mut self, filter: impl Into<String>) -> Self {
        self.options.log_filter = Some(filter.into());
        self
    }

    pub fn sweep_threshold(mut self, threshold: usize) -> Self {
        self.options.sweep_threshold = Some(threshold);
        self
    }

    pub fn install_logging(mut self, install: bool) -> Self {
        self.options.install_logging = install;
        self
    }

    pub fn init(self) -> Result<()> {
        initialize(self.options)
    }
}

/// Initialize the engine with the given options.
///
/// Calling this function multiple times is safe - subsequent calls are no-ops.
pub fn initialize(options: InitOptions) -> Result<()> {
    if INIT_STATE.get().is_some() {
        return Ok(());
    }

    let mut config = match &options.config_path {
        Some(path) => Config::load_from(Some(path)),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;

    if let Some(filter) = options.log_filter {
        config.log.filter = filter;
    }
    if let Some(threshold) = options.sweep_threshold {
        config.registry.sweep_threshold = threshold;
    }
    config.validate().context("Invalid configuration overrides")?;

    if options.install_logging {
        install_logging(&config.log);
    }

    INIT_STATE
        .set(InitState { config })
        .map_err(|_| anyhow!("Initialization already completed"))?;

    tracing::debug!("Engine initialized");
    Ok(())
}

/// Install a stderr fmt subscriber. `RUST_LOG` wins over the configured filter.
/// Does nothing if a global subscriber is already set.
pub fn install_logging(log: &LogConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub fn is_initialized() -> bool {
    INIT_STATE.get().is_some()
}

/// The configuration loaded by [`initialize`], if it ran
pub fn get_config() -> Option<&'static Config> {
    INIT_STATE.get().map(|state| &state.config)
}
