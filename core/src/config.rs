//! Configuration
//!
//! Sources are layered: built-in defaults, then an optional TOML file, then
//! `EAGER__*` environment variables (for example
//! `EAGER__REGISTRY__SWEEP_THRESHOLD=4096`). A `.env` file in the working
//! directory is loaded before the environment is read.

use anyhow::{Context, Result};
use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Environment variable naming a config file
pub const CONFIG_PATH_VAR: &str = "EAGER_CONFIG_PATH";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub registry: RegistryConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Entry count past which records of dropped values are swept
    pub sweep_threshold: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            sweep_threshold: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive, used when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "warn".to_string(),
        }
    }
}

impl Config {
    /// Load configuration, reading the file named by `EAGER_CONFIG_PATH` if set
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_VAR).ok();
        Self::load_from(path.as_deref())
    }

    /// Load configuration from an explicit file (which must exist) plus the environment
    pub fn load_from(path: Option<&str>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::new(path, FileFormat::Toml).required(true));
        }
        let settings = builder
            .add_source(
                Environment::with_prefix("EAGER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration sources")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Config = toml::from_str(source).context("Failed to parse TOML configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.registry.sweep_threshold == 0 {
            return Err(EngineError::Config(
                "registry.sweep_threshold must be greater than zero".to_string(),
            ));
        }
        if self.log.filter.trim().is_empty() {
            return Err(EngineError::Config("log.filter must not be empty".to_string()));
        }
        Ok(())
    }
}
