//! Configuration file management for colony.
//!
//! Provides a TOML-based config file at `~/.config/colony/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use colony_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OrchestratorSection {
    /// Maximum heartbeat age in seconds before a worker counts as offline.
    pub heartbeat_timeout_secs: u64,
    /// Interval in seconds between liveness sweeps.
    pub sweep_interval_secs: u64,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: 60,
            sweep_interval_secs: 15,
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the colony config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/colony` or `~/.config/colony`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("colony");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("colony")
}

/// Return the path to the colony config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct ColonyConfig {
    pub db_config: DbConfig,
    pub heartbeat_timeout: Duration,
    pub sweep_interval: Duration,
}

impl ColonyConfig {
    /// Resolve configuration using the chain:
    /// CLI flag > `COLONY_DATABASE_URL` > config file > default.
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let file = load_config().ok();

        let database_url = cli_db_url
            .map(str::to_owned)
            .or_else(|| std::env::var("COLONY_DATABASE_URL").ok())
            .or_else(|| file.as_ref().map(|f| f.database.url.clone()))
            .unwrap_or_else(DbConfig::default_url);

        let orchestrator = file.map(|f| f.orchestrator).unwrap_or_default();

        Ok(Self {
            db_config: DbConfig::new(database_url),
            heartbeat_timeout: Duration::from_secs(orchestrator.heartbeat_timeout_secs),
            sweep_interval: Duration::from_secs(orchestrator.sweep_interval_secs),
        })
    }
}
