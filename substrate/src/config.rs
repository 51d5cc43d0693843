//! Typed configuration for the substrate, matching the configuration
//! surface semantics (env/CLI binding is out of scope; see crate docs).
//!
//! Layering: [`Config::load`] first calls [`env_config::load_and_apply`] so
//! that `.env`/XDG `config.toml` `[env]` entries land in the process
//! environment (existing env wins), then reads the TOML document named by
//! `SUBSTRATE_CONFIG` (or the given path) for the structured settings below.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Store backend selection. `Redis` is declared but never implemented;
/// constructors that consult it must fail with `SubstrateError::InvalidInput`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Sqlite,
    Redis,
}

impl Default for StoreBackend {
    fn default() -> Self {
        StoreBackend::Memory
    }
}

/// Reference-store GC sweep strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GcStrategy {
    RefCounting,
    Ttl,
    Manual,
}

impl Default for GcStrategy {
    fn default() -> Self {
        GcStrategy::RefCounting
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    pub interval_seconds: u64,
    pub strategy: GcStrategy,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 300,
            strategy: GcStrategy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoPromoteConfig {
    pub enabled: bool,
    pub threshold_bytes: u64,
}

impl Default for AutoPromoteConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_bytes: 10 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoliciesConfig {
    pub always_reference: Vec<String>,
    pub always_value: Vec<String>,
}

impl Default for PoliciesConfig {
    fn default() -> Self {
        Self {
            always_reference: Vec::new(),
            always_value: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub restart_topic: String,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            restart_topic: "workflow.restart".to_string(),
        }
    }
}

/// Top-level substrate configuration, matching the configuration surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub gc: GcConfig,
    pub auto_promote: AutoPromoteConfig,
    pub policies: PoliciesConfig,
    pub workflow: WorkflowConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("parse config toml: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("env/xdg loading: {0}")]
    Env(#[from] env_config::LoadError),
}

impl Config {
    /// Loads `.env`/XDG env overrides for `app_name`, then reads the TOML
    /// document at `path` if it exists. Missing `path` yields `Config::default()`.
    pub fn load(app_name: &str, path: Option<&Path>) -> Result<Self, ConfigError> {
        env_config::load_and_apply(app_name, None)?;

        let Some(path) = path else {
            return Ok(Config::default());
        };
        if !path.exists() {
            return Ok(Config::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let cfg: Config = toml::from_str(&content)?;
        Ok(cfg)
    }
}
