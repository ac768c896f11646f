//! Configuration resolution for Drover.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/drover/settings.json)
//! 3. Project config (.drover/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)
//!
//! Files are merged as JSON trees, so a file only overrides the keys it sets.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Hard bounds on pool concurrency.
pub const MIN_CONCURRENT: usize = 1;
pub const MAX_CONCURRENT: usize = 20;

/// Complete Drover configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub pool: PoolConfig,
    pub spawner: SpawnerConfig,
    pub interventions: InterventionConfig,
    pub log: LogConfig,
}

/// Admission order for queued spawn requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStrategy {
    #[default]
    Fifo,
    Priority,
}

impl fmt::Display for QueueStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fifo => "fifo",
            Self::Priority => "priority",
        })
    }
}

impl FromStr for QueueStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fifo" => Ok(Self::Fifo),
            "priority" => Ok(Self::Priority),
            other => Err(Error::Config(format!("Unknown queue strategy: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_concurrent: usize,
    pub queue_strategy: QueueStrategy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            queue_strategy: QueueStrategy::Fifo,
        }
    }
}

/// Agent subprocess configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnerConfig {
    /// Agent executable, resolved through `PATH` when not absolute.
    pub agent_bin: String,
    /// Output records retained per process for late subscribers.
    pub replay_capacity: usize,
    /// Queued stdin writes per process.
    pub stdin_buffer: usize,
    /// Extra environment for every agent, applied after the color overrides.
    pub env: HashMap<String, String>,
    /// Grace period after SIGTERM before the agent is killed outright.
    pub terminate_timeout_secs: u64,
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        Self {
            agent_bin: "claude".to_string(),
            replay_capacity: 100,
            stdin_buffer: 64,
            env: HashMap::new(),
            terminate_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterventionConfig {
    /// Pending requests older than this are marked as timed out.
    pub timeout_secs: u64,
}

impl Default for InterventionConfig {
    fn default() -> Self {
        Self { timeout_secs: 300 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Reject values the pool and spawner cannot work with.
    pub fn validate(&self) -> Result<()> {
        let n = self.pool.max_concurrent;
        if !(MIN_CONCURRENT..=MAX_CONCURRENT).contains(&n) {
            return Err(Error::Config(format!(
                "pool.max_concurrent must be between {MIN_CONCURRENT} and {MAX_CONCURRENT}, got {n}"
            )));
        }
        if self.spawner.replay_capacity == 0 {
            return Err(Error::Config(
                "spawner.replay_capacity must be at least 1".to_string(),
            ));
        }
        if self.spawner.agent_bin.trim().is_empty() {
            return Err(Error::Config("spawner.agent_bin must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let global = global_config_path();
    let project = project_dir.map(project_config_path);
    load_config_from(global.as_deref(), project.as_deref(), |key| {
        std::env::var(key).ok()
    })
}

/// Resolve configuration from explicit file paths and an environment lookup.
///
/// Missing files are skipped; unreadable or malformed ones are errors.
pub fn load_config_from<F>(global: Option<&Path>, project: Option<&Path>, env: F) -> Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let mut tree = serde_json::to_value(Config::default())?;

    for path in [global, project].into_iter().flatten() {
        if path.exists() {
            debug!(path = %path.display(), "Loading config file");
            merge_config(&mut tree, load_config_file(path)?);
        }
    }

    let mut config: Config = serde_json::from_value(tree)
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))?;
    apply_env_overrides(&mut config, env)?;
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("drover").join("settings.json"))
}

pub fn project_config_path(project_dir: &Path) -> PathBuf {
    project_dir.join(".drover").join("settings.json")
}

fn load_config_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).inspect_err(|e| {
        warn!(path = %path.display(), error = %e, "Failed to read config file");
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Deep-merge `overlay` into `base`. Objects merge per key; anything else replaces.
fn merge_config(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge_config(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn apply_env_overrides<F>(config: &mut Config, env: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(val) = env("DROVER_MAX_CONCURRENT") {
        config.pool.max_concurrent = val.trim().parse().map_err(|_| {
            Error::Config(format!("DROVER_MAX_CONCURRENT is not a number: {val}"))
        })?;
    }
    if let Some(val) = env("DROVER_QUEUE_STRATEGY") {
        config.pool.queue_strategy = val.parse()?;
    }
    if let Some(val) = env("DROVER_AGENT_BIN") {
        config.spawner.agent_bin = val;
    }
    if let Some(val) = env("DROVER_LOG_LEVEL") {
        config.log.level = val;
    }
    Ok(())
}
