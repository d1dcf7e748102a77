//! Board configuration loaded from TOML with environment overrides.

use std::{path::Path, time::Duration};

use db::models::task::TaskOrder;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

const TASKS_TABLE_ENV: &str = "TASKBOARD_TASKS_TABLE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrioritizationConfig {
    pub enabled: bool,
    pub model: String,
    /// Environment variable the API key is read from.
    pub api_key_env: String,
    /// Larger boards are ordered locally without asking the model.
    pub max_tasks: usize,
}

impl Default for PrioritizationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: "claude-sonnet-4-20250514".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            max_tasks: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
    pub tasks_table: String,
    pub default_order: TaskOrder,
    pub write_timeout_ms: Option<u64>,
    pub prioritization: PrioritizationConfig,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            tasks_table: "tasks".to_string(),
            default_order: TaskOrder::default(),
            write_timeout_ms: None,
            prioritization: PrioritizationConfig::default(),
        }
    }
}

impl BoardConfig {
    /// Load from `path` if given and present, otherwise start from defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) if path.exists() => {
                info!(path = %path.display(), "Loading board config");
                Self::from_toml(&std::fs::read_to_string(path)?)?
            }
            Some(path) => {
                debug!(path = %path.display(), "Config file not found, using defaults");
                Self::default()
            }
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    fn apply_env(&mut self) {
        if let Ok(table) = std::env::var(TASKS_TABLE_ENV) {
            if !table.trim().is_empty() {
                self.tasks_table = table.trim().to_string();
            }
        }
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout_ms.map(Duration::from_millis)
    }
}
