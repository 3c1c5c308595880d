//! Task configuration
//!
//! Builders can be seeded from a TOML document:
//!
//! ```toml
//! name = "export"
//! event_logging = true
//!
//! [default_strategy]
//! type = "constant"
//! parts = 100
//! ```

use crate::task::{ReportStrategy, Result as TaskResult};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::debug;

/// Serializable subset of the report strategies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StrategyConfig {
    None,
    All,
    Constant { parts: u64 },
    Scale { factor: f64 },
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self::All
    }
}

impl StrategyConfig {
    /// Validate and convert into a usable strategy
    pub fn to_strategy(&self) -> TaskResult<ReportStrategy> {
        match self {
            StrategyConfig::None => Ok(ReportStrategy::none()),
            StrategyConfig::All => Ok(ReportStrategy::all()),
            StrategyConfig::Constant { parts } => ReportStrategy::constant(*parts),
            StrategyConfig::Scale { factor } => ReportStrategy::scale(*factor),
        }
    }
}

/// Construction-time settings for a task tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Name of the task tree, also its initial status text
    #[serde(default = "default_name")]
    pub name: String,

    /// Route lifecycle events to `tracing`
    #[serde(default)]
    pub event_logging: bool,

    /// Strategy for subtasks spawned without an explicit weight
    #[serde(default)]
    pub default_strategy: StrategyConfig,
}

fn default_name() -> String {
    "task".to_string()
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            event_logging: false,
            default_strategy: StrategyConfig::default(),
        }
    }
}

impl TaskConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: TaskConfig =
            toml::from_str(content).context("Failed to parse task configuration")?;
        config
            .default_strategy
            .to_strategy()
            .context("Invalid default strategy")?;
        Ok(config)
    }

    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading task configuration from {:?}", path);
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {:?}", path))?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize task configuration")
    }

    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, self.to_toml_string()?)
            .with_context(|| format!("Failed to write configuration file {:?}", path))?;
        Ok(())
    }
}
