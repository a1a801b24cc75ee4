use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::Display;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub channel: ChannelSection,

    #[serde(default)]
    pub interpreter: InterpreterSection,

    #[serde(default)]
    pub research: ResearchSection,

    #[serde(default)]
    pub checkpoint: CheckpointSection,

    #[serde(default)]
    pub detectors: DetectorsSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ChannelSection {
    /// Absent means calls wait for their reply indefinitely.
    pub call_timeout_ms: Option<u64>,
}

impl ChannelSection {
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InterpreterSection {
    pub default_step_budget: u32,
    pub turn_timeout_ms: u64,
    pub max_spawn_depth: u32,
}

impl Default for InterpreterSection {
    fn default() -> Self {
        Self {
            default_step_budget: 25,
            turn_timeout_ms: 300_000,
            max_spawn_depth: 6,
        }
    }
}

impl InterpreterSection {
    pub fn turn_timeout(&self) -> Duration {
        Duration::from_millis(self.turn_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResearchSection {
    pub agent_type: String,
    pub max_concurrency: usize,
    pub step_budget: u32,
    pub tools: Vec<String>,
}

impl Default for ResearchSection {
    fn default() -> Self {
        Self {
            agent_type: "researcher".to_string(),
            max_concurrency: 10,
            step_budget: 6,
            tools: marshal_tools::tools::READ_ONLY_TOOLS
                .iter()
                .map(|name| (*name).to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum WorkerKind {
    #[default]
    Thread,
    Process,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CheckpointSection {
    pub enabled: bool,
    pub request_timeout_ms: u64,
    pub worker: WorkerKind,
    pub worker_program: String,
    pub store_root: Option<PathBuf>,
    pub snapshot_tools: Vec<String>,
    pub snapshot_after: bool,
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            enabled: false,
            request_timeout_ms: 30_000,
            worker: WorkerKind::Thread,
            worker_program: "marshal-checkpoint-worker".to_string(),
            store_root: None,
            snapshot_tools: vec![
                marshal_tools::tools::WRITE_FILE_TOOL_NAME.to_string(),
                marshal_tools::tools::STR_REPLACE_TOOL_NAME.to_string(),
            ],
            snapshot_after: false,
        }
    }
}

impl CheckpointSection {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn resolved_store_root(&self) -> Result<PathBuf> {
        match &self.store_root {
            Some(root) => Ok(root.clone()),
            None => marshal_checkpoint::default_store_root().ok_or_else(|| {
                Error::Configuration("Could not determine data directory".to_string())
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct DetectorsSection {
    #[serde(default)]
    pub count_in_window: Vec<CountInWindowSection>,

    #[serde(default)]
    pub time_between: Vec<TimeBetweenSection>,
}

impl DetectorsSection {
    pub fn is_empty(&self) -> bool {
        self.count_in_window.is_empty() && self.time_between.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CountInWindowSection {
    pub name: String,
    pub kinds: Vec<String>,
    pub threshold: usize,
    pub window_ms: u64,
    #[serde(default)]
    pub debounce_ms: u64,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_history_limit() -> usize {
    64
}

impl CountInWindowSection {
    /// A history shorter than the threshold can never hold enough events to fire.
    pub fn validate(&self) -> Result<()> {
        if self.history_limit < self.threshold {
            return Err(Error::Configuration(format!(
                "count_in_window detector {:?}: history_limit ({}) is below threshold ({})",
                self.name, self.history_limit, self.threshold
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeBetweenSection {
    pub name: String,
    pub from: String,
    pub to: String,
    pub comparison: crate::detectors::Comparison,
    pub threshold_ms: u64,
}

impl RuntimeConfig {
    /// Get the path to the runtime configuration file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or_else(|| {
            Error::Configuration("Could not determine config directory".to_string())
        })?;
        Ok(config_dir.join("marshal").join("runtime.toml"))
    }

    /// Load the configuration from disk, or return defaults if not found
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(target: "marshal::config", ?path, "No runtime config, using defaults");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents).map_err(|e| match e {
            Error::Configuration(message) => {
                Error::Configuration(format!("{}: {message}", path.display()))
            }
            other => other,
        })
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| Error::Configuration(format!("Failed to parse runtime config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for detector in &self.detectors.count_in_window {
            detector.validate()?;
        }
        Ok(())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self).map_err(|e| {
            Error::Configuration(format!("Failed to serialize runtime config: {e}"))
        })?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}
