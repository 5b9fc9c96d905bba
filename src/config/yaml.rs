//! YAML configuration parsing.
//!
//! Parses workflow definitions and the engine configuration file.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::error::ConfigError;

/// Engine configuration (`dagflow.yaml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root directory for checkpoints and logs.
    pub state_dir: PathBuf,
    /// Event stream file. Defaults to `<state_dir>/events.log`.
    pub event_log: Option<PathBuf>,
    /// Maximum concurrently running tasks.
    pub max_parallel: usize,
    /// Timeout for tasks that do not set one, in seconds.
    pub default_timeout_secs: u64,
    /// Prefix for generated workflow ids.
    pub id_prefix: String,
    /// How often a running workflow checks for a cancellation request.
    pub cancel_poll_ms: u64,
    /// Checkpoint storage backend.
    pub storage: StorageConfig,
    /// Environment variables applied to every task.
    pub environment: HashMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".dagflow"),
            event_log: None,
            max_parallel: 4,
            default_timeout_secs: 300,
            id_prefix: "wf".to_string(),
            cancel_poll_ms: 250,
            storage: StorageConfig::default(),
            environment: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// Resolved path of the event stream file.
    pub fn event_log_path(&self) -> PathBuf {
        self.event_log
            .clone()
            .unwrap_or_else(|| self.state_dir.join("events.log"))
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn cancel_poll_interval(&self) -> Duration {
        Duration::from_millis(self.cancel_poll_ms)
    }

    /// Check values that would make the engine unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallel == 0 {
            return Err(ConfigError::Invalid(
                "max_parallel cannot be zero".into(),
            ));
        }
        if self.default_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "default_timeout_secs must be positive".into(),
            ));
        }
        if self.cancel_poll_ms == 0 {
            return Err(ConfigError::Invalid(
                "cancel_poll_ms must be positive".into(),
            ));
        }
        if self.id_prefix.is_empty() {
            return Err(ConfigError::MissingField("id_prefix".into()));
        }
        Ok(())
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    /// In-memory storage (non-persistent).
    #[serde(rename = "memory")]
    Memory,
    /// JSON files under the state directory.
    #[serde(rename = "file")]
    #[default]
    File,
    /// SQLite storage.
    #[serde(rename = "sqlite")]
    Sqlite {
        /// Path to the database file.
        path: String,
    },
}

/// Workflow definition from YAML.
///
/// Unknown keys are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Human-readable name.
    #[serde(default)]
    pub name: String,
    /// Free-form definition version.
    #[serde(default, deserialize_with = "scalar_string")]
    pub version: Option<String>,
    /// Environment shared by every task.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Defaults for tasks that omit a field.
    #[serde(default)]
    pub defaults: DefaultsConfig,
    /// Per-workflow concurrency limit.
    pub max_parallel: Option<usize>,
    /// Task definitions.
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

/// Workflow-level task defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    /// Timeout in seconds.
    pub timeout: Option<u64>,
    pub retries: Option<u32>,
    pub session: Option<String>,
}

/// Task configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Task identifier (unique within the workflow).
    pub id: String,
    /// Command handed to the session.
    #[serde(default)]
    pub command: String,
    /// Hard dependencies. A single id is accepted in place of a list.
    #[serde(default, deserialize_with = "one_or_many")]
    pub depends_on: Vec<String>,
    /// Target session; `local` when omitted.
    pub session: Option<String>,
    /// Timeout in seconds.
    pub timeout: Option<u64>,
    pub retries: Option<u32>,
    /// Delay between retries in seconds.
    pub retry_delay: Option<u64>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub on_success: Option<String>,
    pub on_failure: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(id)) => vec![id],
        Some(OneOrMany::Many(ids)) => ids,
    })
}

/// Accepts `version: 2`, `version: 1.5` and `version: "v3"` alike.
fn scalar_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_yaml::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_yaml::Value::Null) => None,
        Some(serde_yaml::Value::String(s)) => Some(s),
        Some(serde_yaml::Value::Number(n)) => Some(n.to_string()),
        Some(serde_yaml::Value::Bool(b)) => Some(b.to_string()),
        Some(_) => {
            return Err(serde::de::Error::custom(
                "version must be a string or number",
            ));
        }
    })
}

/// YAML configuration loader.
pub struct YamlLoader;

impl YamlLoader {
    /// Load engine configuration from a file.
    pub fn load_engine_config(path: impl AsRef<Path>) -> Result<EngineConfig, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| {
            ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }
        })?;
        let config: EngineConfig =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::ParseFile {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Parse engine configuration from a YAML string.
    pub fn parse_engine_config(yaml: &str) -> Result<EngineConfig, ConfigError> {
        let config: EngineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a workflow definition from a file.
    pub fn load_workflow_config(path: impl AsRef<Path>) -> Result<WorkflowConfig, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| {
            ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }
        })?;
        let config: WorkflowConfig =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::ParseFile {
                path: path.to_path_buf(),
                source,
            })?;
        Self::validate_workflow_config(&config)?;
        Ok(config)
    }

    /// Parse a workflow definition from a YAML string.
    pub fn parse_workflow_config(yaml: &str) -> Result<WorkflowConfig, ConfigError> {
        let config: WorkflowConfig = serde_yaml::from_str(yaml)?;
        Self::validate_workflow_config(&config)?;
        Ok(config)
    }

    /// Validate the shape of a definition.
    ///
    /// References and cycles are left to the graph so that they surface as
    /// graph errors naming the offending tasks.
    fn validate_workflow_config(config: &WorkflowConfig) -> Result<(), ConfigError> {
        if config.name.trim().is_empty() {
            return Err(ConfigError::MissingField("name".into()));
        }

        if config.tasks.is_empty() {
            return Err(ConfigError::Invalid(
                "workflow must have at least one task".into(),
            ));
        }

        if config.max_parallel == Some(0) {
            return Err(ConfigError::Invalid(
                "max_parallel cannot be zero".into(),
            ));
        }

        if config.defaults.timeout == Some(0) {
            return Err(ConfigError::Invalid(
                "defaults.timeout must be positive".into(),
            ));
        }

        let mut task_ids = HashSet::new();
        for task in &config.tasks {
            if task.id.trim().is_empty() {
                return Err(ConfigError::MissingField("tasks[].id".into()));
            }
            if !task_ids.insert(task.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate task id: {}",
                    task.id
                )));
            }
            if task.command.trim().is_empty() {
                return Err(ConfigError::MissingField(format!(
                    "tasks[{}].command",
                    task.id
                )));
            }
            if task.timeout == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "task '{}' timeout must be positive",
                    task.id
                )));
            }
        }

        Ok(())
    }
}
