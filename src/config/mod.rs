//! Configuration loading and parsing.
//!
//! YAML workflow definitions and the engine configuration file.

mod builder;
mod error;
mod yaml;

pub use builder::{WorkflowConfigBuilder, load_workflow, parse_workflow};
pub use error::ConfigError;
pub use yaml::{
    DefaultsConfig, EngineConfig, StorageConfig, TaskConfig, WorkflowConfig, YamlLoader,
};
