//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

use crate::core::graph::GraphError;

/// Errors raised while loading a workflow definition or the engine config.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("YAML parse error in '{path}': {source}")]
    ParseFile {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// A value is present but not acceptable.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required field: {0}")]
    MissingField(String),

    /// Duplicate task ids and other errors found while building the graph.
    #[error(transparent)]
    Graph(#[from] GraphError),
}
