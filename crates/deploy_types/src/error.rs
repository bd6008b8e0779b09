//! Deploy Errors
//!
//! Every failure a deploy operation can report. Errors travel inside
//! completion records, so they are plain data: cloneable and serializable.

use serde::{Deserialize, Serialize};

/// Errors reported through deploy completions
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum DeployError {
    // Configuration errors: the operation never starts
    #[error("No deploy targets configured")]
    NoTargets,

    #[error("Unknown deploy target: {0}")]
    UnknownTarget(String),

    #[error("Target '{target}' uses unknown plugin type '{plugin_type}'")]
    UnknownPluginType { target: String, plugin_type: String },

    #[error("Script not found: {script}")]
    ScriptNotFound { script: String },

    #[error("Failed to load script '{script}': {message}")]
    ScriptLoad { script: String, message: String },

    // Contract violation
    #[error("Script '{script}' does not export a '{export}' function")]
    MissingExport { script: String, export: String },

    // Execution errors
    #[error("{message}")]
    Script { name: String, message: String },

    #[error("Script '{script}' did not settle its result")]
    Unsettled { script: String },

    #[error("IO error: {0}")]
    Io(String),

    #[error("Plugin error: {0}")]
    Plugin(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Plugin panicked: {0}")]
    Panicked(String),

    // Unspecified rejections
    #[error("Could not deploy file '{file}' via script '{script}'")]
    DeployFileFailed { file: String, script: String },

    #[error("Could not deploy workspace via script '{script}'")]
    DeployWorkspaceFailed { script: String },

    // Aggregation
    #[error("{failed} of {total} file(s) failed to deploy to '{target}'")]
    FilesFailed {
        target: String,
        failed: usize,
        total: usize,
    },
}

/// Result type for deploy operations
pub type DeployResult<T> = Result<T, DeployError>;

impl From<std::io::Error> for DeployError {
    fn from(err: std::io::Error) -> Self {
        DeployError::Io(err.to_string())
    }
}
