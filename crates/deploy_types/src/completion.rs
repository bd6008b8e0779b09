//! Completion Records
//!
//! Exactly one completion is delivered per deploy operation. A completion is
//! either a success, a failure (`error` set) or a cancellation (`canceled`
//! set, no error).

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DeployError;
use crate::target::TargetDescriptor;

// ─────────────────────────────────────────────────────────────────────────────
// Plugin Info
// ─────────────────────────────────────────────────────────────────────────────

/// Static self-description of a plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Plugin type this plugin is registered under
    #[serde(rename = "type")]
    pub plugin_type: String,

    /// Human-readable description
    pub description: String,
}

impl PluginInfo {
    pub fn new(plugin_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            plugin_type: plugin_type.into(),
            description: description.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// File Completion
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of deploying one file to one target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileCompletion {
    pub file: PathBuf,
    pub target: String,
    pub canceled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<DeployError>,
}

impl FileCompletion {
    pub fn succeeded(file: &Path, target: &TargetDescriptor) -> Self {
        Self {
            file: file.to_path_buf(),
            target: target.name.clone(),
            canceled: false,
            error: None,
        }
    }

    pub fn canceled(file: &Path, target: &TargetDescriptor) -> Self {
        Self {
            canceled: true,
            ..Self::succeeded(file, target)
        }
    }

    pub fn failed(file: &Path, target: &TargetDescriptor, error: DeployError) -> Self {
        Self {
            error: Some(error),
            ..Self::succeeded(file, target)
        }
    }

    /// Set the canceled flag
    pub fn with_canceled(mut self, canceled: bool) -> Self {
        self.canceled = canceled;
        self
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && !self.canceled
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Workspace Completion
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of deploying a set of files to one target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceCompletion {
    pub target: String,
    pub canceled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<DeployError>,
    /// Per-file outcomes, empty when a plugin deployed the set as a whole
    #[serde(default)]
    pub files: Vec<FileCompletion>,
}

impl WorkspaceCompletion {
    pub fn succeeded(target: &TargetDescriptor) -> Self {
        Self {
            target: target.name.clone(),
            canceled: false,
            error: None,
            files: Vec::new(),
        }
    }

    pub fn canceled(target: &TargetDescriptor) -> Self {
        Self {
            canceled: true,
            ..Self::succeeded(target)
        }
    }

    pub fn failed(target: &TargetDescriptor, error: DeployError) -> Self {
        Self {
            error: Some(error),
            ..Self::succeeded(target)
        }
    }

    /// Set the canceled flag
    pub fn with_canceled(mut self, canceled: bool) -> Self {
        self.canceled = canceled;
        self
    }

    /// Aggregate per-file outcomes into one workspace completion
    ///
    /// Any failed file makes the whole completion fail; any canceled file
    /// marks it canceled.
    pub fn from_files(target: &TargetDescriptor, files: Vec<FileCompletion>) -> Self {
        let failed = files.iter().filter(|f| f.error.is_some()).count();
        let canceled = files.iter().any(|f| f.canceled);

        let error = match failed {
            0 => None,
            1 => files.iter().find_map(|f| f.error.clone()),
            _ => Some(DeployError::FilesFailed {
                target: target.name.clone(),
                failed,
                total: files.len(),
            }),
        };

        Self {
            target: target.name.clone(),
            canceled,
            error,
            files,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && !self.canceled
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Deploy Report
// ─────────────────────────────────────────────────────────────────────────────

/// Per-target section of a [`DeployReport`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetReport {
    pub target: String,
    pub plugin_type: String,
    pub canceled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<DeployError>,
    #[serde(default)]
    pub files: Vec<FileCompletion>,
}

impl TargetReport {
    pub fn from_file(plugin_type: &str, completion: FileCompletion) -> Self {
        Self {
            target: completion.target.clone(),
            plugin_type: plugin_type.to_string(),
            canceled: completion.canceled,
            error: completion.error.clone(),
            files: vec![completion],
        }
    }

    pub fn from_workspace(plugin_type: &str, completion: WorkspaceCompletion) -> Self {
        Self {
            target: completion.target,
            plugin_type: plugin_type.to_string(),
            canceled: completion.canceled,
            error: completion.error,
            files: completion.files,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && !self.canceled
    }
}

/// Caller-visible result of one orchestrated deploy across targets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployReport {
    pub operation: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub targets: Vec<TargetReport>,
}

impl DeployReport {
    /// True when every target succeeded
    pub fn is_success(&self) -> bool {
        self.targets.iter().all(TargetReport::is_success)
    }

    /// True when any target was canceled
    pub fn was_canceled(&self) -> bool {
        self.targets.iter().any(|t| t.canceled)
    }

    /// Targets that reported an error
    pub fn failures(&self) -> impl Iterator<Item = &TargetReport> {
        self.targets.iter().filter(|t| t.error.is_some())
    }

    /// Look up the section for one target
    pub fn target(&self, name: &str) -> Option<&TargetReport> {
        self.targets.iter().find(|t| t.target == name)
    }
}
