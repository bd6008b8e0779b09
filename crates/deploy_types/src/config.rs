//! Deploy Configuration
//!
//! The `deploy.toml` file: workspace settings and the list of targets.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::target::TargetDescriptor;

/// Default configuration file name
pub const CONFIG_FILE: &str = "deploy.toml";

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Deploy configuration (deploy.toml)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Workspace root; relative paths are resolved against the config file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_root: Option<PathBuf>,

    /// Extra search roots for script `require()` calls
    #[serde(default)]
    pub module_paths: Vec<PathBuf>,

    /// Configured deploy targets
    #[serde(default)]
    pub targets: Vec<TargetDescriptor>,
}

impl DeployConfig {
    /// Load and validate a configuration file
    ///
    /// A relative `workspace_root` (or none at all) is anchored at the
    /// directory containing the file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = tokio::fs::read_to_string(path).await?;
        let mut config = Self::from_toml_str(&content)?;

        let config_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let root = match config.workspace_root.take() {
            Some(root) if root.is_absolute() => root,
            Some(root) => config_dir.join(root),
            None => config_dir,
        };
        config.workspace_root = Some(root);

        Ok(config)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: DeployConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check target invariants
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();

        for target in &self.targets {
            if target.name.trim().is_empty() {
                return Err(ConfigError::Invalid("target without a name".to_string()));
            }
            if target.plugin_type.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "target '{}' has no type",
                    target.name
                )));
            }
            if !seen.insert(target.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate target name '{}'",
                    target.name
                )));
            }
        }

        Ok(())
    }

    /// Workspace root, defaulting to the current directory
    pub fn root(&self) -> PathBuf {
        self.workspace_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Find a target by exact name
    pub fn target(&self, name: &str) -> Option<&TargetDescriptor> {
        self.targets.iter().find(|t| t.name == name)
    }
}
