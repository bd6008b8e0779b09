//! Target Descriptors
//!
//! A target is one configured deploy destination. Its `type` selects the
//! plugin that handles it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Script used by `script` targets that do not name one
pub const DEFAULT_SCRIPT: &str = "./deploy.js";

/// One configured deploy destination
///
/// Immutable once loaded; a configuration reload replaces the whole list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetDescriptor {
    /// Unique target name
    pub name: String,

    /// Plugin type handling this target (e.g. "script", "local")
    #[serde(rename = "type")]
    pub plugin_type: String,

    /// Optional human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Script module for `script` targets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,

    /// Free-form plugin options, passed through verbatim
    #[serde(default)]
    pub options: Map<String, Value>,
}

impl TargetDescriptor {
    /// Create a target with no options
    pub fn new(name: impl Into<String>, plugin_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            plugin_type: plugin_type.into(),
            description: None,
            script: None,
            options: Map::new(),
        }
    }

    /// Set the script module
    pub fn with_script(mut self, script: impl Into<String>) -> Self {
        self.script = Some(script.into());
        self
    }

    /// Set a single option
    pub fn with_option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    /// The configured script, falling back to [`DEFAULT_SCRIPT`]
    ///
    /// Blank values count as unset.
    pub fn script_or_default(&self) -> &str {
        match self.script.as_deref().map(str::trim) {
            Some(script) if !script.is_empty() => script,
            _ => DEFAULT_SCRIPT,
        }
    }

    /// Get an option as a string
    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(|v| v.as_str())
    }
}
