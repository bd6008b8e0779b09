//! Plugin Registry
//!
//! Maps a target `type` to the factory that builds the plugin instance for
//! it. The orchestrator creates at most one instance per type.

use std::collections::HashMap;
use std::sync::Arc;

use super::DeployPlugin;
use crate::context::DeployContext;

/// Builds a plugin instance bound to a deploy context
pub type PluginFactory = Arc<dyn Fn(Arc<DeployContext>) -> Arc<dyn DeployPlugin> + Send + Sync>;

/// Registry of available plugin types
#[derive(Clone, Default)]
pub struct PluginRegistry {
    factories: HashMap<String, PluginFactory>,
}

impl PluginRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for a plugin type, replacing any previous one
    pub fn register<F>(&mut self, plugin_type: impl Into<String>, factory: F)
    where
        F: Fn(Arc<DeployContext>) -> Arc<dyn DeployPlugin> + Send + Sync + 'static,
    {
        self.factories.insert(plugin_type.into(), Arc::new(factory));
    }

    /// Builder form of [`PluginRegistry::register`]
    pub fn with<F>(mut self, plugin_type: impl Into<String>, factory: F) -> Self
    where
        F: Fn(Arc<DeployContext>) -> Arc<dyn DeployPlugin> + Send + Sync + 'static,
    {
        self.register(plugin_type, factory);
        self
    }

    /// Build a new instance of `plugin_type`
    pub fn create(&self, plugin_type: &str, context: Arc<DeployContext>) -> Option<Arc<dyn DeployPlugin>> {
        self.factories.get(plugin_type).map(|factory| factory(context))
    }

    pub fn contains(&self, plugin_type: &str) -> bool {
        self.factories.contains_key(plugin_type)
    }

    /// Registered type names, sorted
    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("types", &self.types())
            .finish()
    }
}
