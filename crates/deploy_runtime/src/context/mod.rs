//! Deploy Context
//!
//! The capability object handed to every plugin: a global value store,
//! cross-plugin event emission and module loading. One context lives for a
//! whole session and is shared by reference.

mod globals;
mod modules;

pub use globals::GlobalStore;
pub use modules::{ModuleLoader, ModuleSource, normalize_path};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use deploy_types::DeployError;

use crate::events::EventBus;

/// Capabilities shared with every plugin invocation
pub struct DeployContext {
    workspace_root: PathBuf,
    globals: Arc<GlobalStore>,
    events: EventBus,
    modules: ModuleLoader,
}

impl DeployContext {
    /// Create a context for a workspace
    ///
    /// Module ids are resolved against the workspace root first, then
    /// against each of `module_paths` (relative ones are anchored at the
    /// workspace root).
    pub fn new(workspace_root: impl Into<PathBuf>, module_paths: &[PathBuf]) -> Self {
        let workspace_root = normalize_path(&workspace_root.into());

        let mut roots = vec![workspace_root.clone()];
        roots.extend(module_paths.iter().map(|p| {
            if p.is_absolute() {
                p.clone()
            } else {
                workspace_root.join(p)
            }
        }));

        Self {
            workspace_root,
            globals: Arc::new(GlobalStore::new()),
            events: EventBus::new(),
            modules: ModuleLoader::new(roots),
        }
    }

    /// Create a shared context
    pub fn new_shared(workspace_root: impl Into<PathBuf>, module_paths: &[PathBuf]) -> Arc<Self> {
        Arc::new(Self::new(workspace_root, module_paths))
    }

    /// Absolute workspace root
    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// The global value store; the same instance for the whole session
    pub fn globals(&self) -> &Arc<GlobalStore> {
        &self.globals
    }

    /// Notify every listener of `name`, returns whether any existed
    pub fn emit_global(&self, name: &str, args: Vec<serde_json::Value>) -> bool {
        self.events.emit(name, args)
    }

    /// The event bus, for subscribing
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The module loader
    pub fn modules(&self) -> &ModuleLoader {
        &self.modules
    }

    /// Load a module by id relative to the workspace
    pub fn require(&self, id: &str) -> Result<Arc<ModuleSource>, DeployError> {
        self.modules.require(id, None)
    }

    /// Load a module by id on behalf of a module living in `dir`
    pub fn require_from(&self, id: &str, dir: &Path) -> Result<Arc<ModuleSource>, DeployError> {
        self.modules.require(id, Some(dir))
    }

    /// End the session: drop every listener
    pub fn close(&self) {
        self.events.clear();
        tracing::debug!(root = %self.workspace_root.display(), "Deploy context closed");
    }
}

impl std::fmt::Debug for DeployContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeployContext")
            .field("workspace_root", &self.workspace_root)
            .field("globals", &self.globals.len())
            .finish()
    }
}
