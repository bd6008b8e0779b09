//! Plugin Contract
//!
//! Every deploy backend implements [`DeployPlugin`]. A plugin returns its
//! completion from the deploy methods; the functions in [`dispatch`] wrap
//! those calls in the plugin boundary, which catches panics, fires
//! `onCancelling` hooks and delivers the `on_completed` callback exactly once.
//!
//! # Lifecycle
//!
//! - `deploy_file`: deploy one file to one target
//! - `deploy_workspace`: deploy a set of files; defaults to one
//!   `deploy_file` per file ([`dispatch::deploy_each_file`])
//! - `on_config_reloaded`: reset all session state
//! - `on_cancelling`: react to cancellation without polling

pub mod dispatch;
mod registry;
mod state;

pub use registry::{PluginFactory, PluginRegistry};
pub use state::SessionState;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use deploy_types::{
    DeployConfig, FileCompletion, PluginInfo, TargetDescriptor, WorkspaceCompletion,
};

use crate::cancel::CancelSignal;

// ─────────────────────────────────────────────────────────────────────────────
// Deploy Options
// ─────────────────────────────────────────────────────────────────────────────

/// Called before each file of a workspace deploy
pub type BeforeFileHook = Arc<dyn Fn(&Path, &TargetDescriptor) + Send + Sync>;

/// Called after each file of a workspace deploy
pub type FileCompletedHook = Arc<dyn Fn(&FileCompletion) + Send + Sync>;

/// Completion callback, receives the sending plugin's info and the outcome
pub type OnCompleted<T> = Box<dyn FnOnce(&PluginInfo, &T) + Send>;

/// Per-operation settings, built fresh for every operation
#[derive(Clone, Default)]
pub struct DeployOptions {
    /// Directory that file paths are relative to
    pub base_directory: PathBuf,

    /// Cancellation for this operation
    pub cancel: CancelSignal,

    /// Workspace deploys: called before each file
    pub on_before_deploy_file: Option<BeforeFileHook>,

    /// Workspace deploys: called with each file's completion
    pub on_file_completed: Option<FileCompletedHook>,
}

impl DeployOptions {
    pub fn new(base_directory: impl Into<PathBuf>) -> Self {
        Self {
            base_directory: base_directory.into(),
            ..Default::default()
        }
    }

    /// Use an existing cancellation signal
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn on_before_deploy_file(
        mut self,
        hook: impl Fn(&Path, &TargetDescriptor) + Send + Sync + 'static,
    ) -> Self {
        self.on_before_deploy_file = Some(Arc::new(hook));
        self
    }

    pub fn on_file_completed(mut self, hook: impl Fn(&FileCompletion) + Send + Sync + 'static) -> Self {
        self.on_file_completed = Some(Arc::new(hook));
        self
    }

    /// Resolve a file path against the base directory
    pub fn resolve(&self, file: &Path) -> PathBuf {
        if file.is_absolute() {
            file.to_path_buf()
        } else {
            self.base_directory.join(file)
        }
    }

    /// A file's path relative to the base directory, if it lies inside it
    pub fn relative(&self, file: &Path) -> Option<PathBuf> {
        let absolute = self.resolve(file);
        absolute
            .strip_prefix(&self.base_directory)
            .ok()
            .map(Path::to_path_buf)
    }
}

impl std::fmt::Debug for DeployOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeployOptions")
            .field("base_directory", &self.base_directory)
            .field("cancel", &self.cancel)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Plugin Trait
// ─────────────────────────────────────────────────────────────────────────────

/// The contract every deploy backend implements
///
/// Deploy methods must not panic and must report every failure through the
/// returned completion. If cancellation was requested before any work
/// started they return a canceled completion without doing anything.
#[async_trait]
pub trait DeployPlugin: Send + Sync + 'static {
    /// Static self-description
    fn info(&self) -> PluginInfo;

    /// Deploy one file to one target
    async fn deploy_file(
        &self,
        file: &Path,
        target: &TargetDescriptor,
        opts: &DeployOptions,
    ) -> FileCompletion;

    /// Deploy a set of files to one target
    ///
    /// The default deploys file by file and aggregates the outcomes.
    async fn deploy_workspace(
        &self,
        files: &[PathBuf],
        target: &TargetDescriptor,
        opts: &DeployOptions,
    ) -> WorkspaceCompletion {
        dispatch::deploy_each_file(self, files, target, opts).await
    }

    /// How many files the default workspace deploy runs at once
    fn max_parallel_files(&self) -> usize {
        1
    }

    /// Called whenever configuration changes; must reset all session state
    fn on_config_reloaded(&self, _config: &DeployConfig) {}

    /// Run `callback` if/when the operation behind `opts` is cancelled
    fn on_cancelling(&self, callback: Box<dyn FnOnce() + Send>, opts: &DeployOptions) {
        opts.cancel.on_cancelling(callback);
    }
}
