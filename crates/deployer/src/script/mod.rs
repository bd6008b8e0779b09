//! Script Deploy Plugin
//!
//! Runs user-authored JavaScript as the deployment logic of a target. The
//! script (target `script`, default `./deploy.js`, relative to the workspace
//! root) is read fresh from disk on every invocation and evaluated in a new
//! QuickJS runtime, so edits take effect on the next run.
//!
//! # Script Contract
//!
//! ```javascript
//! exports.deployFile = async (args) => {
//!     // args.file, args.target, args.targetOptions, args.deployOptions
//!     const runs = (args.getState() || 0) + 1;
//!     args.setState(runs);
//!     console.log(`deploying ${args.file} (run ${runs})`);
//! };
//!
//! // Optional, files are deployed one by one through deployFile otherwise
//! exports.deployWorkspace = async (args) => {
//!     for (const file of args.files) { /* ... */ }
//! };
//! ```
//!
//! Setting `args.canceled = true` (or returning an object with
//! `canceled: true`) reports the operation as canceled. A script still
//! running shortly after cancellation is interrupted and reported as
//! canceled.
//!
//! Scripts get `console`, `setTimeout`/`clearTimeout` and the built-in
//! modules `fs` (synchronous calls plus `fs.promises`) and `path` (POSIX).
//! Relative paths resolve against the workspace root.

mod fs;
mod host;
mod runtime;

pub use host::{SCRIPT_LOG_TARGET, ScriptHost};
pub use runtime::{Entry, Outcome, ScriptModule, ScriptRuntime, ThrownError};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use deploy_runtime::context::normalize_path;
use deploy_runtime::dispatch;
use deploy_runtime::{DeployContext, DeployOptions, DeployPlugin, SessionState};
use deploy_types::{
    DeployConfig, DeployError, FileCompletion, PluginInfo, TargetDescriptor, WorkspaceCompletion,
};
use serde_json::{Value, json};

/// Target type handled by [`ScriptPlugin`]
pub const PLUGIN_TYPE: &str = "script";

/// Where a target's script lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptLocation {
    /// Resolved absolute path, the key of the script's private state
    pub absolute: PathBuf,
    /// Path relative to the operation's base directory, for messages
    pub relative: String,
}

/// What an invocation deploys
enum Subject<'a> {
    File(&'a Path),
    Files(&'a [PathBuf]),
}

// ─────────────────────────────────────────────────────────────────────────────
// Script Plugin
// ─────────────────────────────────────────────────────────────────────────────

/// Deploys through a user-supplied JavaScript module
pub struct ScriptPlugin {
    context: Arc<DeployContext>,
    state: Arc<SessionState>,
}

impl ScriptPlugin {
    pub fn new(context: Arc<DeployContext>) -> Self {
        Self {
            context,
            state: Arc::new(SessionState::new()),
        }
    }

    /// Session state shared by every script this instance runs
    pub fn state(&self) -> &Arc<SessionState> {
        &self.state
    }

    /// Resolve the script of `target`
    pub fn locate(&self, target: &TargetDescriptor, opts: &DeployOptions) -> ScriptLocation {
        let configured = Path::new(target.script_or_default());
        let joined = if configured.is_absolute() {
            configured.to_path_buf()
        } else {
            self.context.workspace_root().join(configured)
        };
        let absolute = normalize_path(&joined);

        let relative = absolute
            .strip_prefix(normalize_path(&opts.base_directory))
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| absolute.display().to_string());

        ScriptLocation { absolute, relative }
    }

    /// Reload the script and run one entry point on a blocking thread
    async fn execute(
        &self,
        entry: Entry,
        subject: Subject<'_>,
        target: &TargetDescriptor,
        opts: &DeployOptions,
        location: &ScriptLocation,
    ) -> Result<Outcome, DeployError> {
        let request = self.request(subject, target, opts, location);
        let host = ScriptHost::new(
            Arc::clone(&self.context),
            Arc::clone(&self.state),
            location.absolute.clone(),
            opts.cancel.clone(),
        );
        let location = location.clone();

        tracing::debug!(
            target = %target.name,
            script = %location.relative,
            entry = entry.export_name(),
            "Running deploy script"
        );

        let task = tokio::task::spawn_blocking(move || -> Result<Outcome, DeployError> {
            let module = host
                .context()
                .modules()
                .reload(&location.absolute)
                .map_err(|e| match e {
                    DeployError::ScriptNotFound { .. } => DeployError::ScriptNotFound {
                        script: location.relative.clone(),
                    },
                    other => other,
                })?;

            ScriptRuntime::new(Arc::new(host))?.invoke(&module, &location.relative, entry, &request)
        });

        match task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(DeployError::Panicked(format!("script runtime panicked: {e}"))),
            Err(e) => Err(DeployError::Runtime(e.to_string())),
        }
    }

    /// The JSON part of the argument bundle; accessors are added in JS
    fn request(
        &self,
        subject: Subject<'_>,
        target: &TargetDescriptor,
        opts: &DeployOptions,
        location: &ScriptLocation,
    ) -> Value {
        let info = self.info();
        let directory = location
            .absolute
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut request = json!({
            "target": target,
            "targetOptions": target.options,
            "deployOptions": { "baseDirectory": opts.base_directory.to_string_lossy() },
            "sender": info,
            "script": location.relative,
            "scriptPath": location.absolute.to_string_lossy(),
            "scriptDirectory": directory,
            "globals": self.context.globals().snapshot(),
        });

        match subject {
            Subject::File(file) => {
                request["file"] = json!(file.to_string_lossy());
            }
            Subject::Files(files) => {
                request["files"] = files.iter().map(|f| json!(f.to_string_lossy())).collect();
            }
        }
        request
    }
}

#[async_trait]
impl DeployPlugin for ScriptPlugin {
    fn info(&self) -> PluginInfo {
        PluginInfo::new(PLUGIN_TYPE, "Deploys via a JavaScript module")
    }

    async fn deploy_file(&self, file: &Path, target: &TargetDescriptor, opts: &DeployOptions) -> FileCompletion {
        if opts.cancel.is_cancelled() {
            return FileCompletion::canceled(file, target);
        }

        let location = self.locate(target, opts);
        let outcome = self
            .execute(Entry::DeployFile, Subject::File(file), target, opts, &location)
            .await;

        match outcome {
            Ok(Outcome::Resolved { canceled }) => FileCompletion::succeeded(file, target).with_canceled(canceled),
            Ok(Outcome::Interrupted) => FileCompletion::canceled(file, target),
            Ok(Outcome::Rejected { error: Some(error) }) => FileCompletion::failed(file, target, thrown(error)),
            Ok(Outcome::Rejected { error: None }) => FileCompletion::failed(
                file,
                target,
                DeployError::DeployFileFailed {
                    file: file.display().to_string(),
                    script: location.relative,
                },
            ),
            Ok(Outcome::MissingExport) => FileCompletion::failed(
                file,
                target,
                DeployError::MissingExport {
                    script: location.relative,
                    export: Entry::DeployFile.export_name().to_string(),
                },
            ),
            Err(e) => FileCompletion::failed(file, target, e),
        }
    }

    async fn deploy_workspace(
        &self,
        files: &[PathBuf],
        target: &TargetDescriptor,
        opts: &DeployOptions,
    ) -> WorkspaceCompletion {
        if opts.cancel.is_cancelled() {
            return WorkspaceCompletion::canceled(target);
        }

        let location = self.locate(target, opts);
        let outcome = self
            .execute(Entry::DeployWorkspace, Subject::Files(files), target, opts, &location)
            .await;

        match outcome {
            Ok(Outcome::Resolved { canceled }) => WorkspaceCompletion::succeeded(target).with_canceled(canceled),
            Ok(Outcome::Interrupted) => WorkspaceCompletion::canceled(target),
            Ok(Outcome::Rejected { error: Some(error) }) => WorkspaceCompletion::failed(target, thrown(error)),
            Ok(Outcome::Rejected { error: None }) => WorkspaceCompletion::failed(
                target,
                DeployError::DeployWorkspaceFailed {
                    script: location.relative,
                },
            ),
            Ok(Outcome::MissingExport) => {
                tracing::debug!(target = %target.name, script = %location.relative, "No deployWorkspace export, deploying file by file");
                dispatch::deploy_each_file(self, files, target, opts).await
            }
            Err(e) => WorkspaceCompletion::failed(target, e),
        }
    }

    fn on_config_reloaded(&self, _config: &DeployConfig) {
        self.state.reset();
    }
}

fn thrown(error: ThrownError) -> DeployError {
    if let Some(stack) = &error.stack {
        tracing::debug!(name = %error.name, %stack, "Script error stack");
    }
    DeployError::Script {
        name: error.name,
        message: error.message,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
