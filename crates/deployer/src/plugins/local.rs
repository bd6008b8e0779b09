//! Local directory plugin: copies files into `options.dir`

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use deploy_runtime::{DeployContext, DeployOptions, DeployPlugin};
use deploy_types::{DeployError, FileCompletion, PluginInfo, TargetDescriptor};

pub const PLUGIN_TYPE: &str = "local";

/// Files copied at once during a workspace deploy
const PARALLEL_COPIES: usize = 4;

/// Copies files into a local directory, keeping their relative layout
pub struct LocalPlugin {
    context: Arc<DeployContext>,
}

impl LocalPlugin {
    pub fn new(context: Arc<DeployContext>) -> Self {
        Self { context }
    }

    /// Destination directory of `target`
    fn destination(&self, target: &TargetDescriptor) -> Result<PathBuf, DeployError> {
        let dir = target
            .option_str("dir")
            .filter(|d| !d.trim().is_empty())
            .ok_or_else(|| DeployError::Plugin(format!("target '{}' has no 'dir' option", target.name)))?;

        let dir = Path::new(dir);
        Ok(if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            self.context.workspace_root().join(dir)
        })
    }

    async fn copy(&self, file: &Path, target: &TargetDescriptor, opts: &DeployOptions) -> Result<PathBuf, DeployError> {
        let destination = self.destination(target)?;
        let source = opts.resolve(file);
        let relative = opts
            .relative(file)
            .or_else(|| file.file_name().map(PathBuf::from))
            .ok_or_else(|| DeployError::Plugin(format!("'{}' is not a file path", file.display())))?;
        let output = destination.join(relative);

        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&source, &output).await?;
        Ok(output)
    }
}

#[async_trait]
impl DeployPlugin for LocalPlugin {
    fn info(&self) -> PluginInfo {
        PluginInfo::new(PLUGIN_TYPE, "Copies files into a local directory")
    }

    async fn deploy_file(&self, file: &Path, target: &TargetDescriptor, opts: &DeployOptions) -> FileCompletion {
        if opts.cancel.is_cancelled() {
            return FileCompletion::canceled(file, target);
        }

        match self.copy(file, target, opts).await {
            Ok(output) => {
                tracing::info!(target = %target.name, file = %file.display(), to = %output.display(), "Copied");
                FileCompletion::succeeded(file, target)
            }
            Err(e) => {
                tracing::warn!(target = %target.name, file = %file.display(), error = %e, "Copy failed");
                FileCompletion::failed(file, target, e)
            }
        }
    }

    fn max_parallel_files(&self) -> usize {
        PARALLEL_COPIES
    }
}
