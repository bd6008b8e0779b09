//! Deployer - Deploy files to configured targets
//!
//! The application crate: the JavaScript-driven `script` plugin, the
//! built-in `local` and `test` plugins, and the registry that wires them
//! into a [`deploy_runtime::Orchestrator`].

pub mod plugins;
pub mod script;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use deploy_runtime::{DeployPlugin, PluginRegistry};

pub use plugins::{LocalPlugin, TestPlugin};
pub use script::ScriptPlugin;

/// Registry with every built-in plugin type
pub fn builtin_registry() -> PluginRegistry {
    PluginRegistry::new()
        .with(script::PLUGIN_TYPE, |ctx| Arc::new(ScriptPlugin::new(ctx)) as Arc<dyn DeployPlugin>)
        .with(plugins::local::PLUGIN_TYPE, |ctx| Arc::new(LocalPlugin::new(ctx)) as Arc<dyn DeployPlugin>)
        .with(plugins::test::PLUGIN_TYPE, |_| Arc::new(TestPlugin::new()) as Arc<dyn DeployPlugin>)
}

/// Every file under `root` that is not ignored, relative to `root`
///
/// Honours `.gitignore`, `.ignore` and hidden-file rules.
pub fn workspace_files(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = ignore::WalkBuilder::new(root)
        .require_git(false)
        .build()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!(error = %e, "Skipping unreadable path");
                None
            }
        })
        .filter(|entry| entry.file_type().is_some_and(|t| t.is_file()))
        .filter_map(|entry| entry.path().strip_prefix(root).ok().map(Path::to_path_buf))
        .collect();
    files.sort();
    files
}

/// What a `file` request deploys once the path has been looked at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOrFolder {
    File(PathBuf),
    /// Non-ignored files of a directory, each prefixed with the given path
    Folder { dir: PathBuf, files: Vec<PathBuf> },
}

/// Expand `path` (relative to `root` unless absolute) into a single file or
/// the files of a folder
pub fn file_or_folder(root: &Path, path: &Path) -> FileOrFolder {
    let resolved = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    };

    if !resolved.is_dir() {
        return FileOrFolder::File(path.to_path_buf());
    }

    let files = workspace_files(&resolved)
        .into_iter()
        .map(|file| path.join(file))
        .collect();
    FileOrFolder::Folder {
        dir: path.to_path_buf(),
        files,
    }
}
