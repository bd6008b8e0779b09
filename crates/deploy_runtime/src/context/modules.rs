//! Module Loader
//!
//! Resolves module ids to files and loads their source on behalf of plugin
//! code. `require` goes through a cache like any module system; `reload`
//! discards the cached entry first so the file is always read fresh.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use deploy_types::DeployError;

/// Source of a loaded module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSource {
    /// Resolved absolute path
    pub path: PathBuf,
    /// Directory containing the module, base for its relative requires
    pub directory: PathBuf,
    /// Module source text
    pub source: String,
}

/// Resolves and loads modules from a list of search roots
#[derive(Debug)]
pub struct ModuleLoader {
    roots: Vec<PathBuf>,
    cache: DashMap<PathBuf, Arc<ModuleSource>>,
}

impl ModuleLoader {
    /// Create a loader; bare ids are searched in `roots` in order
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self {
            roots,
            cache: DashMap::new(),
        }
    }

    /// Resolve a module id to an existing file
    ///
    /// Absolute ids are used as-is, `./` and `../` ids are relative to `from`
    /// (or the first root), anything else is looked up in every root. For
    /// each candidate the exact path, `<id>.js` and `<id>/index.js` are tried.
    pub fn resolve(&self, id: &str, from: Option<&Path>) -> Result<PathBuf, DeployError> {
        let id = id.trim();
        if id.is_empty() {
            return Err(DeployError::ScriptNotFound {
                script: String::new(),
            });
        }

        let requested = Path::new(id);
        let bases: Vec<PathBuf> = if requested.is_absolute() {
            vec![requested.to_path_buf()]
        } else if id.starts_with("./") || id.starts_with("../") || id.starts_with(".\\") {
            let dir = from
                .map(Path::to_path_buf)
                .or_else(|| self.roots.first().cloned())
                .unwrap_or_else(|| PathBuf::from("."));
            vec![dir.join(requested)]
        } else {
            self.roots.iter().map(|root| root.join(requested)).collect()
        };

        bases
            .iter()
            .flat_map(|base| candidates(base))
            .find(|candidate| candidate.is_file())
            .map(|found| normalize_path(&found))
            .ok_or_else(|| DeployError::ScriptNotFound {
                script: id.to_string(),
            })
    }

    /// Load a module, reusing the cached source when present
    pub fn require(&self, id: &str, from: Option<&Path>) -> Result<Arc<ModuleSource>, DeployError> {
        let path = self.resolve(id, from)?;
        if let Some(cached) = self.cache.get(&path) {
            return Ok(Arc::clone(cached.value()));
        }

        let module = Arc::new(read_module(&path)?);
        self.cache.insert(path, Arc::clone(&module));
        Ok(module)
    }

    /// Discard any cached copy of `path` and load it fresh from disk
    pub fn reload(&self, path: &Path) -> Result<Arc<ModuleSource>, DeployError> {
        let path = normalize_path(path);
        self.invalidate(&path);

        if !path.is_file() {
            return Err(DeployError::ScriptNotFound {
                script: path.display().to_string(),
            });
        }

        let module = Arc::new(read_module(&path)?);
        self.cache.insert(path, Arc::clone(&module));
        Ok(module)
    }

    /// Drop the cached copy of one module
    pub fn invalidate(&self, path: &Path) -> bool {
        self.cache.remove(&normalize_path(path)).is_some()
    }

    /// Drop every cached module
    pub fn clear(&self) {
        self.cache.clear();
    }

    pub fn is_cached(&self, path: &Path) -> bool {
        self.cache.contains_key(&normalize_path(path))
    }
}

/// Absolute, symlink-free form of a path where possible
///
/// Used as the identity of a module, so two spellings of one file map to
/// the same key.
pub fn normalize_path(path: &Path) -> PathBuf {
    std::fs::canonicalize(path)
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

fn candidates(base: &Path) -> Vec<PathBuf> {
    let mut list = vec![base.to_path_buf()];
    if base.extension().is_none_or(|ext| ext != "js") {
        let mut with_ext = base.as_os_str().to_owned();
        with_ext.push(".js");
        list.push(PathBuf::from(with_ext));
    }
    list.push(base.join("index.js"));
    list
}

fn read_module(path: &Path) -> Result<ModuleSource, DeployError> {
    let source = std::fs::read_to_string(path).map_err(|e| DeployError::ScriptLoad {
        script: path.display().to_string(),
        message: e.to_string(),
    })?;

    let directory = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    Ok(ModuleSource {
        path: path.to_path_buf(),
        directory,
        source,
    })
}
