//! Session State
//!
//! State a plugin instance keeps between invocations for one configuration
//! epoch: one object shared by every module the instance loads, and one
//! private object per module keyed by the module's resolved path. Both are
//! guarded by the same lock so a reset clears them together.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde_json::{Map, Value};

#[derive(Debug)]
struct Maps {
    global: Value,
    modules: HashMap<PathBuf, Value>,
}

impl Default for Maps {
    fn default() -> Self {
        Self {
            global: Value::Object(Map::new()),
            modules: HashMap::new(),
        }
    }
}

/// Global and per-module state of one plugin instance
#[derive(Debug, Default)]
pub struct SessionState {
    maps: Mutex<Maps>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// State shared by every module of this instance; `{}` after a reset
    pub fn global(&self) -> Value {
        self.maps.lock().global.clone()
    }

    pub fn set_global(&self, value: Value) {
        self.maps.lock().global = value;
    }

    /// Private state of the module at `path`, if it ever wrote any
    pub fn module(&self, path: &Path) -> Option<Value> {
        self.maps.lock().modules.get(path).cloned()
    }

    pub fn set_module(&self, path: &Path, value: Value) {
        self.maps.lock().modules.insert(path.to_path_buf(), value);
    }

    /// Forget the private state of one module
    pub fn remove_module(&self, path: &Path) -> Option<Value> {
        self.maps.lock().modules.remove(path)
    }

    /// Number of modules holding private state
    pub fn module_count(&self) -> usize {
        self.maps.lock().modules.len()
    }

    /// Clear global and module state together
    pub fn reset(&self) {
        *self.maps.lock() = Maps::default();
        tracing::debug!("Session state reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_module_state_is_keyed_by_path() {
        let state = SessionState::new();
        let a = Path::new("/w/a.js");
        let b = Path::new("/w/b.js");

        state.set_module(a, json!({"runs": 1}));
        assert_eq!(state.module(a), Some(json!({"runs": 1})));
        assert_eq!(state.module(b), None);
        assert_eq!(state.module_count(), 1);
    }

    #[test]
    fn test_reset_clears_both_maps() {
        let state = SessionState::new();
        state.set_global(json!({"token": "abc"}));
        state.set_module(Path::new("/w/a.js"), json!(42));

        state.reset();

        assert_eq!(state.global(), json!({}));
        assert_eq!(state.module(Path::new("/w/a.js")), None);
        assert_eq!(state.module_count(), 0);
    }
}
