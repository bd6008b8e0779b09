//! Process-wide global value store

use dashmap::DashMap;
use serde_json::{Map, Value};

/// Key/value store shared by every plugin invocation in a session
#[derive(Debug, Default)]
pub struct GlobalStore {
    values: DashMap<String, Value>,
}

impl GlobalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).map(|v| v.value().clone())
    }

    /// Set a value, returning the previous one
    pub fn set(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.values.insert(key.into(), value)
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.values.remove(key).map(|(_, v)| v)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Copy of every value, for handing to script code
    pub fn snapshot(&self) -> Map<String, Value> {
        self.values
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_get_snapshot() {
        let store = GlobalStore::new();
        assert!(store.set("a", json!(1)).is_none());
        assert_eq!(store.set("a", json!(2)), Some(json!(1)));
        store.set("b", json!({"x": true}));

        assert_eq!(store.get("a"), Some(json!(2)));
        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot["b"]["x"], true);

        assert_eq!(store.remove("a"), Some(json!(2)));
        assert!(!store.contains("a"));
    }
}
