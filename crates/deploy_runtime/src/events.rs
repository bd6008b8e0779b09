//! Global Event Bus
//!
//! The in-process publish/subscribe bus shared by every plugin and the host.
//! Delivery is synchronous. Each emission works on a snapshot of the
//! listeners registered at call time, so listeners added while an event is
//! being delivered only see later emissions.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Event
// ─────────────────────────────────────────────────────────────────────────────

/// An event delivered to listeners
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalEvent {
    /// Event name (e.g., "deploy.completed")
    pub name: String,

    /// Event-specific payload, not schema-checked
    pub args: Vec<serde_json::Value>,

    /// Timestamp when the event was emitted (Unix milliseconds)
    pub timestamp: u64,
}

impl GlobalEvent {
    pub fn new(name: impl Into<String>, args: Vec<serde_json::Value>) -> Self {
        Self {
            name: name.into(),
            args,
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        }
    }

    /// Get a positional argument
    pub fn arg(&self, index: usize) -> Option<&serde_json::Value> {
        self.args.get(index)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Event Bus
// ─────────────────────────────────────────────────────────────────────────────

/// A registered listener
pub type Listener = Arc<dyn Fn(&GlobalEvent) -> anyhow::Result<()> + Send + Sync>;

/// Identifies a listener registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Publish/subscribe bus keyed by event name
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<HashMap<String, Vec<(ListenerId, Listener)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for an event name
    pub fn on<F>(&self, name: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(&GlobalEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .entry(name.into())
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener, returns whether it was registered
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let mut removed = false;
        for entries in listeners.values_mut() {
            let before = entries.len();
            entries.retain(|(entry_id, _)| *entry_id != id);
            removed |= entries.len() != before;
        }
        listeners.retain(|_, entries| !entries.is_empty());
        removed
    }

    /// Deliver an event to every listener registered for its name
    ///
    /// Returns whether at least one listener existed. Listener errors and
    /// panics are logged, never propagated to the emitter.
    pub fn emit(&self, name: &str, args: Vec<serde_json::Value>) -> bool {
        let snapshot: Vec<Listener> = match self.listeners.read().get(name) {
            Some(entries) => entries.iter().map(|(_, l)| Arc::clone(l)).collect(),
            None => return false,
        };

        if snapshot.is_empty() {
            return false;
        }

        let event = GlobalEvent::new(name, args);
        for listener in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(event = %name, error = %e, "Event listener failed");
                }
                Err(_) => {
                    tracing::warn!(event = %name, "Event listener panicked");
                }
            }
        }

        true
    }

    /// Number of listeners for an event name
    pub fn listener_count(&self, name: &str) -> usize {
        self.listeners.read().get(name).map(Vec::len).unwrap_or(0)
    }

    /// Drop every listener (session end)
    pub fn clear(&self) {
        self.listeners.write().clear();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_emit_without_listeners() {
        let bus = EventBus::new();
        assert!(!bus.emit("nothing", vec![]));
    }

    #[test]
    fn test_emit_delivers_args() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = seen.clone();
        bus.on("files.deployed", move |event| {
            s.lock().push(event.args.clone());
            Ok(())
        });

        assert!(bus.emit("files.deployed", vec![serde_json::json!("a.txt"), serde_json::json!(2)]));
        assert!(!bus.emit("other", vec![]));

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0][0], "a.txt");
        assert_eq!(seen[0][1], 2);
    }

    #[test]
    fn test_failing_listener_does_not_stop_others() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        bus.on("evt", |_| anyhow::bail!("listener failed"));
        bus.on("evt", |_| panic!("listener panicked"));
        let c = count.clone();
        bus.on("evt", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(bus.emit("evt", vec![]));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_added_during_emit_misses_that_emission() {
        let bus = Arc::new(EventBus::new());
        let late_calls = Arc::new(AtomicUsize::new(0));

        let bus_ref = Arc::downgrade(&bus);
        let late = late_calls.clone();
        bus.on("evt", move |_| {
            if let Some(bus) = bus_ref.upgrade() {
                let late = late.clone();
                bus.on("evt", move |_| {
                    late.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
            }
            Ok(())
        });

        bus.emit("evt", vec![]);
        assert_eq!(late_calls.load(Ordering::SeqCst), 0);

        bus.emit("evt", vec![]);
        assert_eq!(late_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_off_and_clear() {
        let bus = EventBus::new();
        let id = bus.on("a", |_| Ok(()));
        bus.on("b", |_| Ok(()));

        assert_eq!(bus.listener_count("a"), 1);
        assert!(bus.off(id));
        assert!(!bus.off(id));
        assert_eq!(bus.listener_count("a"), 0);

        bus.clear();
        assert_eq!(bus.listener_count("b"), 0);
    }
}
