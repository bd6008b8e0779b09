//! Cooperative Cancellation
//!
//! A [`CancelSignal`] is a cancellation flag plus a list of `onCancelling`
//! hooks. Cancelling never interrupts work; plugins poll the flag or register
//! a hook to react.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

type Hook = Box<dyn FnOnce() + Send>;

/// Cancellation flag with `onCancelling` hooks
///
/// Clones share the same flag and hooks. [`CancelSignal::child`] creates a
/// signal that is cancelled together with its parent but has its own hooks.
#[derive(Clone, Default)]
pub struct CancelSignal {
    token: CancellationToken,
    hooks: Arc<Mutex<Vec<Hook>>>,
}

impl std::fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelSignal")
            .field("cancelled", &self.is_cancelled())
            .field("hooks", &self.pending_hooks())
            .finish()
    }
}

impl CancelSignal {
    /// Create a signal that is not cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a child signal for one sub-operation
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            hooks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Request cancellation and run the registered hooks
    pub fn cancel(&self) {
        self.token.cancel();
        self.fire_hooks();
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait until cancellation is requested
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Register a hook to run when cancellation is requested
    ///
    /// Runs the hook immediately if the signal is already cancelled.
    pub fn on_cancelling(&self, hook: impl FnOnce() + Send + 'static) {
        let mut hooks = self.hooks.lock();
        if self.is_cancelled() {
            drop(hooks);
            hook();
        } else {
            hooks.push(Box::new(hook));
        }
    }

    /// Hooks registered and not yet run
    pub fn pending_hooks(&self) -> usize {
        self.hooks.lock().len()
    }

    /// Run and drop every pending hook
    ///
    /// Needed for children, whose token is cancelled by the parent without
    /// going through [`CancelSignal::cancel`].
    pub fn fire_hooks(&self) {
        let hooks = std::mem::take(&mut *self.hooks.lock());
        for hook in hooks {
            hook();
        }
    }
}
