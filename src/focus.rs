//! Window-focus signal.
//!
//! The host (a UI adapter, a terminal, a test) reports focus changes with
//! [`FocusManager::set_focused`]. A mounted [`QueryClient`](crate::QueryClient)
//! listens and, on regaining focus, lets every query ask its observers
//! whether to refetch (`refetch_on_window_focus`). Polling observers also
//! consult the focus state to decide whether to keep polling in the
//! background.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::notify::{ListenerSet, Subscription};

/// Tracks whether the host application is focused.
pub struct FocusManager {
    focused: AtomicBool,
    listeners: ListenerSet<bool>,
}

impl FocusManager {
    /// Create a manager; hosts start out focused.
    pub fn new() -> Self {
        Self {
            focused: AtomicBool::new(true),
            listeners: ListenerSet::default(),
        }
    }

    /// Record the focus state; listeners run only when it changes.
    pub fn set_focused(&self, focused: bool) {
        let previous = self.focused.swap(focused, Ordering::SeqCst);
        if previous != focused {
            debug!(focused, "focus changed");
            self.listeners.emit(&focused);
        }
    }

    pub fn is_focused(&self) -> bool {
        self.focused.load(Ordering::SeqCst)
    }

    /// Listen for focus changes.
    pub fn subscribe<F>(self: &Arc<Self>, listener: F) -> Subscription
    where
        F: Fn(&bool) + Send + Sync + 'static,
    {
        let id = self.listeners.add(Arc::new(listener));
        let manager = Arc::downgrade(self);
        Subscription::new(move || {
            if let Some(manager) = manager.upgrade() {
                manager.listeners.remove(id);
            }
        })
    }
}

impl Default for FocusManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FocusManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FocusManager")
            .field("focused", &self.is_focused())
            .finish()
    }
}
