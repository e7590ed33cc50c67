//! Network connectivity signal.
//!
//! Reported by the host with [`OnlineManager::set_online`]. A mounted
//! [`QueryClient`](crate::QueryClient) refetches eligible queries when the
//! connection comes back (`refetch_on_reconnect`).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::notify::{ListenerSet, Subscription};

/// Tracks whether the host has network connectivity.
pub struct OnlineManager {
    online: AtomicBool,
    listeners: ListenerSet<bool>,
}

impl OnlineManager {
    /// Create a manager; hosts start out online.
    pub fn new() -> Self {
        Self {
            online: AtomicBool::new(true),
            listeners: ListenerSet::default(),
        }
    }

    /// Record connectivity; listeners run only when it changes.
    pub fn set_online(&self, online: bool) {
        let previous = self.online.swap(online, Ordering::SeqCst);
        if previous != online {
            debug!(online, "connectivity changed");
            self.listeners.emit(&online);
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Listen for connectivity changes.
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

impl Default for OnlineManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OnlineManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnlineManager")
            .field("online", &self.is_online())
            .finish()
    }
}
