//! Online/offline signal.

use std::sync::Arc;
use tokio::sync::watch;

/// Publishes the backend's reachability.
///
/// Clones share the same signal; every [`Connectivity::subscribe`] receiver
/// observes each change.
#[derive(Debug, Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    /// Creates a signal with the given initial state.
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    /// Creates a signal that starts online.
    pub fn online() -> Self {
        Self::new(true)
    }

    /// Creates a signal that starts offline.
    pub fn offline() -> Self {
        Self::new(false)
    }

    /// Publishes a new state. Setting the current state again is a no-op.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            tracing::info!(online, "connectivity changed");
        }
    }

    /// Returns the current state.
    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Returns a receiver that observes every change.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::online()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receivers_see_changes() {
        let connectivity = Connectivity::online();
        let mut rx = connectivity.subscribe();
        assert!(!rx.has_changed().unwrap());

        connectivity.set_online(false);
        assert!(rx.has_changed().unwrap());
        assert!(!*rx.borrow_and_update());
        assert!(!connectivity.is_online());
    }

    #[test]
    fn same_state_is_not_a_change() {
        let connectivity = Connectivity::offline();
        let mut rx = connectivity.subscribe();

        connectivity.set_online(false);
        assert!(!rx.has_changed().unwrap());

        connectivity.set_online(true);
        assert!(rx.has_changed().unwrap());
        assert!(*rx.borrow_and_update());
    }

    #[test]
    fn clones_share_state() {
        let a = Connectivity::online();
        let b = a.clone();
        b.set_online(false);
        assert!(!a.is_online());
    }
}
