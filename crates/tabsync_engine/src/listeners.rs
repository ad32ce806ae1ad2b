//! Listener registries with per-listener panic isolation.

use parking_lot::RwLock;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Inner<T: ?Sized> {
    next_id: u64,
    entries: Vec<(u64, Callback<T>)>,
}

trait Detach: Send + Sync {
    fn detach(&self, id: u64) -> bool;
}

impl<T: ?Sized + 'static> Detach for RwLock<Inner<T>> {
    fn detach(&self, id: u64) -> bool {
        let mut inner = self.write();
        let before = inner.entries.len();
        inner.entries.retain(|(entry_id, _)| *entry_id != id);
        inner.entries.len() != before
    }
}

/// An ordered set of callbacks receiving `&T`.
///
/// Callbacks run outside the registry lock, so a callback may subscribe or
/// unsubscribe without deadlocking. A panicking callback is logged and the
/// remaining callbacks still run.
pub(crate) struct ListenerRegistry<T: ?Sized> {
    inner: Arc<RwLock<Inner<T>>>,
}

impl<T: ?Sized + 'static> ListenerRegistry<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    pub(crate) fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut inner = self.inner.write();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.entries.push((id, Arc::new(callback)));
            id
        };

        let registry: Weak<dyn Detach> = Arc::downgrade(&self.inner) as Weak<RwLock<Inner<T>>>;
        Subscription { registry, id }
    }

    /// Invokes every callback in registration order.
    pub(crate) fn notify(&self, value: &T) {
        let callbacks: Vec<Callback<T>> = self
            .inner
            .read()
            .entries
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
                tracing::error!("listener panicked; continuing with remaining listeners");
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub(crate) fn clear(&self) {
        self.inner.write().entries.clear();
    }
}

/// Handle returned by every `subscribe` call.
///
/// Dropping the handle keeps the listener registered; call
/// [`Subscription::unsubscribe`] to remove it.
#[must_use = "call `unsubscribe` to remove the listener"]
pub struct Subscription {
    registry: Weak<dyn Detach>,
    id: u64,
}

impl Subscription {
    /// Removes the listener. Returns false if it was already gone.
    pub fn unsubscribe(self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.detach(self.id))
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
