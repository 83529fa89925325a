//! In-process change notification.
//!
//! Listeners are plain callbacks. `notify` fires once per aggregate rebuild;
//! listeners read the new state from the store themselves.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::error;

type Listener = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct HubInner {
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_id: AtomicU64,
}

impl HubInner {
    fn listeners(&self) -> MutexGuard<'_, Vec<(u64, Listener)>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, id: u64) {
        self.listeners().retain(|(listener, _)| *listener != id);
    }
}

#[derive(Clone, Default)]
pub struct ListenerHub {
    inner: Arc<HubInner>,
}

impl ListenerHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener`. It stays registered until the returned
    /// [`Subscription`] is dropped or unsubscribed.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners().push((id, Arc::new(listener)));
        Subscription {
            hub: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Call every listener registered at the time of the call. Listeners may
    /// subscribe or unsubscribe from inside the callback. A panicking
    /// listener is logged and the remaining listeners still run.
    pub fn notify(&self) {
        let snapshot: Vec<(u64, Listener)> = self.inner.listeners().clone();
        for (id, listener) in snapshot {
            if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| listener())) {
                error!(listener = id, reason = panic_message(&*panic), "state listener panicked");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.listeners().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown"
    }
}

/// Keeps a listener registered.
#[must_use = "dropping a Subscription unregisters its listener"]
pub struct Subscription {
    hub: Weak<HubInner>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(self.id);
        }
    }
}
