//! Memory pressure notification
//!
//! Hosts embedding many maps want one "low memory" signal that makes every
//! map flush its append cache. Instead of ambient global state, pressure is
//! modeled as an explicit source object: the host owns a
//! `MemoryPressureSource`, maps subscribe to it, and the subscription is torn
//! down deterministically when the map closes (or the handle drops).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

type Callback = Box<dyn Fn() + Send + Sync>;

struct Registry {
    subscribers: Mutex<Vec<(u64, Callback)>>,
    next_id: AtomicU64,
}

/// A shareable source of low-memory notifications.
#[derive(Clone)]
pub struct MemoryPressureSource {
    registry: Arc<Registry>,
}

impl MemoryPressureSource {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a callback to run on every notification. The callback fires
    /// on the notifying thread and may block on its own locks; it must not
    /// subscribe or unsubscribe from within.
    pub fn subscribe(&self, callback: Callback) -> MemoryPressureSubscription {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.subscribers.lock().push((id, callback));
        MemoryPressureSubscription {
            registry: Arc::downgrade(&self.registry),
            id,
        }
    }

    /// Signal memory pressure to every live subscriber.
    pub fn notify(&self) {
        let subscribers = self.registry.subscribers.lock();
        for (_, callback) in subscribers.iter() {
            callback();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.subscribers.lock().len()
    }
}

impl Default for MemoryPressureSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle tying a subscription to its owner's lifetime. `stop` (or drop)
/// removes the callback from the source.
pub struct MemoryPressureSubscription {
    registry: Weak<Registry>,
    id: u64,
}

impl MemoryPressureSubscription {
    /// Unregister the callback. Safe to call if the source is already gone.
    pub fn stop(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.subscribers.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

impl Drop for MemoryPressureSubscription {
    fn drop(&mut self) {
        self.stop();
    }
}
