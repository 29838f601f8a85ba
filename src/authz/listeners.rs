use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;

use super::store::StoreStatus;

/// A status change reported to every registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreTransition {
    pub from: StoreStatus,
    pub to: StoreStatus,
    pub version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback = Arc<dyn Fn(&StoreTransition) + Send + Sync>;

/// Observer list. Callbacks run outside the lock on a copy of the list, so
/// they may register or remove listeners (themselves included) while being
/// notified.
#[derive(Default)]
pub(crate) struct ListenerRegistry {
    next_id: AtomicU64,
    entries: Mutex<Vec<(ListenerId, Callback)>>,
}

impl ListenerRegistry {
    pub(crate) fn add(&self, callback: Callback) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().push((id, callback));
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub(crate) fn notify(&self, transition: &StoreTransition) {
        let snapshot: Vec<(ListenerId, Callback)> = self.entries.lock().clone();
        for (id, callback) in snapshot {
            // skip anything removed by an earlier callback in this round
            let still_registered = self.entries.lock().iter().any(|(entry_id, _)| *entry_id == id);
            if still_registered {
                callback(transition);
            }
        }
    }
}

/// Subscription handle returned by `PermissionStore::add_change_listener`.
///
/// Dropping the guard unregisters the listener.
#[must_use = "dropping the guard immediately unregisters the listener"]
pub struct ListenerGuard {
    id: ListenerId,
    registry: Weak<ListenerRegistry>,
}

impl ListenerGuard {
    pub(crate) fn new(id: ListenerId, registry: Weak<ListenerRegistry>) -> Self {
        Self { id, registry }
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Keeps the listener registered until `remove_change_listener` is
    /// called with the returned id.
    pub fn detach(self) -> ListenerId {
        let id = self.id;
        std::mem::forget(self);
        id
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

impl std::fmt::Debug for ListenerGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerGuard").field("id", &self.id).finish()
    }
}
