use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast;

/// Capacity of the change channel. A lagging stream just skips to the latest snapshot.
const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Callback invoked after any observable field of a query changed.
pub type Listener = Arc<dyn Fn() + Send + Sync>;

/// Handle returned by [`Query::subscribe`](crate::Query::subscribe).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Observer list of a query instance.
///
/// Notifications carry no payload: observers re-read the current state.
pub(crate) struct Listeners {
    next_id: AtomicU64,
    entries: Mutex<Vec<(ListenerId, Listener)>>,
    changes: broadcast::Sender<()>,
}

impl Listeners {
    pub(crate) fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            next_id: AtomicU64::new(0),
            entries: Mutex::new(Vec::new()),
            changes,
        }
    }

    pub(crate) fn subscribe(&self, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    /// Returns `true` if the listener was registered.
    pub(crate) fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    pub(crate) fn receiver(&self) -> broadcast::Receiver<()> {
        self.changes.subscribe()
    }

    /// Fans a change out to every callback and stream.
    pub(crate) fn notify(&self) {
        // Snapshot so callbacks may subscribe/unsubscribe without deadlocking.
        let listeners: Vec<Listener> = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener();
        }
        let _ = self.changes.send(());
    }

    pub(crate) fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
