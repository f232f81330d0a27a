//! Network reachability source.
//!
//! [`OnlineManager`] holds the current online/offline flag and broadcasts every
//! transition to the query instances bound through a [`QueryClient`](crate::QueryClient).
//! Platform integrations (or tests) drive it with [`OnlineManager::set_online`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;

/// Capacity of the transition channel. Receivers that lag re-read [`OnlineManager::is_online`].
const CHANNEL_CAPACITY: usize = 16;

/// Shared, cloneable reachability flag with transition events.
///
/// # Example
///
/// ```
/// use freshen::OnlineManager;
///
/// let online = OnlineManager::new(true);
/// let mut rx = online.subscribe();
///
/// assert!(online.set_online(false));
/// assert!(!online.set_online(false)); // not a transition
/// assert_eq!(rx.try_recv(), Ok(false));
/// ```
#[derive(Debug, Clone)]
pub struct OnlineManager {
    online: Arc<AtomicBool>,
    sender: broadcast::Sender<bool>,
}

impl OnlineManager {
    /// Creates a manager with the given initial state.
    #[must_use]
    pub fn new(online: bool) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            online: Arc::new(AtomicBool::new(online)),
            sender,
        }
    }

    /// Returns the current reachability.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Updates reachability, firing an event only when the value changes.
    ///
    /// Returns `true` if this call was a transition.
    pub fn set_online(&self, online: bool) -> bool {
        let previous = self.online.swap(online, Ordering::SeqCst);
        if previous == online {
            return false;
        }
        tracing::debug!(online, "reachability changed");
        // No receivers is fine: nothing is bound yet.
        let _ = self.sender.send(online);
        true
    }

    /// Subscribes to transition events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<bool> {
        self.sender.subscribe()
    }
}

impl Default for OnlineManager {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_online() {
        assert!(OnlineManager::default().is_online());
    }

    #[test]
    fn test_only_transitions_are_broadcast() {
        let online = OnlineManager::new(true);
        let mut rx = online.subscribe();

        assert!(!online.set_online(true));
        assert!(online.set_online(false));
        assert!(online.set_online(true));

        assert_eq!(rx.try_recv(), Ok(false));
        assert_eq!(rx.try_recv(), Ok(true));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_clones_share_state() {
        let a = OnlineManager::new(true);
        let b = a.clone();
        b.set_online(false);
        assert!(!a.is_online());
    }
}
