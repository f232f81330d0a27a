//! Window/tab visibility source.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 16;

/// Shared, cloneable focus flag with transition events.
///
/// Works like [`OnlineManager`](crate::OnlineManager): the embedding UI reports
/// focus changes and bound queries refetch stale data when focus is regained.
#[derive(Debug, Clone)]
pub struct FocusManager {
    focused: Arc<AtomicBool>,
    sender: broadcast::Sender<bool>,
}

impl FocusManager {
    #[must_use]
    pub fn new(focused: bool) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            focused: Arc::new(AtomicBool::new(focused)),
            sender,
        }
    }

    #[must_use]
    pub fn is_focused(&self) -> bool {
        self.focused.load(Ordering::SeqCst)
    }

    /// Updates focus, firing an event only when the value changes.
    pub fn set_focused(&self, focused: bool) -> bool {
        let previous = self.focused.swap(focused, Ordering::SeqCst);
        if previous == focused {
            return false;
        }
        tracing::trace!(focused, "focus changed");
        let _ = self.sender.send(focused);
        true
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<bool> {
        self.sender.subscribe()
    }
}

impl Default for FocusManager {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_focus_transitions() {
        let focus = FocusManager::default();
        let mut rx = focus.subscribe();

        assert!(focus.is_focused());
        assert!(focus.set_focused(false));
        assert!(!focus.set_focused(false));
        assert!(focus.set_focused(true));

        assert_eq!(rx.try_recv(), Ok(false));
        assert_eq!(rx.try_recv(), Ok(true));
    }
}
