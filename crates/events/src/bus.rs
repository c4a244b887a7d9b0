//! In-process notice bus backed by a `tokio::sync::broadcast` channel.
//!
//! Shared as `Arc<EventBus>`; the orchestrator publishes through the
//! [`Notifier`] impl and any number of views subscribe.

use tokio::sync::broadcast;

use crate::notice::{Notice, Notifier};

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 256;

pub struct EventBus {
    sender: broadcast::Sender<Notice>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full the oldest unread notices are dropped and
    /// slow receivers observe `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish to all current subscribers. Dropped when nobody listens.
    pub fn publish(&self, notice: Notice) {
        let _ = self.sender.send(notice);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Notifier for EventBus {
    fn notify(&self, notice: Notice) {
        tracing::debug!(severity = %notice.severity, message = %notice.message, "Publishing notice");
        self.publish(notice);
    }
}
