//! In-process event bus

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use super::{EventBus, EventReceiver, StatusEvent};
use crate::Result;

/// Event bus delivering to subscribers within the same process.
///
/// Each subscriber owns an unbounded queue, so a slow consumer never causes
/// another subscriber to miss events. Clones share the same subscriber set.
#[derive(Debug, Clone, Default)]
pub struct LocalBus {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<StatusEvent>>>>,
}

impl LocalBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        let mut subs = self.subscribers.lock();
        subs.retain(|s| !s.is_closed());
        subs.len()
    }

    /// Deliver an event to all subscribers.
    ///
    /// The lock is held across the whole fan-out so concurrent publishers
    /// cannot interleave differently for different subscribers.
    pub(crate) fn fan_out(&self, event: StatusEvent) {
        let mut subs = self.subscribers.lock();
        subs.retain(|s| s.send(event.clone()).is_ok());
        trace!(receivers = subs.len(), kind = %event.kind, "event published");
    }

    pub(crate) fn register(&self) -> EventReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        EventReceiver::new(rx)
    }
}

#[async_trait]
impl EventBus for LocalBus {
    async fn publish(&self, event: StatusEvent) -> Result<()> {
        self.fan_out(event);
        Ok(())
    }

    async fn subscribe(&self) -> Result<EventReceiver> {
        Ok(self.register())
    }
}
