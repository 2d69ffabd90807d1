//! The `Status` aggregate mirrored from the event bus

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use cake_common::events::{subscribe_with, EventBus, Level, StatusEvent};
use cake_common::Result;

/// Progress of one run as reported to remote callers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    /// The run has stopped, successfully or not
    pub complete: bool,
    /// The run stopped after every phase succeeded
    pub completed_successfully: bool,
    /// Rendered events, in publish order
    pub messages: Vec<String>,
}

/// Shared handle onto a [`Status`].
///
/// Created when progress reporting starts and dropped with the server; there
/// is no process-wide instance.
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    inner: Arc<RwLock<Status>>,
}

impl StatusBoard {
    /// Empty status
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current status
    pub fn snapshot(&self) -> Status {
        self.inner.read().clone()
    }

    /// Append one event's rendering
    pub fn record(&self, event: &StatusEvent) {
        self.inner.write().messages.push(event.to_string());
    }

    /// Mark the run as stopped
    pub fn finish(&self, success: bool) {
        let mut status = self.inner.write();
        status.complete = true;
        status.completed_successfully = success;
    }
}

/// Drain the bus into `board` and the log for the lifetime of the bus.
pub async fn mirror(bus: &dyn EventBus, board: StatusBoard) -> Result<JoinHandle<()>> {
    subscribe_with(bus, move |event| {
        match event.level {
            Level::Info => info!(kind = %event.kind, "{}", event.msg),
            Level::Warn => warn!(kind = %event.kind, "{}", event.msg),
            Level::Error => error!(kind = %event.kind, "{}", event.msg),
        }
        board.record(&event);
    })
    .await
}
