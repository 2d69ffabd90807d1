//! Status events and the publish/subscribe bus that carries them.
//!
//! Every phase transition, warning and milestone of a run becomes exactly one
//! [`StatusEvent`]. Producers publish onto an [`EventBus`]; consumers (the
//! status mirror, log sinks, remote pollers) subscribe and observe events in
//! publish order.
//!
//! Unlike Kubernetes Events, publishing here is **not** fire-and-forget: a bus
//! that cannot be reached returns [`Error::Connectivity`](crate::Error) and the
//! run treats it as fatal.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[cfg(any(test, feature = "mock"))]
use mockall::automock;

use crate::Result;

mod local;
mod remote;

pub use local::LocalBus;
pub use remote::{BusServer, RemoteBus};

/// Standard event kinds
pub mod kinds {
    /// Ordinary forward progress
    pub const PROGRESS: &str = "progress";
    /// A phase boundary was crossed
    pub const CHECKPOINT: &str = "checkpoint";
}

/// Severity of a status event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// Informational
    Info,
    /// Something was suppressed or degraded but the run continues
    Warn,
    /// The run failed
    Error,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        };
        f.write_str(s)
    }
}

/// One unit of observable progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    /// Kind tag, e.g. "progress" or "checkpoint"
    #[serde(rename = "type")]
    pub kind: String,
    /// Human readable message
    pub msg: String,
    /// Severity
    pub level: Level,
}

impl StatusEvent {
    /// Build an event with an explicit kind and level
    pub fn new(kind: impl Into<String>, msg: impl Into<String>, level: Level) -> Self {
        Self {
            kind: kind.into(),
            msg: msg.into(),
            level,
        }
    }

    /// Informational progress event
    pub fn progress(msg: impl Into<String>) -> Self {
        Self::new(kinds::PROGRESS, msg, Level::Info)
    }

    /// Phase boundary event
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::new(kinds::CHECKPOINT, msg, Level::Info)
    }

    /// Warning-level progress event
    pub fn warning(msg: impl Into<String>) -> Self {
        Self::new(kinds::PROGRESS, msg, Level::Warn)
    }

    /// Failure event
    pub fn failure(msg: impl Into<String>) -> Self {
        Self::new(kinds::CHECKPOINT, msg, Level::Error)
    }
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type: {}, msg: {}, level: {}", self.kind, self.msg, self.level)
    }
}

/// Receiving half of a subscription.
///
/// Events arrive in the order they were published. `recv` returns `None` once
/// the bus (or the broker connection) has gone away.
#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<StatusEvent>,
}

impl EventReceiver {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<StatusEvent>) -> Self {
        Self { rx }
    }

    /// Receive the next event
    pub async fn recv(&mut self) -> Option<StatusEvent> {
        self.rx.recv().await
    }

    /// Receive an event if one is already queued
    pub fn try_recv(&mut self) -> Option<StatusEvent> {
        self.rx.try_recv().ok()
    }
}

/// Typed publish/subscribe transport for status events.
#[cfg_attr(any(test, feature = "mock"), automock)]
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event to every current subscriber
    async fn publish(&self, event: StatusEvent) -> Result<()>;

    /// Register a new subscriber
    async fn subscribe(&self) -> Result<EventReceiver>;
}

/// Subscribe and drive `callback` for every event on a background task.
///
/// The callback sees events in publish order. The task ends when the bus
/// closes the subscription.
pub async fn subscribe_with<F>(bus: &dyn EventBus, mut callback: F) -> Result<JoinHandle<()>>
where
    F: FnMut(StatusEvent) + Send + 'static,
{
    let mut receiver = bus.subscribe().await?;
    Ok(tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            callback(event);
        }
    }))
}
