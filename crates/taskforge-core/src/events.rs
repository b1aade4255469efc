//! Process-wide event bus.
//!
//! Best-effort, at-most-once fan-out over a bounded broadcast channel. A
//! subscriber that falls too far behind silently misses events rather than
//! slowing down publication; it learns about the gap from
//! `RecvError::Lagged` if it chooses to check.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use taskforge_db::models::{LogLevel, TaskStatus};

/// Default channel capacity: generous enough that a slow HTTP SSE
/// subscriber does not drop progress events under normal load.
pub const DEFAULT_CAPACITY: usize = 4096;

/// An event published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskEvent {
    /// Progress or step update from a running handler.
    Progress {
        task_id: Uuid,
        progress: i32,
        step: Option<String>,
        ts: DateTime<Utc>,
    },
    /// A status transition observed by the dispatcher or Façade.
    StatusChanged {
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        ts: DateTime<Utc>,
    },
    /// A log line emitted by a handler via the Progress Reporter.
    Log {
        task_id: Uuid,
        level: LogLevel,
        message: String,
        ts: DateTime<Utc>,
    },
    /// A policy decision, recorded regardless of outcome.
    PolicyAudit {
        actor: Uuid,
        task_type: String,
        outcome: PolicyOutcome,
        reason: Option<String>,
        ts: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyOutcome {
    Allowed,
    Denied,
}

/// A cloneable handle onto the shared broadcast channel.
///
/// Cloning an `EventBus` is cheap (it clones the underlying `Sender`); every
/// clone publishes to and can subscribe from the same set of receivers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TaskEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event. Returns the number of active subscribers that
    /// received it; `0` is not an error, it just means nobody is listening.
    pub fn publish(&self, event: TaskEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
