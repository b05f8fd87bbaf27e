//! Event types for the strata event system
//!
//! Provides the archive event definitions and the EventBus used to fan them
//! out to asynchronous observers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Archive event types
///
/// Events are broadcast via EventBus and serialize with a `type` tag so they
/// can be logged or forwarded as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ArchiveEvent {
    /// An object was committed with its primary Location
    ///
    /// Triggers:
    /// - Archiving Rule Engine: schedule replication/move tasks
    ObjectStored {
        /// Series the instance belongs to
        series_uid: String,
        /// Stored SOP instance
        sop_instance_uid: String,
        /// Calling AE title of the sender
        source_aet: String,
        /// Storage group holding the primary Location
        group_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A store operation was rejected and rolled back
    StoreRejected {
        /// SOP instance UID, if parsing got that far
        sop_instance_uid: Option<String>,
        source_aet: String,
        /// Coarse error category (rejected object, identity conflict, storage failure)
        category: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A new archiving task was created
    ArchivingTaskScheduled {
        task_id: i64,
        series_uid: String,
        group_id: String,
        earliest_eligible_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },

    /// An archiving task completed and its Locations are committed
    ArchivingTaskFinished {
        task_id: i64,
        /// Target storage group
        group_id: String,
        series_uid: String,
        /// Number of instances copied or moved
        instances: u64,
        timestamp: DateTime<Utc>,
    },

    /// An archiving task exhausted its retries
    ArchivingTaskFailed {
        task_id: i64,
        group_id: String,
        series_uid: String,
        retries: u32,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl ArchiveEvent {
    /// Event type name, matching the serialized `type` tag
    pub fn event_type(&self) -> &str {
        match self {
            ArchiveEvent::ObjectStored { .. } => "ObjectStored",
            ArchiveEvent::StoreRejected { .. } => "StoreRejected",
            ArchiveEvent::ArchivingTaskScheduled { .. } => "ArchivingTaskScheduled",
            ArchiveEvent::ArchivingTaskFinished { .. } => "ArchivingTaskFinished",
            ArchiveEvent::ArchivingTaskFailed { .. } => "ArchivingTaskFailed",
        }
    }
}

/// Central event distribution bus
///
/// Thin wrapper around `tokio::sync::broadcast`: every subscriber sees every
/// event emitted after it subscribed. Slow subscribers that fall more than
/// `capacity` events behind observe `RecvError::Lagged` and lose the oldest
/// events, so components that must never miss a signal are wired directly
/// rather than through the bus.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ArchiveEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// # Examples
    ///
    /// ```
    /// use strata_common::events::EventBus;
    ///
    /// let event_bus = EventBus::new(1000);
    /// assert_eq!(event_bus.capacity(), 1000);
    /// ```
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<ArchiveEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists,
    /// `Err` if nobody is listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: ArchiveEvent,
    ) -> Result<usize, broadcast::error::SendError<ArchiveEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: ArchiveEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
