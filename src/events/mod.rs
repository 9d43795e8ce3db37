//! Event broadcasting for scheduler lifecycle and cleanup outcomes.
//!
//! Services publish [`SchedulerEvent`]s on an [`EventBus`]; admin tooling and
//! notification hooks subscribe to drive dashboards and alerting. Events are
//! advisory: publishing never blocks and a bus with no subscribers simply
//! drops events.
//!
//! ```ignore
//! let mut rx = scheduler.subscribe();
//! while let Ok(event) = rx.recv().await {
//!     // forward to dashboard / notifier
//! }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::metrics::MetricsSnapshot;

/// Default channel capacity for the event bus. Slow receivers start lagging
/// once this many events are buffered.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Why a conference was terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// The sweep classified the conference as orphaned or stale.
    Stale,
    /// The per-conference max-duration timer fired.
    MaxDuration,
    /// An admin terminated it directly.
    Manual,
}

/// Events published by the cleanup scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    /// The scheduler started and its periodic jobs are armed.
    Started { timestamp: DateTime<Utc> },

    /// The scheduler stopped; all jobs and timers are cancelled.
    Stopped { timestamp: DateTime<Utc> },

    /// A conference was terminated by this service.
    ConferenceTerminated {
        conference_sid: String,
        reason: TerminationReason,
        timestamp: DateTime<Utc>,
    },

    /// A cleanup pass (sweep or manual) finished.
    CleanupCompleted {
        cleaned: u64,
        errors: u64,
        execution_time_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A cleanup attempt failed. `conference_sid` is set for per-conference
    /// failures and absent when a whole sweep aborted.
    CleanupFailed {
        conference_sid: Option<String>,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// A fresh metrics snapshot was aggregated.
    MetricsAggregated {
        snapshot: MetricsSnapshot,
        timestamp: DateTime<Utc>,
    },
}

impl SchedulerEvent {
    /// Get the event type name as a string.
    pub fn event_type(&self) -> &'static str {
        match self {
            SchedulerEvent::Started { .. } => "started",
            SchedulerEvent::Stopped { .. } => "stopped",
            SchedulerEvent::ConferenceTerminated { .. } => "conference_terminated",
            SchedulerEvent::CleanupCompleted { .. } => "cleanup_completed",
            SchedulerEvent::CleanupFailed { .. } => "cleanup_failed",
            SchedulerEvent::MetricsAggregated { .. } => "metrics_aggregated",
        }
    }
}

/// Broadcast bus for scheduler events.
///
/// Cloning shares the underlying channel; events are cloned per subscriber.
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<SchedulerEvent>,
    /// Counter for total events published (for diagnostics)
    events_published: AtomicU64,
    /// Counter for events dropped due to no subscribers
    events_dropped: AtomicU64,
}

impl EventBus {
    /// Create a new event bus with the default channel capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new event bus with a custom channel capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            events_published: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
        }
    }

    /// Publish an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event; 0 if the
    /// event was dropped for lack of subscribers.
    pub fn publish(&self, event: SchedulerEvent) -> usize {
        self.events_published.fetch_add(1, Ordering::Relaxed);

        match self.sender.send(event) {
            Ok(count) => count,
            Err(_) => {
                self.events_dropped.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    /// Subscribe to events from this bus.
    ///
    /// A receiver that falls behind gets `RecvError::Lagged` with the number
    /// of missed events.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.sender.subscribe()
    }

    /// Current number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Total number of events published.
    pub fn events_published(&self) -> u64 {
        self.events_published.load(Ordering::Relaxed)
    }

    /// Number of events dropped for lack of subscribers.
    pub fn events_dropped(&self) -> u64 {
        self.events_dropped.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        // Clone shares the same underlying broadcast channel
        Self {
            sender: self.sender.clone(),
            events_published: AtomicU64::new(self.events_published.load(Ordering::Relaxed)),
            events_dropped: AtomicU64::new(self.events_dropped.load(Ordering::Relaxed)),
        }
    }
}
