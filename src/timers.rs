//! Per-conference max-duration timers.
//!
//! One one-shot timer per conference, armed when the conference starts and
//! cancelled if it ends normally. When a timer fires it removes its own
//! handle *before* awaiting the terminate call, so a concurrent `cancel`
//! during termination is a no-op and an in-flight terminate is never cut
//! short by `cancel_all`.
//!
//! Scheduling is last-write-wins per conference sid: at most one live handle
//! per sid at any time.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    events::{EventBus, SchedulerEvent, TerminationReason},
    telephony::TelephonyClient,
};

/// A scheduled forced-timeout, as reported to admin tooling.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduledTimeout {
    pub conference_sid: String,
    pub scheduled_at: DateTime<Utc>,
}

struct TimerEntry {
    scheduled_at: DateTime<Utc>,
    handle: tokio::task::JoinHandle<()>,
}

/// Arms and cancels per-conference termination timers.
pub struct TimeoutScheduler {
    telephony: Arc<dyn TelephonyClient>,
    events: EventBus,
    timers: Arc<Mutex<HashMap<String, TimerEntry>>>,
}

impl TimeoutScheduler {
    pub fn new(telephony: Arc<dyn TelephonyClient>, events: EventBus) -> Self {
        Self {
            telephony,
            events,
            timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Arm a one-shot timer that terminates the conference after `timeout`.
    ///
    /// Re-scheduling an already scheduled sid replaces the prior timer.
    pub fn schedule(&self, conference_sid: &str, timeout: Duration) {
        let mut timers = self.timers.lock().expect("timer map mutex poisoned");

        if let Some(previous) = timers.remove(conference_sid) {
            previous.handle.abort();
            tracing::debug!(
                conference_sid = conference_sid,
                "Replacing existing max-duration timer"
            );
        }

        let sid = conference_sid.to_string();
        let telephony = Arc::clone(&self.telephony);
        let events = self.events.clone();
        let map = Arc::clone(&self.timers);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;

            // Remove the handle before awaiting termination: a cancel that
            // races with the terminate call finds nothing to cancel.
            if map.lock().expect("timer map mutex poisoned").remove(&sid).is_none() {
                return;
            }

            match telephony.terminate_conference(&sid).await {
                Ok(()) => {
                    tracing::info!(
                        conference_sid = %sid,
                        "Conference exceeded max duration, terminated"
                    );
                    events.publish(SchedulerEvent::ConferenceTerminated {
                        conference_sid: sid,
                        reason: TerminationReason::MaxDuration,
                        timestamp: Utc::now(),
                    });
                }
                Err(e) => {
                    // Not retried here: the next sweep catches it.
                    tracing::error!(
                        conference_sid = %sid,
                        error = %e,
                        "Max-duration termination failed"
                    );
                    events.publish(SchedulerEvent::CleanupFailed {
                        conference_sid: Some(sid),
                        error: e.to_string(),
                        timestamp: Utc::now(),
                    });
                }
            }
        });

        tracing::debug!(
            conference_sid = conference_sid,
            timeout_secs = timeout.as_secs(),
            "Scheduled max-duration termination"
        );

        // The lock is held across the spawn and this insert, so the fired
        // task cannot observe the map before its own entry exists.
        timers.insert(
            conference_sid.to_string(),
            TimerEntry {
                scheduled_at: Utc::now(),
                handle,
            },
        );
    }

    /// Cancel a scheduled timer. Returns `false` if the sid had none.
    pub fn cancel(&self, conference_sid: &str) -> bool {
        let removed = self
            .timers
            .lock()
            .expect("timer map mutex poisoned")
            .remove(conference_sid);
        match removed {
            Some(entry) => {
                entry.handle.abort();
                tracing::debug!(
                    conference_sid = conference_sid,
                    "Cancelled max-duration timer"
                );
                true
            }
            None => false,
        }
    }

    /// Cancel every outstanding timer. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let entries: Vec<TimerEntry> = {
            let mut timers = self.timers.lock().expect("timer map mutex poisoned");
            timers.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &entries {
            entry.handle.abort();
        }
        if !entries.is_empty() {
            tracing::debug!(count = entries.len(), "Cancelled all max-duration timers");
        }
        entries.len()
    }

    /// Whether a timer is currently armed for the sid.
    pub fn is_scheduled(&self, conference_sid: &str) -> bool {
        self.timers
            .lock()
            .expect("timer map mutex poisoned")
            .contains_key(conference_sid)
    }

    /// Snapshot of all armed timers.
    pub fn scheduled(&self) -> Vec<ScheduledTimeout> {
        self.timers
            .lock()
            .expect("timer map mutex poisoned")
            .iter()
            .map(|(sid, entry)| ScheduledTimeout {
                conference_sid: sid.clone(),
                scheduled_at: entry.scheduled_at,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::test_support::FakeTelephonyClient;

    fn scheduler() -> (TimeoutScheduler, Arc<FakeTelephonyClient>, EventBus) {
        let telephony = Arc::new(FakeTelephonyClient::new());
        let events = EventBus::new();
        let scheduler = TimeoutScheduler::new(telephony.clone(), events.clone());
        (scheduler, telephony, events)
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_and_terminates() {
        let (scheduler, telephony, events) = scheduler();
        let mut rx = events.subscribe();

        scheduler.schedule("CF1", Duration::from_secs(60));
        assert!(scheduler.is_scheduled("CF1"));

        tokio::time::sleep(Duration::from_secs(61)).await;

        assert_eq!(telephony.terminated(), vec!["CF1".to_string()]);
        assert!(!scheduler.is_scheduled("CF1"));

        let event = rx.recv().await.unwrap();
        match event {
            SchedulerEvent::ConferenceTerminated {
                conference_sid,
                reason,
                ..
            } => {
                assert_eq!(conference_sid, "CF1");
                assert_eq!(reason, TerminationReason::MaxDuration);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_results_in_single_termination() {
        let (scheduler, telephony, _events) = scheduler();

        scheduler.schedule("CF1", Duration::from_secs(60));
        scheduler.schedule("CF1", Duration::from_secs(120));
        assert_eq!(scheduler.scheduled().len(), 1);

        // Past the first deadline: the replaced timer must not fire.
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert!(telephony.terminated().is_empty());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(telephony.terminated(), vec!["CF1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_fire_prevents_termination() {
        let (scheduler, telephony, _events) = scheduler();

        scheduler.schedule("CF1", Duration::from_secs(60));
        assert!(scheduler.cancel("CF1"));
        assert!(!scheduler.is_scheduled("CF1"));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(telephony.terminated().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_unscheduled_is_noop() {
        let (scheduler, _telephony, _events) = scheduler();
        assert!(!scheduler.cancel("CF404"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_suppresses_every_timer() {
        let (scheduler, telephony, _events) = scheduler();

        scheduler.schedule("CF1", Duration::from_secs(30));
        scheduler.schedule("CF2", Duration::from_secs(60));
        assert_eq!(scheduler.cancel_all(), 2);
        assert!(scheduler.scheduled().is_empty());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(telephony.terminated().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_termination_emits_cleanup_failed() {
        let (scheduler, telephony, events) = scheduler();
        let mut rx = events.subscribe();
        telephony.fail_termination_of("CF1");

        scheduler.schedule("CF1", Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(61)).await;

        let event = rx.recv().await.unwrap();
        match event {
            SchedulerEvent::CleanupFailed {
                conference_sid, ..
            } => assert_eq!(conference_sid.as_deref(), Some("CF1")),
            other => panic!("unexpected event: {other:?}"),
        }
        // Handle cleared even though the terminate call failed
        assert!(!scheduler.is_scheduled("CF1"));
    }
}
