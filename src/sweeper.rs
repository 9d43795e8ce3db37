//! Stale-conference sweeper.
//!
//! A sweep lists every in-progress conference, cross-references each against
//! call-log records by conference name, and terminates the ones that leaked:
//!
//! - **orphaned**: no matching call record at all. A conference without a
//!   business record is almost certainly a leak (e.g. a webhook that never
//!   completed).
//! - **stale**: every matching record ended longer ago than the stale
//!   timeout, yet the conference is still reported active.
//!
//! Conferences are processed sequentially so statistics updates and emitted
//! events are strictly ordered. Per-conference failures are isolated: one
//! bad record cannot block cleanup of the rest.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Instant,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    calllog::{CallLogStore, CallRecord, META_CLEANUP_AT, META_CLEANUP_TERMINATED},
    events::{EventBus, SchedulerEvent, TerminationReason},
    telephony::{Conference, TelephonyClient, TelephonyError},
};

/// Error type for sweep runs. Per-conference failures are captured in the
/// run result instead; only a whole-sweep abort surfaces here.
#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error("failed to list active conferences: {0}")]
    ListConferences(#[source] TelephonyError),
}

/// Cumulative cleanup statistics, reset only by process restart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupStats {
    /// When the last cleanup attempt (sweep or manual) finished.
    pub last_cleanup: Option<DateTime<Utc>>,
    /// Conferences terminated by cleanup since process start.
    pub total_cleaned: u64,
    /// Cleanup errors since process start.
    pub total_errors: u64,
}

/// How a conference was classified against its call-log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// No matching call record exists.
    Orphaned,
    /// Every matching record ended before the stale cutoff.
    Stale,
    /// At least one record is open or ended recently.
    Healthy,
}

/// Classify a conference by its matching call-log records.
///
/// `stale_cutoff` is the instant before which an ended record counts as
/// stale. A record with no end time keeps the conference healthy.
pub fn classify(records: &[CallRecord], stale_cutoff: DateTime<Utc>) -> Classification {
    if records.is_empty() {
        return Classification::Orphaned;
    }
    let all_stale = records
        .iter()
        .all(|r| r.ended_at.is_some_and(|ended| ended < stale_cutoff));
    if all_stale {
        Classification::Stale
    } else {
        Classification::Healthy
    }
}

/// Outcome of one conference within a cleanup run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepOutcome {
    Terminated,
    Skipped,
    Failed,
}

/// Per-conference detail of a cleanup run.
#[derive(Debug, Clone, Serialize)]
pub struct ConferenceDetail {
    pub conference_sid: String,
    pub friendly_name: String,
    /// Absent for manual single-conference runs, which bypass
    /// classification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,
    pub outcome: SweepOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Results from a single cleanup run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupRunResult {
    /// Conferences terminated in this run.
    pub cleaned: u64,
    /// Per-conference failures in this run.
    pub errors: u64,
    /// Conferences still active after the run.
    pub active_conferences: u64,
    /// Outcome per examined conference.
    pub details: Vec<ConferenceDetail>,
    /// Duration of the run in milliseconds.
    pub duration_ms: u64,
}

impl CleanupRunResult {
    /// Check if anything was terminated.
    pub fn has_cleanups(&self) -> bool {
        self.cleaned > 0
    }
}

/// Classifies and terminates orphaned/stale conferences.
pub struct StaleSweeper {
    telephony: Arc<dyn TelephonyClient>,
    call_logs: Arc<dyn CallLogStore>,
    events: EventBus,
    stats: Mutex<CleanupStats>,
}

impl StaleSweeper {
    pub fn new(
        telephony: Arc<dyn TelephonyClient>,
        call_logs: Arc<dyn CallLogStore>,
        events: EventBus,
    ) -> Self {
        Self {
            telephony,
            call_logs,
            events,
            stats: Mutex::new(CleanupStats::default()),
        }
    }

    /// Current cumulative statistics.
    pub fn stats(&self) -> CleanupStats {
        *self.stats.lock().expect("stats mutex poisoned")
    }

    /// Reset cumulative statistics.
    pub fn clear_stats(&self) {
        *self.stats.lock().expect("stats mutex poisoned") = CleanupStats::default();
    }

    /// Run a cleanup pass.
    ///
    /// With `target` set, terminates that one conference directly and skips
    /// classification (admin-triggered termination). Otherwise sweeps every
    /// active conference. Both paths update cumulative statistics and emit a
    /// `cleanup_completed` event; a sweep whose initial listing fails emits
    /// `cleanup_failed` and returns an error instead.
    pub async fn run(
        &self,
        target: Option<&str>,
        stale_timeout: chrono::Duration,
    ) -> Result<CleanupRunResult, SweepError> {
        let start = Instant::now();

        if let Some(conference_sid) = target {
            return Ok(self.run_single(conference_sid, start).await);
        }

        let conferences = match self.telephony.list_active_conferences().await {
            Ok(conferences) => conferences,
            Err(e) => {
                tracing::error!(error = %e, "Cleanup sweep aborted, could not list conferences");
                self.stats.lock().expect("stats mutex poisoned").total_errors += 1;
                self.events.publish(SchedulerEvent::CleanupFailed {
                    conference_sid: None,
                    error: e.to_string(),
                    timestamp: Utc::now(),
                });
                return Err(SweepError::ListConferences(e));
            }
        };

        let stale_cutoff = Utc::now() - stale_timeout;
        let mut result = CleanupRunResult {
            active_conferences: conferences.len() as u64,
            ..Default::default()
        };

        for conference in &conferences {
            self.sweep_one(conference, stale_cutoff, &mut result).await;
        }

        result.active_conferences -= result.cleaned;
        result.duration_ms = start.elapsed().as_millis() as u64;
        self.finish_run(&result);

        if result.has_cleanups() || result.errors > 0 {
            tracing::info!(
                cleaned = result.cleaned,
                errors = result.errors,
                active = result.active_conferences,
                duration_ms = result.duration_ms,
                "Cleanup sweep complete"
            );
        } else {
            tracing::debug!(
                active = result.active_conferences,
                "Cleanup sweep complete, nothing to clean up"
            );
        }

        Ok(result)
    }

    /// Examine one conference and terminate it if orphaned or stale.
    async fn sweep_one(
        &self,
        conference: &Conference,
        stale_cutoff: DateTime<Utc>,
        result: &mut CleanupRunResult,
    ) {
        let records = match self
            .call_logs
            .find_by_conference_name(&conference.friendly_name)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                tracing::error!(
                    conference_sid = %conference.sid,
                    error = %e,
                    "Call-log lookup failed, skipping conference"
                );
                result.errors += 1;
                result.details.push(ConferenceDetail {
                    conference_sid: conference.sid.clone(),
                    friendly_name: conference.friendly_name.clone(),
                    classification: None,
                    outcome: SweepOutcome::Failed,
                    error: Some(e.to_string()),
                });
                self.events.publish(SchedulerEvent::CleanupFailed {
                    conference_sid: Some(conference.sid.clone()),
                    error: e.to_string(),
                    timestamp: Utc::now(),
                });
                return;
            }
        };

        let classification = classify(&records, stale_cutoff);
        if classification == Classification::Healthy {
            result.details.push(ConferenceDetail {
                conference_sid: conference.sid.clone(),
                friendly_name: conference.friendly_name.clone(),
                classification: Some(classification),
                outcome: SweepOutcome::Skipped,
                error: None,
            });
            return;
        }

        tracing::info!(
            conference_sid = %conference.sid,
            friendly_name = %conference.friendly_name,
            classification = ?classification,
            record_count = records.len(),
            "Terminating unhealthy conference"
        );

        match self.telephony.terminate_conference(&conference.sid).await {
            Ok(()) => {
                self.stamp_cleanup(records.first()).await;
                result.cleaned += 1;
                result.details.push(ConferenceDetail {
                    conference_sid: conference.sid.clone(),
                    friendly_name: conference.friendly_name.clone(),
                    classification: Some(classification),
                    outcome: SweepOutcome::Terminated,
                    error: None,
                });
                self.events.publish(SchedulerEvent::ConferenceTerminated {
                    conference_sid: conference.sid.clone(),
                    reason: TerminationReason::Stale,
                    timestamp: Utc::now(),
                });
            }
            Err(e) => {
                tracing::error!(
                    conference_sid = %conference.sid,
                    error = %e,
                    "Termination failed, continuing sweep"
                );
                result.errors += 1;
                result.details.push(ConferenceDetail {
                    conference_sid: conference.sid.clone(),
                    friendly_name: conference.friendly_name.clone(),
                    classification: Some(classification),
                    outcome: SweepOutcome::Failed,
                    error: Some(e.to_string()),
                });
                self.events.publish(SchedulerEvent::CleanupFailed {
                    conference_sid: Some(conference.sid.clone()),
                    error: e.to_string(),
                    timestamp: Utc::now(),
                });
            }
        }
    }

    /// Stamp cleanup metadata on the first matching call record.
    ///
    /// Best effort: the conference is already terminated, so a failed stamp
    /// is only logged.
    async fn stamp_cleanup(&self, record: Option<&CallRecord>) {
        let Some(record) = record else { return };

        let patch = HashMap::from([
            (META_CLEANUP_TERMINATED.to_string(), serde_json::json!(true)),
            (
                META_CLEANUP_AT.to_string(),
                serde_json::json!(Utc::now().to_rfc3339()),
            ),
        ]);

        if let Err(e) = self
            .call_logs
            .update_metadata(&record.tenant_id, &record.record_id, patch)
            .await
        {
            tracing::warn!(
                tenant_id = %record.tenant_id,
                record_id = %record.record_id,
                error = %e,
                "Failed to stamp cleanup metadata on call record"
            );
        }
    }

    /// Manual admin-triggered termination of one conference.
    async fn run_single(&self, conference_sid: &str, start: Instant) -> CleanupRunResult {
        let mut result = CleanupRunResult::default();

        match self.telephony.terminate_conference(conference_sid).await {
            Ok(()) => {
                tracing::info!(
                    conference_sid = conference_sid,
                    "Manually terminated conference"
                );
                result.cleaned = 1;
                result.details.push(ConferenceDetail {
                    conference_sid: conference_sid.to_string(),
                    friendly_name: String::new(),
                    classification: None,
                    outcome: SweepOutcome::Terminated,
                    error: None,
                });
                self.events.publish(SchedulerEvent::ConferenceTerminated {
                    conference_sid: conference_sid.to_string(),
                    reason: TerminationReason::Manual,
                    timestamp: Utc::now(),
                });
            }
            Err(e) => {
                tracing::error!(
                    conference_sid = conference_sid,
                    error = %e,
                    "Manual termination failed"
                );
                result.errors = 1;
                result.details.push(ConferenceDetail {
                    conference_sid: conference_sid.to_string(),
                    friendly_name: String::new(),
                    classification: None,
                    outcome: SweepOutcome::Failed,
                    error: Some(e.to_string()),
                });
                self.events.publish(SchedulerEvent::CleanupFailed {
                    conference_sid: Some(conference_sid.to_string()),
                    error: e.to_string(),
                    timestamp: Utc::now(),
                });
            }
        }

        result.duration_ms = start.elapsed().as_millis() as u64;
        // Manual runs count as cleanup attempts for the cumulative stats,
        // same as full sweeps.
        self.finish_run(&result);
        result
    }

    /// Fold a finished run into the cumulative stats and announce it.
    fn finish_run(&self, result: &CleanupRunResult) {
        {
            let mut stats = self.stats.lock().expect("stats mutex poisoned");
            stats.last_cleanup = Some(Utc::now());
            stats.total_cleaned += result.cleaned;
            stats.total_errors += result.errors;
        }
        self.events.publish(SchedulerEvent::CleanupCompleted {
            cleaned: result.cleaned,
            errors: result.errors,
            execution_time_ms: result.duration_ms,
            timestamp: Utc::now(),
        });
    }
}
