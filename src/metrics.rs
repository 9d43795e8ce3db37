//! Conference metrics aggregation with a short-lived cache.
//!
//! Building a snapshot hits the telephony API once per active conference
//! plus once for the listing, so results are cached for a TTL and dashboard
//! polling does not translate into API traffic. A manual cleanup invalidates
//! the cache so the next read reflects the new state.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::{
    calllog::CallLogStore,
    sweeper::{self, Classification, CleanupStats},
    telephony::TelephonyClient,
};

/// How long a computed snapshot stays fresh.
pub const METRICS_CACHE_TTL: Duration = Duration::from_secs(60);

/// The conference that has been running the longest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LongestRunning {
    pub conference_sid: String,
    pub friendly_name: String,
    pub running_secs: i64,
}

/// Point-in-time conference metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Conferences currently in progress.
    pub active_count: u64,
    /// Conference-linked calls completed since UTC midnight.
    pub total_today: u64,
    /// Average duration of today's completed calls, in seconds.
    pub average_duration_secs: f64,
    /// Longest-running active conference, if any reports a start time.
    pub longest_running: Option<LongestRunning>,
    /// Active conferences that would be cleaned by the next sweep.
    pub stale_count: u64,
    /// Cumulative cleanup statistics at snapshot time.
    pub stats: CleanupStats,
    /// When this snapshot was computed.
    pub computed_at: DateTime<Utc>,
}

impl MetricsSnapshot {
    /// Snapshot with every gauge zeroed, returned when aggregation fails.
    /// The cleanup stats are kept since they are tracked locally.
    fn zeroed(stats: CleanupStats) -> Self {
        Self {
            active_count: 0,
            total_today: 0,
            average_duration_secs: 0.0,
            longest_running: None,
            stale_count: 0,
            stats,
            computed_at: Utc::now(),
        }
    }
}

struct CacheEntry {
    computed: Instant,
    snapshot: MetricsSnapshot,
}

/// Computes and caches [`MetricsSnapshot`]s.
pub struct MetricsAggregator {
    telephony: Arc<dyn TelephonyClient>,
    call_logs: Arc<dyn CallLogStore>,
    ttl: Duration,
    cache: Mutex<Option<CacheEntry>>,
}

impl MetricsAggregator {
    pub fn new(telephony: Arc<dyn TelephonyClient>, call_logs: Arc<dyn CallLogStore>) -> Self {
        Self::with_ttl(telephony, call_logs, METRICS_CACHE_TTL)
    }

    pub fn with_ttl(
        telephony: Arc<dyn TelephonyClient>,
        call_logs: Arc<dyn CallLogStore>,
        ttl: Duration,
    ) -> Self {
        Self {
            telephony,
            call_logs,
            ttl,
            cache: Mutex::new(None),
        }
    }

    /// Get the current metrics snapshot, recomputing if the cache expired.
    ///
    /// `stale_timeout` drives the read-only staleness classification and
    /// `stats` is the caller's cumulative cleanup state, embedded as-is. A
    /// failed recompute returns a zeroed snapshot and is never cached, so
    /// the next read retries.
    pub async fn snapshot(
        &self,
        stale_timeout: chrono::Duration,
        stats: CleanupStats,
    ) -> MetricsSnapshot {
        let mut cache = self.cache.lock().await;
        if let Some(entry) = cache.as_ref() {
            if entry.computed.elapsed() < self.ttl {
                return entry.snapshot.clone();
            }
        }

        match self.compute(stale_timeout, stats).await {
            Ok(snapshot) => {
                *cache = Some(CacheEntry {
                    computed: Instant::now(),
                    snapshot: snapshot.clone(),
                });
                snapshot
            }
            Err(e) => {
                tracing::warn!(error = %e, "Metrics aggregation failed, returning zeroed snapshot");
                *cache = None;
                MetricsSnapshot::zeroed(stats)
            }
        }
    }

    /// Drop the cached snapshot so the next read recomputes.
    pub async fn invalidate(&self) {
        *self.cache.lock().await = None;
    }

    async fn compute(
        &self,
        stale_timeout: chrono::Duration,
        stats: CleanupStats,
    ) -> Result<MetricsSnapshot, crate::BoxError> {
        let now = Utc::now();
        let conferences = self.telephony.list_active_conferences().await?;

        let longest_running = conferences
            .iter()
            .filter_map(|c| c.date_created.map(|created| (c, created)))
            .min_by_key(|(_, created)| *created)
            .map(|(c, created)| LongestRunning {
                conference_sid: c.sid.clone(),
                friendly_name: c.friendly_name.clone(),
                running_secs: (now - created).num_seconds().max(0),
            });

        // Read-only staleness check: same classification the sweep uses,
        // without terminating anything.
        let stale_cutoff = now - stale_timeout;
        let mut stale_count = 0u64;
        for conference in &conferences {
            let records = self
                .call_logs
                .find_by_conference_name(&conference.friendly_name)
                .await?;
            if sweeper::classify(&records, stale_cutoff) != Classification::Healthy {
                stale_count += 1;
            }
        }

        let midnight = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .unwrap_or_default()
            .and_utc();
        let today = self.call_logs.aggregate_completed_since(midnight).await?;

        Ok(MetricsSnapshot {
            active_count: conferences.len() as u64,
            total_today: today.completed_count,
            average_duration_secs: today.average_duration_secs,
            longest_running,
            stale_count,
            stats,
            computed_at: now,
        })
    }
}
