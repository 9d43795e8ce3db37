//! Scheduler facade: lifecycle, periodic jobs, and admin operations.
//!
//! [`ConferenceCleanupScheduler`] owns the sweeper, the per-conference
//! timeout timers, and the metrics aggregator, and runs two periodic jobs
//! while started: the stale sweep and the metrics aggregation. The admin
//! surface (HTTP layer, CLI) talks to this type only.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::{task::JoinHandle, time::MissedTickBehavior};

use crate::{
    calllog::CallLogStore,
    config::{CleanupConfig, ConfigProvider},
    events::{EventBus, SchedulerEvent},
    metrics::{MetricsAggregator, MetricsSnapshot},
    sweeper::{CleanupRunResult, CleanupStats, StaleSweeper, SweepError},
    telephony::{Conference, TelephonyClient, TelephonyError},
    timers::{ScheduledTimeout, TimeoutScheduler},
};

struct JobHandles {
    sweep: JoinHandle<()>,
    metrics: JoinHandle<()>,
}

/// Background scheduler for conference cleanup.
pub struct ConferenceCleanupScheduler {
    config: ConfigProvider,
    telephony: Arc<dyn TelephonyClient>,
    sweeper: Arc<StaleSweeper>,
    timeouts: Arc<TimeoutScheduler>,
    metrics: Arc<MetricsAggregator>,
    events: EventBus,
    jobs: Mutex<Option<JobHandles>>,
}

impl ConferenceCleanupScheduler {
    pub fn new(
        config: ConfigProvider,
        telephony: Arc<dyn TelephonyClient>,
        call_logs: Arc<dyn CallLogStore>,
    ) -> Self {
        let events = EventBus::new();
        let sweeper = Arc::new(StaleSweeper::new(
            Arc::clone(&telephony),
            Arc::clone(&call_logs),
            events.clone(),
        ));
        let timeouts = Arc::new(TimeoutScheduler::new(Arc::clone(&telephony), events.clone()));
        let metrics = Arc::new(MetricsAggregator::new(
            Arc::clone(&telephony),
            Arc::clone(&call_logs),
        ));
        Self {
            config,
            telephony,
            sweeper,
            timeouts,
            metrics,
            events,
            jobs: Mutex::new(None),
        }
    }

    /// Start the periodic jobs.
    ///
    /// Returns `false` without side effects if the scheduler is already
    /// running or cleanup is disabled in the configuration.
    pub async fn start(&self) -> bool {
        if self.is_running() {
            tracing::debug!("Scheduler already running, ignoring start");
            return false;
        }

        let config = self.config.resolve().await;
        if !config.enabled {
            tracing::info!("Conference cleanup disabled, not starting scheduler");
            return false;
        }
        if !self.telephony.is_configured() {
            tracing::warn!(
                "Telephony credentials not configured, cleanup operations will be no-ops"
            );
        }

        let sweep = self.spawn_sweep_job(&config);
        let metrics = self.spawn_metrics_job(&config);

        {
            let mut jobs = self.jobs.lock().expect("job handle mutex poisoned");
            // A concurrent start could have won the race; last one wins and
            // the loser's jobs are aborted.
            if let Some(previous) = jobs.replace(JobHandles { sweep, metrics }) {
                previous.sweep.abort();
                previous.metrics.abort();
            }
        }

        tracing::info!(
            cleanup_interval_minutes = config.cleanup_interval_minutes,
            metrics_interval_minutes = config.metrics_interval_minutes,
            stale_timeout_minutes = config.stale_timeout_minutes,
            max_duration_hours = config.max_duration_hours,
            "Conference cleanup scheduler started"
        );
        self.events.publish(SchedulerEvent::Started {
            timestamp: Utc::now(),
        });
        true
    }

    /// Stop the periodic jobs and cancel all outstanding timers.
    ///
    /// Idempotent: stopping a stopped scheduler returns `false`.
    pub async fn stop(&self) -> bool {
        let handles = self.jobs.lock().expect("job handle mutex poisoned").take();
        let Some(handles) = handles else {
            return false;
        };

        handles.sweep.abort();
        handles.metrics.abort();
        let cancelled = self.timeouts.cancel_all();
        self.metrics.invalidate().await;

        tracing::info!(
            cancelled_timers = cancelled,
            "Conference cleanup scheduler stopped"
        );
        self.events.publish(SchedulerEvent::Stopped {
            timestamp: Utc::now(),
        });
        true
    }

    /// Restart the periodic jobs with freshly resolved configuration.
    ///
    /// Picks up cadence changes on a running scheduler and starts a stopped
    /// one whose settings now enable cleanup; `start` still declines if the
    /// configuration resolves to disabled.
    pub async fn reload(&self) {
        self.stop().await;
        self.start().await;
    }

    /// Whether the periodic jobs are currently armed.
    pub fn is_running(&self) -> bool {
        self.jobs
            .lock()
            .expect("job handle mutex poisoned")
            .is_some()
    }

    /// Subscribe to scheduler events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    /// Run a cleanup pass right now, outside the periodic cadence.
    ///
    /// With `target` set, terminates that one conference directly. The
    /// metrics cache is invalidated afterwards so the next snapshot reflects
    /// the new state.
    pub async fn run_cleanup_now(
        &self,
        target: Option<&str>,
    ) -> Result<CleanupRunResult, SweepError> {
        let config = self.config.resolve().await;
        let result = self.sweeper.run(target, config.stale_timeout()).await;
        self.metrics.invalidate().await;
        result
    }

    /// List conferences currently in progress.
    pub async fn list_active_conferences(&self) -> Result<Vec<Conference>, TelephonyError> {
        self.telephony.list_active_conferences().await
    }

    /// Current metrics snapshot (cached per the aggregator's TTL).
    pub async fn get_metrics(&self) -> MetricsSnapshot {
        let config = self.config.resolve().await;
        self.metrics
            .snapshot(config.stale_timeout(), self.sweeper.stats())
            .await
    }

    /// Cumulative cleanup statistics.
    pub fn stats(&self) -> CleanupStats {
        self.sweeper.stats()
    }

    /// Reset cumulative cleanup statistics.
    pub fn clear_stats(&self) {
        self.sweeper.clear_stats();
    }

    /// Currently resolved configuration.
    pub async fn current_config(&self) -> CleanupConfig {
        self.config.resolve().await
    }

    /// Configured max conference duration in hours.
    pub async fn max_duration_hours(&self) -> u64 {
        self.config.resolve().await.max_duration_hours
    }

    /// Arm the max-duration timer for a conference that just started.
    ///
    /// Re-arming an already scheduled conference replaces its timer.
    pub async fn schedule_max_duration_timeout(&self, conference_sid: &str) {
        let config = self.config.resolve().await;
        self.timeouts
            .schedule(conference_sid, config.max_duration());
    }

    /// Cancel the max-duration timer for a conference that ended normally.
    /// Returns `false` if none was armed.
    pub fn cancel_timeout(&self, conference_sid: &str) -> bool {
        self.timeouts.cancel(conference_sid)
    }

    /// Snapshot of armed max-duration timers.
    pub fn scheduled_timeouts(&self) -> Vec<ScheduledTimeout> {
        self.timeouts.scheduled()
    }

    fn spawn_sweep_job(&self, config: &CleanupConfig) -> JoinHandle<()> {
        let sweeper = Arc::clone(&self.sweeper);
        let provider = self.config.clone();
        let period = config.cleanup_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; consume it so the first
            // sweep happens one full interval after start.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let config = provider.resolve().await;
                if !config.enabled {
                    tracing::debug!("Cleanup disabled in settings, skipping scheduled sweep");
                    continue;
                }
                if let Err(e) = sweeper.run(None, config.stale_timeout()).await {
                    tracing::error!(error = %e, "Scheduled cleanup sweep failed");
                }
            }
        })
    }

    fn spawn_metrics_job(&self, config: &CleanupConfig) -> JoinHandle<()> {
        let metrics = Arc::clone(&self.metrics);
        let sweeper = Arc::clone(&self.sweeper);
        let provider = self.config.clone();
        let events = self.events.clone();
        let period = config.metrics_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let config = provider.resolve().await;
                let snapshot = metrics
                    .snapshot(config.stale_timeout(), sweeper.stats())
                    .await;
                tracing::debug!(
                    active = snapshot.active_count,
                    stale = snapshot.stale_count,
                    total_today = snapshot.total_today,
                    "Aggregated conference metrics"
                );
                events.publish(SchedulerEvent::MetricsAggregated {
                    snapshot,
                    timestamp: Utc::now(),
                });
            }
        })
    }
}

impl Drop for ConferenceCleanupScheduler {
    fn drop(&mut self) {
        if let Some(handles) = self.jobs.lock().expect("job handle mutex poisoned").take() {
            handles.sweep.abort();
            handles.metrics.abort();
        }
    }
}
