//! Conference cleanup scheduler.
//!
//! `confsweep` watches live telephony conferences hosted by an external voice
//! provider, detects sessions that leaked past their business records, and
//! terminates them. It provides:
//!
//! - **Stale sweeper**: periodically cross-references active conferences
//!   against call-log records and terminates orphaned/stale sessions.
//! - **Per-conference timeouts**: one-shot timers that force-terminate a
//!   conference after a configured maximum duration.
//! - **Metrics aggregation**: a TTL-cached operational snapshot (active
//!   count, today's completed stats, longest-running, stale count).
//! - **Scheduler facade**: lifecycle (`start`/`stop`/`reload`), periodic
//!   jobs, and admin operations, with lifecycle/operational events published
//!   on a broadcast [`events::EventBus`].
//!
//! External collaborators (the telephony provider, the call-log store, and
//! the settings store) are consumed through traits so deployments wire their
//! own backends and tests substitute fakes.

pub mod calllog;
pub mod config;
pub mod events;
pub mod metrics;
pub mod observability;
pub mod scheduler;
pub mod sweeper;
pub mod telephony;
pub mod timers;

#[cfg(test)]
pub(crate) mod test_support;

/// Boxed error type used across collaborator trait boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
