//! Call-log collaborator interface.
//!
//! The CRM web application owns the call log; this service only queries it to
//! correlate live conferences with business records, and stamps cleanup
//! metadata on records after a termination. The trait keeps the relational
//! store at arm's length so deployments wire their ORM-backed implementation
//! and tests use [`InMemoryCallLogStore`].

use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::BoxError;

/// Metadata key stamped on a record after its conference was cleaned up.
pub const META_CLEANUP_TERMINATED: &str = "cleanup_terminated";
/// Metadata key holding the cleanup timestamp (RFC 3339).
pub const META_CLEANUP_AT: &str = "cleanup_at";

/// A business call record, correlated to a conference by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    /// Tenant the record belongs to.
    pub tenant_id: String,
    /// Record id, unique within the tenant.
    pub record_id: String,
    /// Name of the conference this call joined, if any.
    pub conference_name: Option<String>,
    /// When the call ended. `None` means the call is still open.
    pub ended_at: Option<DateTime<Utc>>,
    /// Call duration in seconds, once the call has ended.
    pub duration_secs: Option<u64>,
    /// Free-form metadata map.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Aggregate over completed conference-linked calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CallAggregate {
    /// Number of completed calls.
    pub completed_count: u64,
    /// Average call duration in seconds (0 when there are none).
    pub average_duration_secs: f64,
}

/// Query/update access to the call log.
#[async_trait]
pub trait CallLogStore: Send + Sync {
    /// Find all records whose conference name matches.
    async fn find_by_conference_name(&self, name: &str) -> Result<Vec<CallRecord>, BoxError>;

    /// Merge `patch` into a record's metadata map and return the updated
    /// record.
    async fn update_metadata(
        &self,
        tenant_id: &str,
        record_id: &str,
        patch: HashMap<String, serde_json::Value>,
    ) -> Result<CallRecord, BoxError>;

    /// Count and average duration of conference-linked calls completed since
    /// `since`.
    async fn aggregate_completed_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<CallAggregate, BoxError>;
}

/// In-memory call-log store.
///
/// Backs the standalone binary when no CRM database is wired, and test
/// setups. Records are keyed by `(tenant_id, record_id)`.
#[derive(Debug, Default)]
pub struct InMemoryCallLogStore {
    records: Mutex<Vec<CallRecord>>,
}

impl InMemoryCallLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, replacing any existing one with the same ids.
    pub fn insert(&self, record: CallRecord) {
        let mut records = self.records.lock().expect("call log mutex poisoned");
        records.retain(|r| {
            !(r.tenant_id == record.tenant_id && r.record_id == record.record_id)
        });
        records.push(record);
    }

    /// Snapshot of every record, for assertions.
    pub fn all(&self) -> Vec<CallRecord> {
        self.records.lock().expect("call log mutex poisoned").clone()
    }
}

#[async_trait]
impl CallLogStore for InMemoryCallLogStore {
    async fn find_by_conference_name(&self, name: &str) -> Result<Vec<CallRecord>, BoxError> {
        let records = self.records.lock().expect("call log mutex poisoned");
        Ok(records
            .iter()
            .filter(|r| r.conference_name.as_deref() == Some(name))
            .cloned()
            .collect())
    }

    async fn update_metadata(
        &self,
        tenant_id: &str,
        record_id: &str,
        patch: HashMap<String, serde_json::Value>,
    ) -> Result<CallRecord, BoxError> {
        let mut records = self.records.lock().expect("call log mutex poisoned");
        let record = records
            .iter_mut()
            .find(|r| r.tenant_id == tenant_id && r.record_id == record_id)
            .ok_or_else(|| format!("call record not found: {tenant_id}/{record_id}"))?;
        record.metadata.extend(patch);
        Ok(record.clone())
    }

    async fn aggregate_completed_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<CallAggregate, BoxError> {
        let records = self.records.lock().expect("call log mutex poisoned");
        let completed: Vec<&CallRecord> = records
            .iter()
            .filter(|r| r.conference_name.is_some())
            .filter(|r| r.ended_at.is_some_and(|ended| ended >= since))
            .collect();

        if completed.is_empty() {
            return Ok(CallAggregate::default());
        }
        let total_secs: u64 = completed.iter().filter_map(|r| r.duration_secs).sum();
        Ok(CallAggregate {
            completed_count: completed.len() as u64,
            average_duration_secs: total_secs as f64 / completed.len() as f64,
        })
    }
}
