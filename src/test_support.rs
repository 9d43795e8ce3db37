//! Shared fakes for unit tests.

use std::{
    collections::HashSet,
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use chrono::Utc;

use crate::telephony::{Conference, TelephonyClient, TelephonyError};

/// Build an in-progress conference created 10 minutes ago.
pub(crate) fn conference(sid: &str, friendly_name: &str) -> Conference {
    Conference {
        sid: sid.to_string(),
        friendly_name: friendly_name.to_string(),
        status: "in-progress".to_string(),
        date_created: Some(Utc::now() - chrono::Duration::minutes(10)),
        participant_count: Some(2),
    }
}

/// In-memory telephony client that records terminations.
#[derive(Default)]
pub(crate) struct FakeTelephonyClient {
    conferences: Mutex<Vec<Conference>>,
    terminated: Mutex<Vec<String>>,
    failing_sids: Mutex<HashSet<String>>,
    fail_listing: AtomicBool,
    list_calls: AtomicUsize,
}

impl FakeTelephonyClient {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_conferences(conferences: Vec<Conference>) -> Self {
        Self {
            conferences: Mutex::new(conferences),
            ..Self::default()
        }
    }

    /// Make `terminate_conference` fail for the given sid.
    pub(crate) fn fail_termination_of(&self, sid: &str) {
        self.failing_sids.lock().unwrap().insert(sid.to_string());
    }

    /// Make `list_active_conferences` fail.
    pub(crate) fn fail_listing(&self) {
        self.fail_listing.store(true, Ordering::SeqCst);
    }

    pub(crate) fn terminated(&self) -> Vec<String> {
        self.terminated.lock().unwrap().clone()
    }

    pub(crate) fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TelephonyClient for FakeTelephonyClient {
    fn is_configured(&self) -> bool {
        true
    }

    async fn list_active_conferences(&self) -> Result<Vec<Conference>, TelephonyError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(TelephonyError::Api {
                operation: "list_conferences",
                status: 503,
            });
        }
        let terminated = self.terminated.lock().unwrap();
        Ok(self
            .conferences
            .lock()
            .unwrap()
            .iter()
            .filter(|c| !terminated.contains(&c.sid))
            .cloned()
            .collect())
    }

    async fn terminate_conference(&self, conference_sid: &str) -> Result<(), TelephonyError> {
        if self.failing_sids.lock().unwrap().contains(conference_sid) {
            return Err(TelephonyError::Api {
                operation: "terminate_conference",
                status: 500,
            });
        }
        self.terminated
            .lock()
            .unwrap()
            .push(conference_sid.to_string());
        Ok(())
    }
}
