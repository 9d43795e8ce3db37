//! Telephony provider client.
//!
//! Consumes the voice provider's REST API to list in-progress conferences
//! (following pagination to exhaustion) and to terminate a conference by sid.
//! Requests use HTTP basic auth and the bounded-backoff retry policy in
//! [`retry`].
//!
//! Missing credentials are a valid deployment state, not an error: listing
//! returns an empty set and termination is a logged no-op.

pub mod retry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{RetryConfig, TwilioConfig};

use self::retry::with_retry;

/// Client-side timeout for a single telephony API request.
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Error type for telephony API operations.
#[derive(Debug, thiserror::Error)]
pub enum TelephonyError {
    /// The API answered with a non-success status that was not (or no
    /// longer) retryable.
    #[error("telephony API returned {status} for {operation}")]
    Api { operation: &'static str, status: u16 },

    /// Transport-level failure after exhausting retries.
    #[error("telephony request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// A pagination URI from the API could not be resolved.
    #[error("invalid telephony URL: {0}")]
    Url(#[from] url::ParseError),
}

/// A live conference session as reported by the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conference {
    /// Opaque session identifier.
    pub sid: String,
    /// Human-readable name, used to correlate with call-log records.
    pub friendly_name: String,
    /// Provider-reported status, e.g. `in-progress`.
    pub status: String,
    /// When the conference was created.
    #[serde(default, with = "twilio_date")]
    pub date_created: Option<DateTime<Utc>>,
    /// Current participant count, when the provider reports one.
    #[serde(default)]
    pub participant_count: Option<u32>,
}

impl Conference {
    /// How long the conference has been running as of `now`.
    ///
    /// `None` when the provider did not report a creation timestamp.
    pub fn running_for(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.date_created.map(|created| now - created)
    }
}

/// (De)serializer for the provider's RFC 2822 timestamps
/// (`Mon, 02 Jan 2006 15:04:05 +0000`).
mod twilio_date {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(dt) => serializer.serialize_str(&dt.to_rfc2822()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw {
            Some(s) => DateTime::parse_from_rfc2822(&s)
                .map(|dt| Some(dt.with_timezone(&Utc)))
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// One page of the conference list endpoint.
#[derive(Debug, Deserialize)]
struct ConferencePage {
    conferences: Vec<Conference>,
    #[serde(default)]
    next_page_uri: Option<String>,
}

/// Access to the telephony provider's conference API.
#[async_trait]
pub trait TelephonyClient: Send + Sync {
    /// Whether provider credentials are configured.
    fn is_configured(&self) -> bool;

    /// Fetch all conferences currently in progress, across all pages.
    async fn list_active_conferences(&self) -> Result<Vec<Conference>, TelephonyError>;

    /// Transition a conference to its terminal status.
    async fn terminate_conference(&self, conference_sid: &str) -> Result<(), TelephonyError>;
}

/// Twilio-backed [`TelephonyClient`].
#[derive(Debug, Clone)]
pub struct TwilioConferenceClient {
    http: reqwest::Client,
    config: TwilioConfig,
    retry: RetryConfig,
}

impl TwilioConferenceClient {
    /// Create a client with the default retry configuration.
    pub fn new(config: TwilioConfig) -> Result<Self, TelephonyError> {
        Self::with_retry_config(config, RetryConfig::default())
    }

    /// Create a client with a custom retry configuration.
    pub fn with_retry_config(
        config: TwilioConfig,
        retry: RetryConfig,
    ) -> Result<Self, TelephonyError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { http, config, retry })
    }

    /// Resolve a pagination URI against the API origin.
    ///
    /// The provider returns root-relative URIs (`/2010-04-01/...`).
    fn absolute_url(&self, uri: &str) -> Result<String, TelephonyError> {
        if uri.starts_with("http://") || uri.starts_with("https://") {
            return Ok(uri.to_string());
        }
        let base = url::Url::parse(&self.config.base_url)?;
        Ok(base.join(uri)?.to_string())
    }
}

#[async_trait]
impl TelephonyClient for TwilioConferenceClient {
    fn is_configured(&self) -> bool {
        self.config.is_configured()
    }

    async fn list_active_conferences(&self) -> Result<Vec<Conference>, TelephonyError> {
        let Some((account_sid, auth_token)) = self.config.credentials() else {
            tracing::debug!("Telephony credentials not configured, reporting no conferences");
            return Ok(Vec::new());
        };

        let mut conferences = Vec::new();
        let mut next_url = Some(format!(
            "{}/Accounts/{}/Conferences.json?Status=in-progress",
            self.config.base_url, account_sid
        ));

        while let Some(url) = next_url {
            let response = with_retry(&self.retry, "list_conferences", || {
                self.http
                    .get(&url)
                    .basic_auth(account_sid, Some(auth_token))
                    .send()
            })
            .await?;

            let status = response.status();
            if !status.is_success() {
                return Err(TelephonyError::Api {
                    operation: "list_conferences",
                    status: status.as_u16(),
                });
            }

            let page: ConferencePage = response.json().await?;
            conferences.extend(page.conferences);

            next_url = match page.next_page_uri.filter(|uri| !uri.is_empty()) {
                Some(uri) => Some(self.absolute_url(&uri)?),
                None => None,
            };
        }

        tracing::debug!(count = conferences.len(), "Fetched active conferences");
        Ok(conferences)
    }

    async fn terminate_conference(&self, conference_sid: &str) -> Result<(), TelephonyError> {
        let Some((account_sid, auth_token)) = self.config.credentials() else {
            tracing::debug!(
                conference_sid = conference_sid,
                "Telephony credentials not configured, skipping termination"
            );
            return Ok(());
        };

        let url = format!(
            "{}/Accounts/{}/Conferences/{}.json",
            self.config.base_url, account_sid, conference_sid
        );

        let response = with_retry(&self.retry, "terminate_conference", || {
            self.http
                .post(&url)
                .basic_auth(account_sid, Some(auth_token))
                .form(&[("Status", "completed")])
                .send()
        })
        .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TelephonyError::Api {
                operation: "terminate_conference",
                status: status.as_u16(),
            });
        }

        tracing::info!(conference_sid = conference_sid, "Terminated conference");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{basic_auth, body_string, method, path, query_param, query_param_is_missing},
    };

    use super::*;

    fn client_for(server: &MockServer) -> TwilioConferenceClient {
        let config = TwilioConfig {
            account_sid: Some("AC123".to_string()),
            auth_token: Some("secret".to_string()),
            base_url: server.uri(),
        };
        let retry = RetryConfig {
            initial_delay_ms: 5,
            jitter: 0.0,
            ..Default::default()
        };
        TwilioConferenceClient::with_retry_config(config, retry).unwrap()
    }

    fn conference_json(sid: &str, name: &str) -> serde_json::Value {
        json!({
            "sid": sid,
            "friendly_name": name,
            "status": "in-progress",
            "date_created": "Sat, 22 Aug 2026 10:15:00 +0000",
        })
    }

    #[tokio::test]
    async fn test_list_follows_pagination() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/Accounts/AC123/Conferences.json"))
            .and(query_param("Status", "in-progress"))
            .and(query_param_is_missing("Page"))
            .and(basic_auth("AC123", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "conferences": [conference_json("CF1", "one")],
                "next_page_uri": "/Accounts/AC123/Conferences.json?Status=in-progress&Page=1",
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/Accounts/AC123/Conferences.json"))
            .and(query_param("Page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "conferences": [conference_json("CF2", "two")],
                "next_page_uri": null,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let conferences = client_for(&server).list_active_conferences().await.unwrap();
        assert_eq!(conferences.len(), 2);
        assert_eq!(conferences[0].sid, "CF1");
        assert_eq!(conferences[1].sid, "CF2");
        assert!(conferences[0].date_created.is_some());
    }

    #[tokio::test]
    async fn test_list_unconfigured_returns_empty() {
        let client = TwilioConferenceClient::new(TwilioConfig::default()).unwrap();
        assert!(!client.is_configured());
        let conferences = client.list_active_conferences().await.unwrap();
        assert!(conferences.is_empty());
    }

    #[tokio::test]
    async fn test_terminate_posts_completed_status() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/Accounts/AC123/Conferences/CF1.json"))
            .and(basic_auth("AC123", "secret"))
            .and(body_string("Status=completed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "sid": "CF1", "status": "completed",
            })))
            .expect(1)
            .mount(&server)
            .await;

        client_for(&server).terminate_conference("CF1").await.unwrap();
    }

    #[tokio::test]
    async fn test_terminate_retries_server_errors_then_succeeds() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/Accounts/AC123/Conferences/CF1.json"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/Accounts/AC123/Conferences/CF1.json"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        client_for(&server).terminate_conference("CF1").await.unwrap();
    }

    #[tokio::test]
    async fn test_terminate_not_found_fails_after_one_attempt() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/Accounts/AC123/Conferences/CFmissing.json"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let err = client_for(&server)
            .terminate_conference("CFmissing")
            .await
            .unwrap_err();
        match err {
            TelephonyError::Api { status, .. } => assert_eq!(status, 404),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_terminate_unconfigured_is_noop() {
        let client = TwilioConferenceClient::new(TwilioConfig::default()).unwrap();
        client.terminate_conference("CF1").await.unwrap();
    }

    #[test]
    fn test_conference_running_for() {
        let now = Utc::now();
        let conference = Conference {
            sid: "CF1".to_string(),
            friendly_name: "one".to_string(),
            status: "in-progress".to_string(),
            date_created: Some(now - chrono::Duration::minutes(90)),
            participant_count: None,
        };
        assert_eq!(
            conference.running_for(now),
            Some(chrono::Duration::minutes(90))
        );

        let unknown = Conference {
            date_created: None,
            ..conference
        };
        assert!(unknown.running_for(now).is_none());
    }

    #[test]
    fn test_twilio_date_round_trip() {
        let json = json!({
            "sid": "CF1",
            "friendly_name": "one",
            "status": "in-progress",
            "date_created": "Mon, 02 Jan 2006 15:04:05 +0000",
        });
        let conference: Conference = serde_json::from_value(json).unwrap();
        let created = conference.date_created.unwrap();
        assert_eq!(created.to_rfc2822(), "Mon, 2 Jan 2006 15:04:05 +0000");

        let missing: Conference = serde_json::from_value(json!({
            "sid": "CF2", "friendly_name": "two", "status": "in-progress",
        }))
        .unwrap();
        assert!(missing.date_created.is_none());
    }
}
