//! Configuration for the cleanup scheduler.
//!
//! Values are resolved fresh on each access with the precedence
//! settings store -> environment variable -> hardcoded default, so admin
//! edits to the persisted settings take effect on the next `reload()`
//! without a process restart.

use std::{path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::BoxError;

/// Settings-store key under which the cleanup configuration is persisted.
pub const SETTINGS_KEY: &str = "conference_cleanup";

/// Environment variable names recognized as fallbacks for persisted settings.
pub const ENV_CLEANUP_ENABLED: &str = "CONFERENCE_CLEANUP_ENABLED";
pub const ENV_STALE_TIMEOUT: &str = "CONFERENCE_STALE_TIMEOUT";
pub const ENV_MAX_DURATION: &str = "CONFERENCE_MAX_DURATION";
pub const ENV_TWILIO_ACCOUNT_SID: &str = "TWILIO_ACCOUNT_SID";
pub const ENV_TWILIO_AUTH_TOKEN: &str = "TWILIO_AUTH_TOKEN";

/// Read access to the persisted settings store.
///
/// The web application owns the store; this service only reads it. A missing
/// key is not an error, it just falls through to the next configuration
/// layer.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Fetch the value stored under `key`, if any.
    async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>, BoxError>;
}

/// Settings store that never has any settings.
///
/// Used when no persisted store is wired; everything resolves from the
/// environment or defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSettingsStore;

#[async_trait]
impl SettingsStore for NullSettingsStore {
    async fn get_setting(&self, _key: &str) -> Result<Option<serde_json::Value>, BoxError> {
        Ok(None)
    }
}

/// Settings store backed by a TOML file.
///
/// Each top-level table in the file is one setting, keyed by the table name:
///
/// ```toml
/// [conference_cleanup]
/// enabled = true
/// stale_timeout_minutes = 45
/// ```
#[derive(Debug, Clone)]
pub struct FileSettingsStore {
    values: serde_json::Map<String, serde_json::Value>,
}

impl FileSettingsStore {
    /// Load settings from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, BoxError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let table: toml::Table = raw.parse()?;
        let values = match serde_json::to_value(table)? {
            serde_json::Value::Object(map) => map,
            _ => unreachable!("a TOML table serializes to a JSON object"),
        };
        Ok(Self { values })
    }
}

#[async_trait]
impl SettingsStore for FileSettingsStore {
    async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>, BoxError> {
        Ok(self.values.get(key).cloned())
    }
}

/// Resolved cleanup configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Whether the scheduler runs at all.
    pub enabled: bool,

    /// A conference is stale once every matching call record ended more than
    /// this many minutes ago.
    pub stale_timeout_minutes: u64,

    /// Maximum conference duration before a per-conference timer
    /// force-terminates it.
    pub max_duration_hours: u64,

    /// Cadence of the periodic stale sweep.
    pub cleanup_interval_minutes: u64,

    /// Cadence of the periodic metrics aggregation.
    pub metrics_interval_minutes: u64,

    /// Estimated-cost threshold (USD) above which cleanup outcomes are
    /// flagged in logs.
    pub cost_threshold_usd: f64,

    /// Whether cleanup outcomes should be surfaced to notification tooling
    /// subscribed to the event bus.
    pub notify_on_cleanup: bool,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stale_timeout_minutes: 30,
            max_duration_hours: 4,
            cleanup_interval_minutes: 15,
            metrics_interval_minutes: 60,
            cost_threshold_usd: 10.0,
            notify_on_cleanup: false,
        }
    }
}

impl CleanupConfig {
    /// Stale cutoff as a chrono duration, for comparing call record end
    /// timestamps.
    pub fn stale_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.stale_timeout_minutes as i64)
    }

    /// Max conference duration as a std duration, for arming timers.
    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_hours * 3600)
    }

    /// Sweep job cadence.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_minutes * 60)
    }

    /// Metrics job cadence.
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_minutes * 60)
    }
}

/// Partial configuration as persisted in the settings store.
///
/// Every field is optional so that a stored value only overrides the layers
/// below it for the fields it actually sets.
#[derive(Debug, Clone, Default, Deserialize)]
struct CleanupConfigPatch {
    enabled: Option<bool>,
    stale_timeout_minutes: Option<u64>,
    max_duration_hours: Option<u64>,
    cleanup_interval_minutes: Option<u64>,
    metrics_interval_minutes: Option<u64>,
    cost_threshold_usd: Option<f64>,
    notify_on_cleanup: Option<bool>,
}

/// Resolves the merged [`CleanupConfig`] on demand.
#[derive(Clone)]
pub struct ConfigProvider {
    store: Arc<dyn SettingsStore>,
}

impl ConfigProvider {
    pub fn new(store: Arc<dyn SettingsStore>) -> Self {
        Self { store }
    }

    /// Resolve the current configuration.
    ///
    /// Never fails: a broken settings store or malformed stored value is
    /// logged and treated as absent.
    pub async fn resolve(&self) -> CleanupConfig {
        let patch = match self.store.get_setting(SETTINGS_KEY).await {
            Ok(Some(value)) => match serde_json::from_value::<CleanupConfigPatch>(value) {
                Ok(patch) => patch,
                Err(e) => {
                    tracing::warn!(
                        key = SETTINGS_KEY,
                        error = %e,
                        "Ignoring malformed persisted cleanup settings"
                    );
                    CleanupConfigPatch::default()
                }
            },
            Ok(None) => CleanupConfigPatch::default(),
            Err(e) => {
                tracing::warn!(
                    key = SETTINGS_KEY,
                    error = %e,
                    "Settings store lookup failed, falling back to environment"
                );
                CleanupConfigPatch::default()
            }
        };

        let defaults = CleanupConfig::default();
        CleanupConfig {
            enabled: patch
                .enabled
                .or_else(|| env_parse(ENV_CLEANUP_ENABLED))
                .unwrap_or(defaults.enabled),
            stale_timeout_minutes: patch
                .stale_timeout_minutes
                .or_else(|| env_parse(ENV_STALE_TIMEOUT))
                .unwrap_or(defaults.stale_timeout_minutes),
            max_duration_hours: patch
                .max_duration_hours
                .or_else(|| env_parse(ENV_MAX_DURATION))
                .unwrap_or(defaults.max_duration_hours),
            cleanup_interval_minutes: patch
                .cleanup_interval_minutes
                .unwrap_or(defaults.cleanup_interval_minutes),
            metrics_interval_minutes: patch
                .metrics_interval_minutes
                .unwrap_or(defaults.metrics_interval_minutes),
            cost_threshold_usd: patch
                .cost_threshold_usd
                .unwrap_or(defaults.cost_threshold_usd),
            notify_on_cleanup: patch
                .notify_on_cleanup
                .unwrap_or(defaults.notify_on_cleanup),
        }
    }
}

/// Read and parse an environment variable, warning on parse failure.
fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "Ignoring unparseable environment variable");
            None
        }
    }
}

/// Telephony provider credentials and endpoint.
///
/// Credentials are optional: a deployment without telephony integration is
/// legitimate, and operations degrade to no-ops rather than failing.
#[derive(Debug, Clone)]
pub struct TwilioConfig {
    pub account_sid: Option<String>,
    pub auth_token: Option<String>,
    pub base_url: String,
}

impl Default for TwilioConfig {
    fn default() -> Self {
        Self {
            account_sid: None,
            auth_token: None,
            base_url: "https://api.twilio.com/2010-04-01".to_string(),
        }
    }
}

impl TwilioConfig {
    /// Build from `TWILIO_ACCOUNT_SID` / `TWILIO_AUTH_TOKEN`.
    pub fn from_env() -> Self {
        Self {
            account_sid: std::env::var(ENV_TWILIO_ACCOUNT_SID).ok().filter(|s| !s.is_empty()),
            auth_token: std::env::var(ENV_TWILIO_AUTH_TOKEN).ok().filter(|s| !s.is_empty()),
            ..Self::default()
        }
    }

    /// Whether both credentials are present.
    pub fn is_configured(&self) -> bool {
        self.credentials().is_some()
    }

    /// Account sid and auth token, if both are set.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.account_sid.as_deref(), self.auth_token.as_deref()) {
            (Some(sid), Some(token)) => Some((sid, token)),
            _ => None,
        }
    }
}

/// Retry behavior for telephony API requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Whether retries are enabled.
    pub enabled: bool,

    /// Maximum number of retry attempts (not including the initial request).
    pub max_retries: u32,

    /// Initial delay before the first retry in milliseconds.
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds.
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,

    /// Random jitter applied to delays (fraction of the delay, 0.0-1.0).
    pub jitter: f64,

    /// Status codes that should trigger a retry. Server errors only: client
    /// and auth errors surface immediately.
    pub retryable_status_codes: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 2,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter: 0.1,
            retryable_status_codes: vec![500, 502, 503, 504],
        }
    }
}

impl RetryConfig {
    /// Check if a status code should trigger a retry.
    pub fn should_retry_status(&self, status: u16) -> bool {
        self.enabled && self.retryable_status_codes.contains(&status)
    }

    /// Calculate the delay for a given retry attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay =
            (self.initial_delay_ms as f64) * self.backoff_multiplier.powi(attempt as i32);
        let capped_delay = base_delay.min(self.max_delay_ms as f64);

        let jitter_range = capped_delay * self.jitter;
        let jitter = if jitter_range > 0.0 {
            use rand::Rng;
            rand::thread_rng().gen_range(-jitter_range..jitter_range)
        } else {
            0.0
        };

        let final_delay = (capped_delay + jitter).max(0.0);
        Duration::from_millis(final_delay as u64)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn block_on<F: std::future::Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(fut)
    }

    #[test]
    fn test_cleanup_config_defaults() {
        let config = CleanupConfig::default();
        assert!(config.enabled);
        assert_eq!(config.stale_timeout_minutes, 30);
        assert_eq!(config.max_duration_hours, 4);
        assert_eq!(config.cleanup_interval_minutes, 15);
        assert_eq!(config.metrics_interval_minutes, 60);
        assert_eq!(config.cost_threshold_usd, 10.0);
        assert!(!config.notify_on_cleanup);
    }

    #[test]
    fn test_duration_helpers() {
        let config = CleanupConfig::default();
        assert_eq!(config.stale_timeout(), chrono::Duration::minutes(30));
        assert_eq!(config.max_duration(), Duration::from_secs(4 * 3600));
        assert_eq!(config.cleanup_interval(), Duration::from_secs(15 * 60));
        assert_eq!(config.metrics_interval(), Duration::from_secs(60 * 60));
    }

    #[test]
    fn test_resolve_defaults_when_everything_absent() {
        temp_env::with_vars_unset([ENV_CLEANUP_ENABLED, ENV_STALE_TIMEOUT, ENV_MAX_DURATION], || {
            let provider = ConfigProvider::new(Arc::new(NullSettingsStore));
            let config = block_on(provider.resolve());
            assert_eq!(config, CleanupConfig::default());
        });
    }

    #[test]
    fn test_resolve_env_fallback() {
        temp_env::with_vars(
            [
                (ENV_CLEANUP_ENABLED, Some("false")),
                (ENV_STALE_TIMEOUT, Some("45")),
                (ENV_MAX_DURATION, Some("8")),
            ],
            || {
                let provider = ConfigProvider::new(Arc::new(NullSettingsStore));
                let config = block_on(provider.resolve());
                assert!(!config.enabled);
                assert_eq!(config.stale_timeout_minutes, 45);
                assert_eq!(config.max_duration_hours, 8);
                // Not covered by env vars, stays at default
                assert_eq!(config.cleanup_interval_minutes, 15);
            },
        );
    }

    #[test]
    fn test_resolve_store_beats_env() {
        struct FixedStore(serde_json::Value);

        #[async_trait]
        impl SettingsStore for FixedStore {
            async fn get_setting(
                &self,
                key: &str,
            ) -> Result<Option<serde_json::Value>, BoxError> {
                assert_eq!(key, SETTINGS_KEY);
                Ok(Some(self.0.clone()))
            }
        }

        temp_env::with_vars([(ENV_STALE_TIMEOUT, Some("45"))], || {
            let store = FixedStore(serde_json::json!({
                "stale_timeout_minutes": 10,
                "notify_on_cleanup": true,
            }));
            let provider = ConfigProvider::new(Arc::new(store));
            let config = block_on(provider.resolve());
            assert_eq!(config.stale_timeout_minutes, 10);
            assert!(config.notify_on_cleanup);
        });
    }

    #[test]
    fn test_resolve_ignores_malformed_stored_settings() {
        struct BrokenStore;

        #[async_trait]
        impl SettingsStore for BrokenStore {
            async fn get_setting(
                &self,
                _key: &str,
            ) -> Result<Option<serde_json::Value>, BoxError> {
                Ok(Some(serde_json::json!({ "stale_timeout_minutes": "not a number" })))
            }
        }

        temp_env::with_vars_unset([ENV_CLEANUP_ENABLED, ENV_STALE_TIMEOUT, ENV_MAX_DURATION], || {
            let provider = ConfigProvider::new(Arc::new(BrokenStore));
            let config = block_on(provider.resolve());
            assert_eq!(config, CleanupConfig::default());
        });
    }

    #[test]
    fn test_file_settings_store() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[conference_cleanup]\nenabled = false\nstale_timeout_minutes = 20"
        )
        .unwrap();

        let store = FileSettingsStore::load(file.path()).unwrap();
        let value = block_on(store.get_setting(SETTINGS_KEY)).unwrap().unwrap();
        assert_eq!(value["enabled"], serde_json::json!(false));
        assert_eq!(value["stale_timeout_minutes"], serde_json::json!(20));

        let absent = block_on(store.get_setting("unrelated")).unwrap();
        assert!(absent.is_none());
    }

    #[test]
    fn test_twilio_config_credentials() {
        let unconfigured = TwilioConfig::default();
        assert!(!unconfigured.is_configured());

        let partial = TwilioConfig {
            account_sid: Some("AC123".into()),
            ..Default::default()
        };
        assert!(!partial.is_configured());

        let configured = TwilioConfig {
            account_sid: Some("AC123".into()),
            auth_token: Some("secret".into()),
            ..Default::default()
        };
        assert_eq!(configured.credentials(), Some(("AC123", "secret")));
    }

    #[test]
    fn test_should_retry_status() {
        let config = RetryConfig::default();
        assert!(config.should_retry_status(500));
        assert!(config.should_retry_status(502));
        assert!(config.should_retry_status(503));
        assert!(config.should_retry_status(504));

        // Client errors and auth failures are never retried
        assert!(!config.should_retry_status(400));
        assert!(!config.should_retry_status(401));
        assert!(!config.should_retry_status(404));
        assert!(!config.should_retry_status(200));
    }

    #[test]
    fn test_should_retry_status_disabled() {
        let config = RetryConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(!config.should_retry_status(500));
    }

    #[test]
    fn test_delay_for_attempt_doubles() {
        let config = RetryConfig {
            jitter: 0.0,
            ..Default::default()
        };
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(2000));
    }

    #[test]
    fn test_delay_for_attempt_capped() {
        let config = RetryConfig {
            jitter: 0.0,
            max_delay_ms: 1500,
            ..Default::default()
        };
        assert_eq!(config.delay_for_attempt(5), Duration::from_millis(1500));
    }
}
