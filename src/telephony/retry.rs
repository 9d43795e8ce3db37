//! Retry logic with exponential backoff for telephony API requests.
//!
//! Handles transient failures (5xx responses, connection errors, timeouts).
//! Client errors and auth failures are never retried and surface immediately.

use std::future::Future;

use tracing::{debug, warn};

use crate::config::RetryConfig;

/// Determines if a reqwest error is retryable.
///
/// Connection errors, timeouts, and other transport-level issues are
/// retryable; so are responses that decoded into a server-error status.
pub fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_connect()
        || error.is_timeout()
        || error.is_request()
        || error
            .status()
            .map(|s| s.is_server_error())
            .unwrap_or(false)
}

/// Execute an HTTP request with retry logic.
///
/// `make_request` is called for each attempt. Returns the first successful
/// (or non-retryable) response, or the last error once retries are
/// exhausted.
pub async fn with_retry<F, Fut>(
    config: &RetryConfig,
    operation: &str,
    make_request: F,
) -> Result<reqwest::Response, reqwest::Error>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<reqwest::Response, reqwest::Error>>,
{
    if !config.enabled {
        return make_request().await;
    }

    let max_attempts = config.max_retries + 1; // +1 for initial attempt

    for attempt in 0..max_attempts {
        let result = make_request().await;

        match result {
            Ok(response) => {
                let status = response.status();

                if config.should_retry_status(status.as_u16()) && attempt < max_attempts - 1 {
                    let delay = config.delay_for_attempt(attempt);
                    warn!(
                        operation = operation,
                        status = %status,
                        attempt = attempt + 1,
                        max_attempts = max_attempts,
                        delay_ms = delay.as_millis(),
                        "Retryable status code, will retry after delay"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }

                if attempt > 0 {
                    debug!(
                        operation = operation,
                        status = %status,
                        attempt = attempt + 1,
                        "Request succeeded after retry"
                    );
                }

                return Ok(response);
            }
            Err(error) => {
                if is_retryable_error(&error) && attempt < max_attempts - 1 {
                    let delay = config.delay_for_attempt(attempt);
                    warn!(
                        operation = operation,
                        error = %error,
                        attempt = attempt + 1,
                        max_attempts = max_attempts,
                        delay_ms = delay.as_millis(),
                        "Retryable error, will retry after delay"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }

                if attempt > 0 {
                    warn!(
                        operation = operation,
                        error = %error,
                        attempts = attempt + 1,
                        "Request failed after all retry attempts"
                    );
                }

                return Err(error);
            }
        }
    }

    unreachable!("Retry loop should have returned")
}
