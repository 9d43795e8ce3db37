//! Tracing initialization with configurable logging formats.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Console log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    /// Single-line, human-readable.
    #[default]
    Compact,
    /// Multi-line with field breakdown, for local debugging.
    Pretty,
    /// One JSON object per line, for log shippers.
    Json,
}

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` takes precedence over `default_level`; noisy HTTP internals
/// are quieted unless explicitly re-enabled.
pub fn init_tracing(format: LogFormat, default_level: &str) {
    let filter = build_env_filter(default_level);

    match format {
        LogFormat::Compact => {
            let fmt_layer = tracing_subscriber::fmt::layer().compact().with_target(true);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .init();
        }
        LogFormat::Pretty => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .pretty()
                .with_target(true)
                .with_thread_ids(false);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .init();
        }
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer().json();
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .init();
        }
    }
}

/// Build the environment filter, preferring `RUST_LOG` when set.
fn build_env_filter(default_level: &str) -> EnvFilter {
    if let Ok(env_filter) = std::env::var("RUST_LOG") {
        EnvFilter::try_new(env_filter).unwrap_or_else(|_| EnvFilter::new(default_level))
    } else {
        EnvFilter::new(format!(
            "{},hyper=warn,h2=warn,reqwest=warn",
            default_level
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_env_filter_default_quiets_http_internals() {
        temp_env::with_var_unset("RUST_LOG", || {
            let filter = build_env_filter("info");
            assert!(filter.to_string().contains("hyper=warn"));
        });
    }

    #[test]
    fn test_build_env_filter_rust_log_wins() {
        temp_env::with_var("RUST_LOG", Some("debug,confsweep=trace"), || {
            // Directive order is normalized on render, so check containment
            let rendered = build_env_filter("info").to_string();
            assert!(rendered.contains("confsweep=trace"));
            assert!(rendered.contains("debug"));
            assert!(!rendered.contains("info"));
        });
    }
}
