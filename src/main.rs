//! Conference cleanup service binary.
//!
//! Runs the cleanup scheduler as a long-lived daemon, or executes a single
//! admin operation (sweep, list, metrics) and exits. Telephony credentials
//! come from `TWILIO_ACCOUNT_SID` / `TWILIO_AUTH_TOKEN`; scheduler settings
//! come from an optional TOML file, environment variables, or defaults.

use std::{path::PathBuf, sync::Arc};

use clap::{Parser, Subcommand};

use confsweep::{
    BoxError,
    calllog::InMemoryCallLogStore,
    config::{ConfigProvider, FileSettingsStore, NullSettingsStore, SettingsStore, TwilioConfig},
    observability::{LogFormat, init_tracing},
    scheduler::ConferenceCleanupScheduler,
    telephony::TwilioConferenceClient,
};

#[derive(Parser)]
#[command(name = "confsweep", version, about = "Detects and terminates orphaned or stale telephony conferences")]
struct Cli {
    /// Path to a TOML settings file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until interrupted
    Run,
    /// Run one cleanup pass and exit
    Sweep {
        /// Terminate only this conference sid, skipping classification
        #[arg(long)]
        conference: Option<String>,
    },
    /// List conferences currently in progress
    List,
    /// Print the current metrics snapshot as JSON
    Metrics,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();
    init_tracing(cli.log_format, "info");

    let settings: Arc<dyn SettingsStore> = match &cli.config {
        Some(path) => Arc::new(FileSettingsStore::load(path)?),
        None => Arc::new(NullSettingsStore),
    };
    let telephony = Arc::new(TwilioConferenceClient::new(TwilioConfig::from_env())?);
    // The standalone binary has no CRM database wired, so every active
    // conference classifies as orphaned. Deployments embed the library and
    // provide their own store.
    let call_logs = Arc::new(InMemoryCallLogStore::new());

    let scheduler = Arc::new(ConferenceCleanupScheduler::new(
        ConfigProvider::new(settings),
        telephony,
        call_logs,
    ));

    match cli.command {
        Command::Run => run_daemon(scheduler).await,
        Command::Sweep { conference } => {
            let result = scheduler.run_cleanup_now(conference.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Command::List => {
            let conferences = scheduler.list_active_conferences().await?;
            println!("{}", serde_json::to_string_pretty(&conferences)?);
            Ok(())
        }
        Command::Metrics => {
            let snapshot = scheduler.get_metrics().await;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            Ok(())
        }
    }
}

/// Run the scheduler until ctrl-c, logging every published event.
async fn run_daemon(scheduler: Arc<ConferenceCleanupScheduler>) -> Result<(), BoxError> {
    let mut events = scheduler.subscribe();
    let event_logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => tracing::info!(event = %json, "Scheduler event"),
                    Err(e) => tracing::warn!(error = %e, "Failed to serialize scheduler event"),
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Event logger lagged behind");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    if !scheduler.start().await {
        tracing::info!("Scheduler did not start (disabled), exiting");
        event_logger.abort();
        return Ok(());
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    scheduler.stop().await;
    event_logger.abort();
    Ok(())
}
