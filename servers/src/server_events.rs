//! # Event Consumer
//!
//! Long-running worker that drains the events subscription. The subscribe
//! loop runs until SIGINT/SIGTERM; when it stops on a broker error (for
//! example the subscription was deleted) it is rebuilt, re-provisioning the
//! subscription if auto-create is on, after a capped exponential backoff.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use lib_common::connections::retry::RetryPolicy;
use lib_common::loggers::{LoggerOptions, setup_logging};
use lib_common::messaging::{PubSubClient, PubSubConfig, ReceivedMessage};
use tokio::signal;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Consumes client events from the broker.")]
struct AppConfig {
    #[clap(long, env = "EVENTS_TOPIC", default_value = "client-events")]
    topic: String,

    #[clap(long, env = "EVENTS_SUBSCRIPTION", default_value = "client-events-worker")]
    subscription: String,

    #[clap(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[clap(long, env = "LOG_JSON", default_value_t = false)]
    log_json: bool,

    #[clap(long, env = "LOG_DIR")]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let app_config = AppConfig::parse();

    let _log_guard = setup_logging(&LoggerOptions {
        app_name: "server_events".to_string(),
        level: app_config.log_level.clone(),
        json: app_config.log_json,
        log_dir: app_config.log_dir.clone(),
        ..Default::default()
    })?;

    let pubsub_config = PubSubConfig::from_env();
    let client = PubSubClient::connect(&pubsub_config)
        .await
        .context("message broker is unreachable")?;

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    supervise(&client, &app_config, &pubsub_config, &shutdown).await;
    info!("Shutdown complete.");
    Ok(())
}

/// Runs the subscribe loop until shutdown, restarting it after terminal errors.
async fn supervise(client: &PubSubClient, app_config: &AppConfig, pubsub_config: &PubSubConfig, shutdown: &CancellationToken) {
    let policy = RetryPolicy {
        max_retries: u32::MAX,
        ..pubsub_config.retry
    };
    let mut restarts: u32 = 0;

    while !shutdown.is_cancelled() {
        let started = Instant::now();
        let outcome = match client
            .new_subscriber(
                &app_config.topic,
                &app_config.subscription,
                pubsub_config.subscriber.clone(),
                pubsub_config.auto_create,
            )
            .await
        {
            Ok(subscriber) => subscriber.subscribe(shutdown, handle_event).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => break,
            Err(e) if e.is_cancelled() => break,
            Err(e) => {
                // A run that stayed up longer than the longest delay starts the backoff over.
                if started.elapsed() > policy.retry_max_delay {
                    restarts = 0;
                }
                restarts = restarts.saturating_add(1);
                let delay = policy.delay_for_attempt(restarts);
                warn!(error = %e, restarts, delay = ?delay, "subscriber stopped, restarting");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Logs the event. Events are acknowledged once this returns `Ok`.
async fn handle_event(_cancel: CancellationToken, message: ReceivedMessage) -> anyhow::Result<()> {
    let body = String::from_utf8_lossy(message.data());
    info!(
        message_id = %message.id,
        redelivered = message.redelivered,
        bytes = message.data().len(),
        body = %body,
        "event received"
    );
    Ok(())
}

async fn watch_signals(shutdown: CancellationToken) {
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(e) => {
                        error!(error = %e, "cannot listen for SIGTERM");
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {}
    }
    shutdown.cancel();
}
