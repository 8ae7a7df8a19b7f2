//! # Event API Server
//!
//! HTTP front door of the event pipeline. Connects to PostgreSQL and the
//! message broker at start-up (both with retries), then serves:
//!
//! - `GET /health`: liveness, always `OK`.
//! - `GET /ready`: readiness, pings the database.
//! - `POST /api/v1/event`: publishes the raw request body to the events
//!   topic and answers `{"server_id": "<broker message id>"}`.
//!
//! Every request shares one `Publisher`; publishes are serialized by it.
//! On SIGINT/SIGTERM the server stops accepting requests, lets in-flight
//! ones finish, then closes the publisher and the database pool.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::Parser;
use lib_common::connections::db_postgres::{Database, DbConfig, DbError};
use lib_common::loggers::{LoggerOptions, setup_logging};
use lib_common::messaging::{MessagingError, PubSubClient, PubSubConfig, Publisher};
use serde_json::json;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// # Application Configuration
///
/// Parsed from command-line arguments and environment variables. Database
/// and broker settings come from their own `POSTGRES_*` / `PUBSUB_*` variables.
#[derive(Parser, Debug)]
#[clap(author, version, about = "HTTP API that publishes client events.")]
struct AppConfig {
    #[clap(long, env = "PORT", default_value_t = 9000, help = "HTTP server port")]
    port: u16,

    #[clap(long, env = "EVENTS_TOPIC", default_value = "client-events", help = "Topic events are published to")]
    topic: String,

    #[clap(
        long,
        env = "PUBLISH_TIMEOUT",
        default_value = "10s",
        value_parser = humantime::parse_duration,
        help = "Upper bound for a single publish"
    )]
    publish_timeout: Duration,

    #[clap(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[clap(long, env = "LOG_JSON", default_value_t = false)]
    log_json: bool,

    #[clap(long, env = "LOG_DIR", help = "Directory for daily rolling log files")]
    log_dir: Option<PathBuf>,
}

/// Shared by every request handler.
#[derive(Clone)]
struct AppState {
    db: Database,
    publisher: Arc<Publisher>,
}

/// # Application Error
#[derive(Debug)]
enum AppError {
    /// The broker rejected or never acknowledged the event.
    Publish(MessagingError),
    /// The database did not answer the readiness probe.
    Database(DbError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_json) = match self {
            AppError::Publish(e) => {
                error!(error = %e, "failed to publish event");
                let status = match e {
                    MessagingError::DeadlineExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
                    MessagingError::PublisherClosed(_) => StatusCode::SERVICE_UNAVAILABLE,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (
                    status,
                    json!({
                        "error_type": "PublishError",
                        "message": "Failed to publish event.",
                        "detail": e.to_string()
                    }),
                )
            }
            AppError::Database(e) => {
                error!(error = %e, "readiness probe failed");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    json!({
                        "error_type": "DatabaseUnavailable",
                        "message": "Database did not answer the health probe.",
                        "detail": e.to_string()
                    }),
                )
            }
        };
        (status, Json(error_json)).into_response()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let app_config = AppConfig::parse();

    let _log_guard = setup_logging(&LoggerOptions {
        app_name: "server_api".to_string(),
        level: app_config.log_level.clone(),
        json: app_config.log_json,
        log_dir: app_config.log_dir.clone(),
        ..Default::default()
    })?;
    info!(port = app_config.port, topic = %app_config.topic, "configuration loaded");

    let db_config = DbConfig::from_env();
    debug!(config = ?db_config, "database configuration");
    let db = Database::connect(&db_config)
        .await
        .context("database is unreachable")?;

    let pubsub_config = PubSubConfig::from_env();
    debug!(config = ?pubsub_config, "pubsub configuration");
    let client = PubSubClient::connect(&pubsub_config)
        .await
        .context("message broker is unreachable")?;
    let publisher = client
        .new_publisher(&app_config.topic, pubsub_config.auto_create)
        .await
        .context("cannot prepare events topic")?
        .with_timeout(app_config.publish_timeout);

    let shutdown = CancellationToken::new();
    let state = AppState {
        db: db.clone(),
        publisher: Arc::new(publisher),
    };

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/api/v1/event", post(publish_event_handler))
        .with_state(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], app_config.port));
    info!("Starting HTTP server on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tokio::spawn(watch_signals(shutdown.clone()));
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;

    state.publisher.close().await;
    db.close().await;
    info!("Shutdown complete.");
    Ok(())
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn ready_handler(State(state): State<AppState>) -> Result<&'static str, AppError> {
    state.db.ping().await.map_err(AppError::Database)?;
    Ok("READY")
}

/// Publishes the raw body; the broker-assigned id is echoed back as `server_id`.
async fn publish_event_handler(State(state): State<AppState>, body: Bytes) -> Result<impl IntoResponse, AppError> {
    debug!(bytes = body.len(), "received event");
    // Not tied to the shutdown signal: graceful shutdown waits for the
    // publish, which is bounded by the publisher timeout.
    let id = state
        .publisher
        .publish(&CancellationToken::new(), body, None)
        .await
        .map_err(AppError::Publish)?;
    Ok((StatusCode::OK, Json(json!({ "server_id": id }))))
}

/// Cancels `shutdown` on Ctrl-C or SIGTERM.
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
