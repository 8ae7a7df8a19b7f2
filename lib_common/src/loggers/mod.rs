//! # Loggers
//!
//! Installs the process-wide `tracing` subscriber: an `EnvFilter`, a stdout
//! layer (plain text or JSON lines) and, when a directory is configured, a
//! daily-rolling log file that keeps only the newest files.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

#[derive(Debug, Clone)]
pub struct LoggerOptions {
    /// Used as the log file prefix.
    pub app_name: String,
    /// Filter directive used when `RUST_LOG` is not set, e.g. `info` or `lib_common=debug`.
    pub level: String,
    pub json: bool,
    pub log_dir: Option<PathBuf>,
    /// Rolled files kept on disk, the active one included.
    pub max_log_files: usize,
}

impl Default for LoggerOptions {
    fn default() -> Self {
        Self {
            app_name: "app".to_string(),
            level: "info".to_string(),
            json: false,
            log_dir: None,
            max_log_files: 7,
        }
    }
}

/// Installs the global subscriber. Keep the returned guard alive for the
/// lifetime of the process or buffered file output is lost.
pub fn setup_logging(options: &LoggerOptions) -> Result<Option<WorkerGuard>> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = build_filter(rust_log.as_deref(), &options.level)?;

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    if options.json {
        layers.push(fmt::layer().json().with_current_span(false).boxed());
    } else {
        layers.push(fmt::layer().with_target(true).boxed());
    }

    let mut guard = None;
    if let Some(dir) = &options.log_dir {
        let appender = file_appender(dir, &options.app_name, options.max_log_files)?;
        let (writer, worker_guard) = tracing_appender::non_blocking(appender);
        layers.push(fmt::layer().with_writer(writer).with_ansi(false).boxed());
        guard = Some(worker_guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    Ok(guard)
}

/// Valid `RUST_LOG` directives win; otherwise `level` must parse.
fn build_filter(rust_log: Option<&str>, level: &str) -> Result<EnvFilter> {
    if let Some(directives) = rust_log.filter(|d| !d.trim().is_empty()) {
        if let Ok(filter) = EnvFilter::try_new(directives) {
            return Ok(filter);
        }
    }
    EnvFilter::try_new(level).with_context(|| format!("invalid log filter {:?}", level))
}

/// `<dir>/<prefix>.<date>.log`, rotated daily, pruned to `max_files`.
pub fn file_appender(dir: &Path, prefix: &str, max_files: usize) -> Result<RollingFileAppender> {
    std::fs::create_dir_all(dir).with_context(|| format!("cannot create log directory {}", dir.display()))?;
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .filename_suffix("log")
        .max_log_files(max_files.max(1))
        .build(dir)
        .with_context(|| format!("cannot open log file in {}", dir.display()))
}
