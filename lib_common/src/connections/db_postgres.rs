//! # PostgreSQL Connection Manager
//!
//! Provides a managed connection pool for PostgreSQL using the `sqlx` crate.
//! The pool is opened through [`connect`], so a [`Database`] only ever
//! exists once the server has answered `SELECT 1`.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};
use thiserror::Error;
use tracing::info;

use super::manager::{connect, ConnectError, Dialer, Endpoint};
use super::retry::RetryPolicy;
use crate::configs::EnvReader;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(3);

/// Custom error types for Database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("database connection error: {0}")]
    Connection(#[source] sqlx::Error),
    #[error("query execution failed: {0}")]
    Query(#[source] sqlx::Error),
}

/// Everything needed to open the pool. Built once at start-up.
#[derive(Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub ssl_mode: PgSslMode,
    pub max_open_conns: u32,
    pub max_idle_conns: u32,
    pub conn_max_lifetime: Duration,
    pub conn_max_idle_time: Duration,
    pub retry: RetryPolicy,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "database".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: "postgres".to_string(),
            database: "postgres".to_string(),
            ssl_mode: PgSslMode::Disable,
            max_open_conns: 10,
            max_idle_conns: 5,
            conn_max_lifetime: Duration::from_secs(60 * 60),
            conn_max_idle_time: Duration::from_secs(15 * 60),
            retry: RetryPolicy::default(),
        }
    }
}

impl fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"*****")
            .field("database", &self.database)
            .field("ssl_mode", &self.ssl_mode)
            .field("max_open_conns", &self.max_open_conns)
            .field("max_idle_conns", &self.max_idle_conns)
            .field("conn_max_lifetime", &self.conn_max_lifetime)
            .field("conn_max_idle_time", &self.conn_max_idle_time)
            .field("retry", &self.retry)
            .finish()
    }
}

impl DbConfig {
    /// Reads `POSTGRES_*` and `DB_*` variables from the process environment.
    pub fn from_env() -> Self {
        Self::from_reader(&EnvReader::system())
    }

    /// Same as [`DbConfig::from_env`] over an arbitrary lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::from_reader(&EnvReader::new(lookup))
    }

    fn from_reader<F>(env: &EnvReader<F>) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        Self {
            host: env.non_empty("POSTGRES_HOST", &d.host),
            port: env.parse("POSTGRES_PORT", d.port),
            user: env.non_empty("POSTGRES_USER", &d.user),
            password: env.string("POSTGRES_PASSWORD", &d.password),
            database: env.non_empty("POSTGRES_DB", &d.database),
            ssl_mode: env.parse("POSTGRES_SSLMODE", d.ssl_mode),
            max_open_conns: env.parse("DB_MAX_OPEN_CONNS", d.max_open_conns),
            max_idle_conns: env.parse("DB_MAX_IDLE_CONNS", d.max_idle_conns),
            conn_max_lifetime: env.duration("DB_CONN_MAX_LIFETIME", d.conn_max_lifetime),
            conn_max_idle_time: env.duration("DB_CONN_MAX_IDLE_TIME", d.conn_max_idle_time),
            retry: RetryPolicy {
                max_retries: env.parse("DB_MAX_RETRIES", d.retry.max_retries),
                retry_delay: env.duration("DB_RETRY_DELAY", d.retry.retry_delay),
                retry_max_delay: env.duration("DB_RETRY_MAX_DELAY", d.retry.retry_max_delay),
            },
        }
    }

    /// Connection target for the driver.
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database)
            .ssl_mode(self.ssl_mode)
    }

    /// Pool sizing. sqlx keeps idle connections up to `min_connections`, so
    /// the idle count maps there, capped at the open count.
    pub fn pool_options(&self) -> PgPoolOptions {
        let max_open = self.max_open_conns.max(1);
        PgPoolOptions::new()
            .max_connections(max_open)
            .min_connections(self.max_idle_conns.min(max_open))
            .max_lifetime(self.conn_max_lifetime)
            .idle_timeout(self.conn_max_idle_time)
            .acquire_timeout(ACQUIRE_TIMEOUT)
    }
}

/// Opens `PgPool`s for the connection manager.
pub struct PostgresDialer {
    config: DbConfig,
}

impl PostgresDialer {
    pub fn new(config: DbConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Dialer for PostgresDialer {
    type Connection = PgPool;
    type Error = DbError;

    fn service(&self) -> &'static str {
        "database"
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint {
            host: self.config.host.clone(),
            port: self.config.port,
            user: Some(self.config.user.clone()),
            database: Some(self.config.database.clone()),
            pool_size: Some(self.config.max_open_conns),
        }
    }

    async fn dial(&self) -> Result<PgPool, DbError> {
        self.config
            .pool_options()
            .connect_with(self.config.connect_options())
            .await
            .map_err(DbError::Connection)
    }

    async fn ping(&self, pool: &PgPool) -> Result<(), DbError> {
        ping_pool(pool).await
    }

    async fn close(&self, pool: PgPool) {
        pool.close().await;
    }
}

async fn ping_pool(pool: &PgPool) -> Result<(), DbError> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .map_err(DbError::Query)?;
    Ok(())
}

/// A wrapper around the PostgreSQL connection pool.
///
/// Cloning is cheap and shares the pool.
#[derive(Clone, Debug)]
pub struct Database {
    /// The underlying sqlx connection pool.
    pub pool: PgPool,
}

impl Database {
    /// Opens and probes the pool described by `config`, retrying per `config.retry`.
    pub async fn connect(config: &DbConfig) -> Result<Self, ConnectError> {
        let dialer = PostgresDialer::new(config.clone());
        let live = connect(&dialer, &config.retry).await?;
        Ok(Self {
            pool: live.into_inner(),
        })
    }

    /// Checks the health of the database connection by running a simple query.
    pub async fn ping(&self) -> Result<(), DbError> {
        ping_pool(&self.pool).await
    }

    /// Closes every pooled connection. Waits for checked-out connections to return.
    pub async fn close(&self) {
        info!("closing database connection");
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> DbConfig {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        DbConfig::from_lookup(move |key: &str| map.get(key).cloned())
    }

    #[test]
    fn test_defaults_when_environment_is_empty() {
        let cfg = config(&[]);
        assert_eq!(cfg.host, "database");
        assert_eq!(cfg.port, 5432);
        assert_eq!(cfg.user, "postgres");
        assert_eq!(cfg.database, "postgres");
        assert!(matches!(cfg.ssl_mode, PgSslMode::Disable));
        assert_eq!(cfg.max_open_conns, 10);
        assert_eq!(cfg.max_idle_conns, 5);
        assert_eq!(cfg.conn_max_lifetime, Duration::from_secs(3600));
        assert_eq!(cfg.conn_max_idle_time, Duration::from_secs(900));
        assert_eq!(cfg.retry, RetryPolicy::default());
    }

    #[test]
    fn test_overrides_and_bad_values() {
        let cfg = config(&[
            ("POSTGRES_HOST", "db.internal"),
            ("POSTGRES_PORT", "6543"),
            ("POSTGRES_SSLMODE", "require"),
            ("DB_MAX_OPEN_CONNS", "many"),
            ("DB_MAX_RETRIES", "2"),
            ("DB_RETRY_DELAY", "250ms"),
            ("DB_RETRY_MAX_DELAY", "5s"),
        ]);
        assert_eq!(cfg.host, "db.internal");
        assert_eq!(cfg.port, 6543);
        assert!(matches!(cfg.ssl_mode, PgSslMode::Require));
        assert_eq!(cfg.max_open_conns, 10);
        assert_eq!(cfg.retry.max_retries, 2);
        assert_eq!(cfg.retry.retry_delay, Duration::from_millis(250));
        assert_eq!(cfg.retry.retry_max_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_debug_redacts_password() {
        let cfg = config(&[("POSTGRES_PASSWORD", "hunter2")]);
        assert_eq!(cfg.password, "hunter2");
        let printed = format!("{:?}", cfg);
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("*****"));
    }

    #[test]
    fn test_idle_connections_capped_at_open_connections() {
        let cfg = config(&[("DB_MAX_OPEN_CONNS", "3"), ("DB_MAX_IDLE_CONNS", "8")]);
        let opts = cfg.pool_options();
        assert_eq!(opts.get_max_connections(), 3);
        assert_eq!(opts.get_min_connections(), 3);
        assert_eq!(opts.get_max_lifetime(), Some(Duration::from_secs(3600)));
        assert_eq!(opts.get_idle_timeout(), Some(Duration::from_secs(900)));
    }

    #[test]
    fn test_endpoint_reports_pool_size_without_password() {
        let dialer = PostgresDialer::new(config(&[("POSTGRES_PASSWORD", "hunter2")]));
        let endpoint = dialer.endpoint();
        assert_eq!(endpoint.pool_size, Some(10));
        assert!(!endpoint.to_string().contains("hunter2"));
        assert_eq!(dialer.service(), "database");
    }
}
