//! # Connection Manager
//!
//! One algorithm for every backing service: dial with retries, then probe
//! liveness with an independent retry loop, then hand the live handle to the
//! caller. A handle that never answers a ping is closed before the error is
//! returned.
//!
//! The manager keeps no state of its own, so two `connect` calls produce two
//! independent handles. Callers that want one shared handle keep it above
//! this layer (an `Arc`, an axum `State`, ...).

use std::fmt;
use std::ops::Deref;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use super::retry::{retry_with_backoff, RetryPolicy};

/// Boxed root cause carried by connection and transport errors.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Terminal connection-establishment failures. Never retried by higher layers.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to connect to {service} after {attempts} attempts: {source}")]
    Dial {
        service: &'static str,
        attempts: u32,
        #[source]
        source: BoxError,
    },
    #[error("failed to ping {service} after {attempts} attempts: {source}")]
    Ping {
        service: &'static str,
        attempts: u32,
        #[source]
        source: BoxError,
    },
}

impl ConnectError {
    /// Number of attempts made by the loop that gave up.
    pub fn attempts(&self) -> u32 {
        match self {
            ConnectError::Dial { attempts, .. } | ConnectError::Ping { attempts, .. } => *attempts,
        }
    }
}

/// The observable parts of a connection target. Holds no credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub database: Option<String>,
    pub pool_size: Option<u32>,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        write!(f, "{}:{}", self.host, self.port)?;
        if let Some(db) = &self.database {
            write!(f, "/{}", db)?;
        }
        Ok(())
    }
}

/// How to open, probe and close one kind of backing service.
#[async_trait]
pub trait Dialer: Send + Sync {
    type Connection: Send + Sync;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Short service name used in logs and errors ("database", "redis").
    fn service(&self) -> &'static str;

    /// Where the dialer connects to, for logging.
    fn endpoint(&self) -> Endpoint;

    async fn dial(&self) -> Result<Self::Connection, Self::Error>;

    /// A lightweight round-trip proving the handle is usable.
    async fn ping(&self, conn: &Self::Connection) -> Result<(), Self::Error>;

    async fn close(&self, conn: Self::Connection);
}

/// A handle that has passed at least one liveness probe.
#[derive(Debug)]
pub struct LiveConnection<C> {
    inner: C,
}

impl<C> LiveConnection<C> {
    pub fn get(&self) -> &C {
        &self.inner
    }

    /// Takes ownership of the handle. Closing it becomes the caller's job.
    pub fn into_inner(self) -> C {
        self.inner
    }
}

impl<C> Deref for LiveConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.inner
    }
}

/// Dials `dialer` and probes the result, both under `policy`.
///
/// Dropping the returned future abandons any pending retry sleep and drops a
/// half-open handle, which is how callers bound or cancel the whole procedure.
pub async fn connect<D>(
    dialer: &D,
    policy: &RetryPolicy,
) -> Result<LiveConnection<D::Connection>, ConnectError>
where
    D: Dialer,
{
    let service = dialer.service();
    let endpoint = dialer.endpoint();

    info!(
        service,
        host = %endpoint.host,
        port = endpoint.port,
        user = ?endpoint.user,
        database = ?endpoint.database,
        pool_size = ?endpoint.pool_size,
        max_retries = policy.max_retries,
        "connecting to {}", service
    );

    let conn = retry_with_backoff(policy, &format!("{} connection", service), || dialer.dial())
        .await
        .map_err(|e| ConnectError::Dial {
            service,
            attempts: e.attempts,
            source: Box::new(e.last_error),
        })?;

    let probe = retry_with_backoff(policy, &format!("{} ping", service), || dialer.ping(&conn)).await;

    if let Err(e) = probe {
        dialer.close(conn).await;
        return Err(ConnectError::Ping {
            service,
            attempts: e.attempts,
            source: Box::new(e.last_error),
        });
    }

    info!(service, endpoint = %endpoint, "successfully connected to {}", service);
    Ok(LiveConnection { inner: conn })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::Instant;

    /// Fails the first `dial_failures` dials and `ping_failures` pings.
    #[derive(Default)]
    struct FlakyDialer {
        dial_failures: u32,
        ping_failures: u32,
        dials: AtomicU32,
        pings: AtomicU32,
        closed: Mutex<Vec<u32>>,
        dial_times: Mutex<Vec<Instant>>,
    }

    #[async_trait]
    impl Dialer for FlakyDialer {
        type Connection = u32;
        type Error = io::Error;

        fn service(&self) -> &'static str {
            "test-service"
        }

        fn endpoint(&self) -> Endpoint {
            Endpoint {
                host: "localhost".into(),
                port: 5432,
                user: Some("postgres".into()),
                database: Some("app".into()),
                pool_size: Some(4),
            }
        }

        async fn dial(&self) -> Result<u32, io::Error> {
            self.dial_times.lock().unwrap().push(Instant::now());
            let n = self.dials.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.dial_failures {
                Err(io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"))
            } else {
                Ok(n)
            }
        }

        async fn ping(&self, _conn: &u32) -> Result<(), io::Error> {
            let n = self.pings.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.ping_failures {
                Err(io::Error::new(io::ErrorKind::TimedOut, "ping timed out"))
            } else {
                Ok(())
            }
        }

        async fn close(&self, conn: u32) {
            self.closed.lock().unwrap().push(conn);
        }
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            retry_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_sleeps_follow_capped_doubling() {
        let dialer = FlakyDialer {
            dial_failures: 3,
            ..Default::default()
        };

        let conn = connect(&dialer, &policy(5)).await.unwrap();
        assert_eq!(*conn, 4);

        let times = dialer.dial_times.lock().unwrap().clone();
        let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            gaps,
            vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)]
        );
        assert_eq!(dialer.pings.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_never_succeeds() {
        let dialer = FlakyDialer {
            dial_failures: u32::MAX,
            ..Default::default()
        };

        let err = connect(&dialer, &policy(3)).await.unwrap_err();
        assert!(matches!(err, ConnectError::Dial { attempts: 4, .. }));
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 4);
        assert_eq!(
            err.to_string(),
            "failed to connect to test-service after 4 attempts: connection refused"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_exhaustion_closes_the_handle() {
        let dialer = FlakyDialer {
            dial_failures: 1,
            ping_failures: u32::MAX,
            ..Default::default()
        };

        let err = connect(&dialer, &policy(2)).await.unwrap_err();
        assert!(matches!(err, ConnectError::Ping { attempts: 3, .. }));
        assert_eq!(err.attempts(), 3);
        // The second dial produced handle 2; it is the one that must be closed.
        assert_eq!(*dialer.closed.lock().unwrap(), vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_loop_has_its_own_counter() {
        let dialer = FlakyDialer {
            dial_failures: 2,
            ping_failures: 2,
            ..Default::default()
        };

        // Two dial retries plus two ping retries fit in a budget of two.
        let conn = connect(&dialer, &policy(2)).await.unwrap();
        assert_eq!(conn.into_inner(), 3);
        assert!(dialer.closed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_two_connects_yield_independent_handles() {
        let dialer = FlakyDialer::default();
        let a = connect(&dialer, &policy(0)).await.unwrap();
        let b = connect(&dialer, &policy(0)).await.unwrap();
        assert_ne!(*a.get(), *b.get());
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_connect_cancels_retries() {
        let dialer = FlakyDialer {
            dial_failures: u32::MAX,
            ..Default::default()
        };

        let outcome = tokio::time::timeout(Duration::from_millis(1500), connect(&dialer, &policy(5))).await;
        assert!(outcome.is_err());
        // Attempt 0 at t=0, attempt 1 at t=1s, attempt 2 would be at t=3s.
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_endpoint_display_has_no_password() {
        let endpoint = Endpoint {
            host: "database".into(),
            port: 5432,
            user: Some("postgres".into()),
            database: Some("postgres".into()),
            pool_size: Some(10),
        };
        assert_eq!(endpoint.to_string(), "postgres@database:5432/postgres");
    }
}
