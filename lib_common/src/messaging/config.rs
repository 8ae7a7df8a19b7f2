//! # Messaging Configuration
//!
//! `PUBSUB_*` environment variables, read once at start-up. The broker
//! address is resolved with a fixed preference: a local emulator address,
//! then a credentials file, then the ambient broker URL.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use super::error::MessagingError;
use crate::configs::EnvReader;
use crate::connections::cache_redis::mask_url_password;
use crate::connections::retry::RetryPolicy;

/// How a subscriber hands messages to its handler. Fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStrategy {
    /// At most `workers` handlers run at once; each message is acknowledged
    /// after its handler returns `Ok`.
    Bounded { workers: usize },
    /// One detached task per message, bounded only by the outstanding ceiling.
    Concurrent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberConfig {
    /// Messages pulled but not yet finished, across all handlers.
    pub max_outstanding_messages: usize,
    pub num_workers: usize,
    pub async_pull: bool,
    /// Pause between pulls that returned nothing.
    pub poll_interval: Duration,
    /// How long a bounded subscriber waits for in-flight handlers on cancellation.
    pub shutdown_timeout: Duration,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            max_outstanding_messages: 10,
            num_workers: 1,
            async_pull: false,
            poll_interval: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl SubscriberConfig {
    pub fn delivery_strategy(&self) -> DeliveryStrategy {
        if self.async_pull {
            DeliveryStrategy::Concurrent
        } else {
            DeliveryStrategy::Bounded {
                workers: self.num_workers.max(1),
            }
        }
    }
}

/// Where the broker address came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEndpoint {
    Emulator(String),
    CredentialsFile(PathBuf),
    Ambient(String),
}

/// Contents of the file named by `PUBSUB_APPLICATION_CREDENTIALS`.
#[derive(Debug, Deserialize)]
struct BrokerCredentials {
    endpoint: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    tls: bool,
    #[serde(default)]
    database: Option<u32>,
}

#[derive(Clone)]
pub struct PubSubConfig {
    /// Namespace for every topic and subscription of this client.
    pub project_id: String,
    pub credentials_file: Option<PathBuf>,
    pub emulator_host: Option<String>,
    pub broker_url: String,
    pub auto_create: bool,
    /// Idle time after which an unacknowledged delivery is handed out again.
    pub ack_deadline: Duration,
    pub subscriber: SubscriberConfig,
    pub retry: RetryPolicy,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            project_id: "local-project".to_string(),
            credentials_file: None,
            emulator_host: None,
            broker_url: "redis://localhost:6379".to_string(),
            auto_create: true,
            ack_deadline: Duration::from_secs(10),
            subscriber: SubscriberConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl fmt::Debug for PubSubConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubSubConfig")
            .field("project_id", &self.project_id)
            .field("credentials_file", &self.credentials_file)
            .field("emulator_host", &self.emulator_host)
            .field("broker_url", &mask_url_password(&self.broker_url))
            .field("auto_create", &self.auto_create)
            .field("ack_deadline", &self.ack_deadline)
            .field("subscriber", &self.subscriber)
            .field("retry", &self.retry)
            .finish()
    }
}

impl PubSubConfig {
    pub fn from_env() -> Self {
        Self::from_reader(&EnvReader::system())
    }

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
        let ds = &d.subscriber;
        Self {
            project_id: env.non_empty("PUBSUB_PROJECT_ID", &d.project_id),
            credentials_file: env.optional("PUBSUB_APPLICATION_CREDENTIALS").map(PathBuf::from),
            emulator_host: env.optional("PUBSUB_EMULATOR_HOST"),
            broker_url: env.non_empty("PUBSUB_BROKER_URL", &d.broker_url),
            auto_create: env.flag("PUBSUB_AUTO_CREATE_TOPICS", d.auto_create),
            ack_deadline: env.duration("PUBSUB_ACK_DEADLINE", d.ack_deadline),
            subscriber: SubscriberConfig {
                max_outstanding_messages: env.parse("PUBSUB_MAX_OUTSTANDING_MESSAGES", ds.max_outstanding_messages),
                num_workers: env.parse("PUBSUB_NUM_WORKERS", ds.num_workers),
                async_pull: env.flag("PUBSUB_ASYNC_PULL", ds.async_pull),
                poll_interval: env.duration("PUBSUB_POLL_INTERVAL", ds.poll_interval),
                shutdown_timeout: env.duration("PUBSUB_SHUTDOWN_TIMEOUT", ds.shutdown_timeout),
            },
            retry: RetryPolicy {
                max_retries: env.parse("PUBSUB_MAX_RETRIES", d.retry.max_retries),
                retry_delay: env.duration("PUBSUB_RETRY_DELAY", d.retry.retry_delay),
                retry_max_delay: env.duration("PUBSUB_RETRY_MAX_DELAY", d.retry.retry_max_delay),
            },
        }
    }

    /// Emulator over credentials file over ambient URL.
    pub fn endpoint(&self) -> BrokerEndpoint {
        if let Some(host) = &self.emulator_host {
            BrokerEndpoint::Emulator(host.clone())
        } else if let Some(path) = &self.credentials_file {
            BrokerEndpoint::CredentialsFile(path.clone())
        } else {
            BrokerEndpoint::Ambient(self.broker_url.clone())
        }
    }

    /// The broker URL to dial, reading the credentials file if that is the source.
    pub fn resolve_broker_url(&self) -> Result<String, MessagingError> {
        match self.endpoint() {
            BrokerEndpoint::Emulator(host) => Ok(with_scheme(&host)),
            BrokerEndpoint::CredentialsFile(path) => url_from_credentials(&path),
            BrokerEndpoint::Ambient(url) => Ok(url),
        }
    }
}

fn with_scheme(host: &str) -> String {
    if host.contains("://") {
        host.to_string()
    } else {
        format!("redis://{}", host)
    }
}

fn url_from_credentials(path: &Path) -> Result<String, MessagingError> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        MessagingError::Config(format!("cannot read credentials file {}: {}", path.display(), e))
    })?;
    let creds: BrokerCredentials = serde_json::from_str(&raw).map_err(|e| {
        MessagingError::Config(format!("cannot parse credentials file {}: {}", path.display(), e))
    })?;

    let scheme = if creds.tls { "rediss" } else { "redis" };
    let endpoint = creds
        .endpoint
        .split_once("://")
        .map_or(creds.endpoint.as_str(), |(_, rest)| rest);
    let mut url = Url::parse(&format!("{}://{}", scheme, endpoint))
        .map_err(|e| MessagingError::Config(format!("invalid endpoint {:?}: {}", creds.endpoint, e)))?;

    let rejected = |what: &str| MessagingError::Config(format!("cannot set {} on endpoint {:?}", what, creds.endpoint));
    if let Some(user) = creds.username.as_deref().filter(|u| !u.is_empty()) {
        url.set_username(user).map_err(|_| rejected("username"))?;
    }
    if let Some(password) = creds.password.as_deref().filter(|p| !p.is_empty()) {
        url.set_password(Some(password)).map_err(|_| rejected("password"))?;
    }
    if let Some(db) = creds.database {
        url.set_path(&format!("/{}", db));
    }
    Ok(url.to_string())
}
