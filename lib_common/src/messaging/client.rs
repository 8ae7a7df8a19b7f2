//! # PubSub Client
//!
//! Owns the broker transport and the project namespace. Hands out
//! publishers and subscribers, creating their topic and subscription first
//! when asked to.

use std::sync::Arc;

use tracing::info;

use super::config::{PubSubConfig, SubscriberConfig};
use super::error::MessagingError;
use super::publisher::Publisher;
use super::redis_streams::RedisStreamsTransport;
use super::subscriber::Subscriber;
use super::transport::{BrokerTransport, ResourceKind, TransportError};
use crate::connections::cache_redis::RedisDialer;
use crate::connections::manager::connect;

#[derive(Clone)]
pub struct PubSubClient {
    transport: Arc<dyn BrokerTransport>,
    project_id: String,
}

impl PubSubClient {
    /// Resolves the broker address, connects with retries and wraps the
    /// connection in a Redis Streams transport.
    pub async fn connect(config: &PubSubConfig) -> Result<Self, MessagingError> {
        let url = config.resolve_broker_url()?;
        let dialer = RedisDialer::new(&url)
            .map_err(|e| MessagingError::Config(format!("invalid broker url: {}", e)))?;
        let conn = connect(&dialer, &config.retry).await?;

        let transport = RedisStreamsTransport::new(conn.into_inner(), &config.project_id, config.ack_deadline);
        info!(project_id = %config.project_id, "pubsub client ready");
        Ok(Self::with_transport(Arc::new(transport), &config.project_id))
    }

    /// Wraps an already connected transport.
    pub fn with_transport(transport: Arc<dyn BrokerTransport>, project_id: &str) -> Self {
        Self {
            transport,
            project_id: project_id.to_string(),
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// A publisher for `topic_id`. With `auto_create` the topic is created
    /// if missing; without it a missing topic surfaces on the first publish.
    pub async fn new_publisher(&self, topic_id: &str, auto_create: bool) -> Result<Publisher, MessagingError> {
        if auto_create {
            self.ensure_topic(topic_id).await?;
        }
        Ok(Publisher::new(topic_id, Arc::clone(&self.transport)))
    }

    /// A subscriber on `subscription_id`, bound to `topic_id` when it has to be created.
    pub async fn new_subscriber(
        &self,
        topic_id: &str,
        subscription_id: &str,
        config: SubscriberConfig,
        auto_create: bool,
    ) -> Result<Subscriber, MessagingError> {
        if auto_create {
            self.ensure_topic(topic_id).await?;
            self.ensure_subscription(subscription_id, topic_id).await?;
        }
        Ok(Subscriber::new(subscription_id, Arc::clone(&self.transport), config))
    }

    async fn ensure_topic(&self, topic_id: &str) -> Result<(), MessagingError> {
        let exists = self
            .transport
            .topic_exists(topic_id)
            .await
            .map_err(|source| MessagingError::ExistenceCheck {
                kind: ResourceKind::Topic,
                name: topic_id.to_string(),
                source,
            })?;
        if exists {
            return Ok(());
        }

        match self.transport.create_topic(topic_id).await {
            Ok(()) => {
                info!(project_id = %self.project_id, topic = topic_id, "created topic");
                Ok(())
            }
            // Another process created it between the check and the create.
            Err(TransportError::AlreadyExists { .. }) => Ok(()),
            Err(source) => Err(MessagingError::Create {
                kind: ResourceKind::Topic,
                name: topic_id.to_string(),
                source,
            }),
        }
    }

    async fn ensure_subscription(&self, subscription_id: &str, topic_id: &str) -> Result<(), MessagingError> {
        let exists = self
            .transport
            .subscription_exists(subscription_id)
            .await
            .map_err(|source| MessagingError::ExistenceCheck {
                kind: ResourceKind::Subscription,
                name: subscription_id.to_string(),
                source,
            })?;
        if exists {
            return Ok(());
        }

        match self.transport.create_subscription(subscription_id, topic_id).await {
            Ok(()) => {
                info!(
                    project_id = %self.project_id,
                    subscription = subscription_id,
                    topic = topic_id,
                    "created subscription"
                );
                Ok(())
            }
            Err(TransportError::AlreadyExists { .. }) => Ok(()),
            Err(source) => Err(MessagingError::Create {
                kind: ResourceKind::Subscription,
                name: subscription_id.to_string(),
                source,
            }),
        }
    }
}
