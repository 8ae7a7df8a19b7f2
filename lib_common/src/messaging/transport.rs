//! # Broker Transport
//!
//! The narrow set of broker operations the messaging client depends on.
//! Implementations do not retry; every failure goes straight back to the
//! caller.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::message::{Message, ReceivedMessage};
use crate::connections::manager::BoxError;

/// The two kinds of named broker resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Topic,
    Subscription,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Topic => f.write_str("topic"),
            ResourceKind::Subscription => f.write_str("subscription"),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{kind} {name} not found")]
    NotFound { kind: ResourceKind, name: String },
    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: ResourceKind, name: String },
    #[error("broker error: {0}")]
    Backend(#[source] BoxError),
}

impl TransportError {
    pub fn not_found(kind: ResourceKind, name: &str) -> Self {
        TransportError::NotFound {
            kind,
            name: name.to_string(),
        }
    }

    pub fn already_exists(kind: ResourceKind, name: &str) -> Self {
        TransportError::AlreadyExists {
            kind,
            name: name.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, TransportError::NotFound { .. })
    }
}

#[async_trait]
pub trait BrokerTransport: Send + Sync {
    async fn topic_exists(&self, topic: &str) -> Result<bool, TransportError>;

    /// Fails with `AlreadyExists` when the topic is present.
    async fn create_topic(&self, topic: &str) -> Result<(), TransportError>;

    async fn subscription_exists(&self, subscription: &str) -> Result<bool, TransportError>;

    /// Binds a new subscription to `topic`. Only messages published after
    /// creation are delivered to it.
    async fn create_subscription(&self, subscription: &str, topic: &str) -> Result<(), TransportError>;

    /// Returns the server-assigned id once the broker has stored the message.
    async fn publish(&self, topic: &str, message: Message) -> Result<String, TransportError>;

    /// Returns up to `max_messages` deliveries without blocking; may be empty.
    async fn pull(&self, subscription: &str, max_messages: usize) -> Result<Vec<ReceivedMessage>, TransportError>;

    async fn acknowledge(&self, subscription: &str, ack_ids: &[String]) -> Result<(), TransportError>;

    /// How long a pulled message stays leased before it is delivered again.
    /// `None` when leases never lapse.
    fn ack_deadline(&self) -> Option<Duration> {
        None
    }

    /// Restarts the ack deadline of deliveries still being processed.
    /// Ids whose lease already lapsed are ignored.
    async fn extend_leases(&self, _subscription: &str, _ack_ids: &[String]) -> Result<(), TransportError> {
        Ok(())
    }
}
