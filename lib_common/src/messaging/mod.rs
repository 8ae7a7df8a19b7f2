//! # Messaging Module
//!
//! A pull-based publish/subscribe client. [`PubSubClient`] provisions topics
//! and subscriptions on demand and hands out [`Publisher`]s and
//! [`Subscriber`]s; the broker itself sits behind the [`BrokerTransport`]
//! trait so the same client drives Redis Streams in production and an
//! in-process [`MemoryBroker`] in tests.

/// Payload and delivery envelope types.
pub mod message;

/// The broker capability surface and its error type.
pub mod transport;

/// Errors surfaced to callers of the client, publisher and subscriber.
pub mod error;

/// Environment-sourced client and subscriber configuration.
pub mod config;

/// Topic/subscription provisioning and the factory for publishers and subscribers.
pub mod client;

/// Serialized per-topic publishing.
pub mod publisher;

/// The receive loop and its two delivery strategies.
pub mod subscriber;

/// Redis Streams implementation of the broker transport.
pub mod redis_streams;

/// In-process broker with the same delivery semantics.
pub mod memory;

pub use client::PubSubClient;
pub use config::{DeliveryStrategy, PubSubConfig, SubscriberConfig};
pub use error::MessagingError;
pub use memory::MemoryBroker;
pub use message::{Attributes, Message, ReceivedMessage};
pub use publisher::Publisher;
pub use redis_streams::RedisStreamsTransport;
pub use subscriber::{MessageHandler, Subscriber};
pub use transport::{BrokerTransport, ResourceKind, TransportError};
