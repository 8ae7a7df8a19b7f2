//! # Provisioning and Publishing Scenarios

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lib_common::messaging::{
    BrokerTransport, MemoryBroker, Message, MessagingError, PubSubClient, ReceivedMessage, ResourceKind,
    TransportError,
};
use project_tests::{PROJECT, memory_client};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_auto_create_is_idempotent_and_publish_returns_an_id() {
    let (broker, client) = memory_client(MemoryBroker::new());
    let cancel = CancellationToken::new();

    let publisher = client.new_publisher("client-events", true).await.unwrap();
    let _again = client.new_publisher("client-events", true).await.unwrap();
    assert_eq!(broker.topic_creations(), 1);

    let id = publisher.publish(&cancel, "hello", None).await.unwrap();
    assert!(!id.is_empty());
    assert_eq!(client.project_id(), PROJECT);
}

#[tokio::test]
async fn test_subscriber_provisioning_creates_topic_and_subscription_once() {
    let (broker, client) = memory_client(MemoryBroker::new());
    let config = project_tests::subscriber_config(false, 10, 1);

    client
        .new_subscriber("client-events", "worker", config.clone(), true)
        .await
        .unwrap();
    client
        .new_subscriber("client-events", "worker", config, true)
        .await
        .unwrap();

    assert_eq!(broker.topic_creations(), 1);
    assert_eq!(broker.subscription_creations(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_publishes_never_overlap() {
    let (broker, client) = memory_client(MemoryBroker::new().with_publish_latency(Duration::from_millis(2)));
    let publisher = Arc::new(client.new_publisher("orders", true).await.unwrap());
    let cancel = CancellationToken::new();

    let mut tasks = Vec::new();
    for i in 0..25 {
        let publisher = Arc::clone(&publisher);
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            publisher.publish(&cancel, format!("order-{i}"), None).await
        }));
    }

    let mut ids = HashSet::new();
    for task in tasks {
        ids.insert(task.await.unwrap().unwrap());
    }

    assert_eq!(ids.len(), 25);
    assert_eq!(broker.publish_calls(), 25);
    assert_eq!(broker.max_concurrent_publishes(), 1);
}

#[tokio::test]
async fn test_sequential_publishes_keep_call_order() {
    let (broker, client) = memory_client(MemoryBroker::new());
    let publisher = client.new_publisher("orders", true).await.unwrap();
    broker.create_subscription("audit", "orders").await.unwrap();
    let cancel = CancellationToken::new();

    for i in 0..5 {
        publisher.publish(&cancel, format!("order-{i}"), None).await.unwrap();
    }

    let delivered: Vec<Vec<u8>> = broker
        .pull("audit", 10)
        .await
        .unwrap()
        .iter()
        .map(|m| m.data().to_vec())
        .collect();
    let expected: Vec<Vec<u8>> = (0..5).map(|i| format!("order-{i}").into_bytes()).collect();
    assert_eq!(delivered, expected);
}

#[tokio::test]
async fn test_without_auto_create_missing_topic_fails_at_publish() {
    let (broker, client) = memory_client(MemoryBroker::new());
    let publisher = client.new_publisher("missing", false).await.unwrap();

    let err = publisher
        .publish(&CancellationToken::new(), "hello", None)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        MessagingError::Publish(TransportError::NotFound { kind: ResourceKind::Topic, .. })
    ));
    assert!(err.to_string().starts_with("failed to publish message"));
    assert_eq!(broker.topic_creations(), 0);
}

/// Reports nothing as existing; creation may race with another process.
struct RacingBroker {
    inner: MemoryBroker,
    fail_checks: bool,
}

#[async_trait]
impl BrokerTransport for RacingBroker {
    async fn topic_exists(&self, _topic: &str) -> Result<bool, TransportError> {
        if self.fail_checks {
            return Err(TransportError::Backend("permission denied".into()));
        }
        Ok(false)
    }
    async fn create_topic(&self, topic: &str) -> Result<(), TransportError> {
        self.inner.create_topic(topic).await
    }
    async fn subscription_exists(&self, _subscription: &str) -> Result<bool, TransportError> {
        Ok(false)
    }
    async fn create_subscription(&self, subscription: &str, topic: &str) -> Result<(), TransportError> {
        self.inner.create_subscription(subscription, topic).await
    }
    async fn publish(&self, topic: &str, message: Message) -> Result<String, TransportError> {
        self.inner.publish(topic, message).await
    }
    async fn pull(&self, subscription: &str, max: usize) -> Result<Vec<ReceivedMessage>, TransportError> {
        self.inner.pull(subscription, max).await
    }
    async fn acknowledge(&self, subscription: &str, ack_ids: &[String]) -> Result<(), TransportError> {
        self.inner.acknowledge(subscription, ack_ids).await
    }
}

#[tokio::test]
async fn test_losing_a_creation_race_is_not_an_error() {
    let inner = MemoryBroker::new();
    inner.create_topic("orders").await.unwrap();
    inner.create_subscription("billing", "orders").await.unwrap();
    let client = PubSubClient::with_transport(Arc::new(RacingBroker { inner, fail_checks: false }), PROJECT);

    assert!(client.new_publisher("orders", true).await.is_ok());
    let config = project_tests::subscriber_config(false, 1, 1);
    assert!(client.new_subscriber("orders", "billing", config, true).await.is_ok());
}

#[tokio::test]
async fn test_existence_check_failure_is_wrapped_with_the_action() {
    let client = PubSubClient::with_transport(
        Arc::new(RacingBroker {
            inner: MemoryBroker::new(),
            fail_checks: true,
        }),
        PROJECT,
    );

    let err = client.new_publisher("orders", true).await.err().unwrap();
    assert!(matches!(err, MessagingError::ExistenceCheck { kind: ResourceKind::Topic, .. }));
    assert_eq!(
        err.to_string(),
        "failed to check if topic orders exists: broker error: permission denied"
    );
}
