//! # Publisher
//!
//! One publisher per topic, shared by any number of callers. Submissions go
//! through an async mutex, so at most one publish per publisher is in flight
//! at the transport and submission order follows lock order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::error::MessagingError;
use super::message::{Attributes, Message};
use super::transport::BrokerTransport;

pub struct Publisher {
    topic: String,
    transport: Arc<dyn BrokerTransport>,
    submit: Mutex<()>,
    closed: AtomicBool,
    timeout: Option<Duration>,
}

impl Publisher {
    pub(crate) fn new(topic: &str, transport: Arc<dyn BrokerTransport>) -> Self {
        Self {
            topic: topic.to_string(),
            transport,
            submit: Mutex::new(()),
            closed: AtomicBool::new(false),
            timeout: None,
        }
    }

    /// Bounds every publish call, waiting for the lock included.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publishes `data` and waits for the broker-assigned message id.
    ///
    /// Not retried. Cancelling `cancel` returns `Cancelled`; whether the
    /// message reached the broker is then unknown.
    pub async fn publish(
        &self,
        cancel: &CancellationToken,
        data: impl Into<Bytes>,
        attributes: Option<Attributes>,
    ) -> Result<String, MessagingError> {
        let message = Message {
            data: data.into(),
            attributes: attributes.unwrap_or_default(),
        };

        let submit = async {
            let _guard = self.submit.lock().await;
            if self.closed.load(Ordering::Acquire) {
                return Err(MessagingError::PublisherClosed(self.topic.clone()));
            }
            self.transport
                .publish(&self.topic, message)
                .await
                .map_err(MessagingError::Publish)
        };

        let bounded = async {
            match self.timeout {
                Some(limit) => tokio::time::timeout(limit, submit)
                    .await
                    .unwrap_or(Err(MessagingError::DeadlineExceeded(limit))),
                None => submit.await,
            }
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(MessagingError::Cancelled),
            result = bounded => result,
        };
        let id = result?;

        debug!(topic = %self.topic, message_id = %id, "published message");
        Ok(id)
    }

    /// Waits for the in-flight publish, then refuses any further ones.
    pub async fn close(&self) {
        let _guard = self.submit.lock().await;
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!(topic = %self.topic, "publisher stopped");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::memory::MemoryBroker;
    use crate::messaging::message::ReceivedMessage;
    use crate::messaging::transport::TransportError;
    use async_trait::async_trait;

    /// Accepts every call and never answers a publish.
    struct SilentBroker;

    #[async_trait]
    impl BrokerTransport for SilentBroker {
        async fn topic_exists(&self, _topic: &str) -> Result<bool, TransportError> {
            Ok(true)
        }
        async fn create_topic(&self, _topic: &str) -> Result<(), TransportError> {
            Ok(())
        }
        async fn subscription_exists(&self, _subscription: &str) -> Result<bool, TransportError> {
            Ok(true)
        }
        async fn create_subscription(&self, _subscription: &str, _topic: &str) -> Result<(), TransportError> {
            Ok(())
        }
        async fn publish(&self, _topic: &str, _message: Message) -> Result<String, TransportError> {
            std::future::pending().await
        }
        async fn pull(&self, _subscription: &str, _max: usize) -> Result<Vec<ReceivedMessage>, TransportError> {
            Ok(Vec::new())
        }
        async fn acknowledge(&self, _subscription: &str, _ack_ids: &[String]) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_unblocks_publish() {
        let publisher = Arc::new(Publisher::new("events", Arc::new(SilentBroker)));
        let cancel = CancellationToken::new();

        let task = {
            let publisher = Arc::clone(&publisher);
            let cancel = cancel.clone();
            tokio::spawn(async move { publisher.publish(&cancel, "payload", None).await })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(MessagingError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_exceeded() {
        let publisher = Publisher::new("events", Arc::new(SilentBroker)).with_timeout(Duration::from_millis(500));
        let result = publisher.publish(&CancellationToken::new(), "payload", None).await;
        assert!(matches!(
            result,
            Err(MessagingError::DeadlineExceeded(d)) if d == Duration::from_millis(500)
        ));
    }

    #[tokio::test]
    async fn test_closed_publisher_refuses_messages() {
        let broker = Arc::new(MemoryBroker::new());
        broker.create_topic("events").await.unwrap();
        let publisher = Publisher::new("events", broker.clone());
        let cancel = CancellationToken::new();

        assert!(publisher.publish(&cancel, "first", None).await.is_ok());
        publisher.close().await;
        publisher.close().await;
        assert!(publisher.is_closed());

        let err = publisher.publish(&cancel, "second", None).await.unwrap_err();
        assert!(matches!(err, MessagingError::PublisherClosed(ref t) if t == "events"));
        assert_eq!(broker.publish_calls(), 1);
    }

    #[tokio::test]
    async fn test_attributes_reach_the_broker() {
        let broker = Arc::new(MemoryBroker::new());
        broker.create_topic("events").await.unwrap();
        broker.create_subscription("audit", "events").await.unwrap();
        let publisher = Publisher::new("events", broker.clone());

        let mut attrs = Attributes::new();
        attrs.insert("origin".into(), "api".into());
        let id = publisher
            .publish(&CancellationToken::new(), b"body".to_vec(), Some(attrs))
            .await
            .unwrap();

        let delivered = broker.pull("audit", 10).await.unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].id, id);
        assert_eq!(delivered[0].data(), b"body");
        assert_eq!(delivered[0].attribute("origin"), Some("api"));
    }
}
