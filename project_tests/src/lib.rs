//! Shared fixtures for the cross-crate scenarios under `tests/`.

use std::sync::Arc;
use std::time::Duration;

use lib_common::messaging::{MemoryBroker, PubSubClient, SubscriberConfig};

pub const PROJECT: &str = "test-project";

/// An in-memory broker and a client talking to it.
pub fn memory_client(broker: MemoryBroker) -> (Arc<MemoryBroker>, PubSubClient) {
    let broker = Arc::new(broker);
    let client = PubSubClient::with_transport(broker.clone(), PROJECT);
    (broker, client)
}

/// A subscriber config with a short poll interval, suitable for paused time.
pub fn subscriber_config(async_pull: bool, max_outstanding: usize, workers: usize) -> SubscriberConfig {
    SubscriberConfig {
        max_outstanding_messages: max_outstanding,
        num_workers: workers,
        async_pull,
        poll_interval: Duration::from_millis(10),
        shutdown_timeout: Duration::from_secs(2),
    }
}

/// Polls `condition` every 10ms until it holds or `limit` elapses.
pub async fn wait_until<F>(limit: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
