//! # In-Memory Broker
//!
//! A process-local [`BrokerTransport`] with the same delivery rules as the
//! Redis Streams transport: every subscription of a topic gets its own copy
//! of each message, a pulled message is leased until acknowledged or until
//! its ack deadline passes, and an expired lease is delivered again.
//!
//! It also records what happened to it, which is what the integration tests
//! assert on.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::message::{Message, ReceivedMessage};
use super::transport::{BrokerTransport, ResourceKind, TransportError};

#[derive(Debug, Clone)]
struct Entry {
    id: String,
    message: Message,
    deliveries: u32,
}

#[derive(Debug)]
struct Lease {
    entry: Entry,
    expires: Instant,
}

#[derive(Debug, Default)]
struct SubscriptionState {
    topic: String,
    backlog: VecDeque<Entry>,
    leased: HashMap<String, Lease>,
}

#[derive(Debug, Default)]
struct State {
    topics: HashMap<String, Vec<String>>,
    subscriptions: HashMap<String, SubscriptionState>,
    next_id: u64,
    acknowledged: Vec<String>,
}

/// Decrements the in-flight publish gauge on every exit path.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct MemoryBroker {
    state: Mutex<State>,
    ack_deadline: Duration,
    publish_latency: Option<Duration>,
    topic_creations: AtomicUsize,
    subscription_creations: AtomicUsize,
    publish_calls: AtomicUsize,
    publishes_in_flight: AtomicUsize,
    peak_publishes_in_flight: AtomicUsize,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            ack_deadline: Duration::from_secs(10),
            publish_latency: None,
            topic_creations: AtomicUsize::new(0),
            subscription_creations: AtomicUsize::new(0),
            publish_calls: AtomicUsize::new(0),
            publishes_in_flight: AtomicUsize::new(0),
            peak_publishes_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_ack_deadline(mut self, ack_deadline: Duration) -> Self {
        self.ack_deadline = ack_deadline;
        self
    }

    /// Makes every publish take at least `latency` before it is stored.
    pub fn with_publish_latency(mut self, latency: Duration) -> Self {
        self.publish_latency = Some(latency);
        self
    }

    pub fn topic_creations(&self) -> usize {
        self.topic_creations.load(Ordering::SeqCst)
    }

    pub fn subscription_creations(&self) -> usize {
        self.subscription_creations.load(Ordering::SeqCst)
    }

    /// Publish calls received, failed ones included.
    pub fn publish_calls(&self) -> usize {
        self.publish_calls.load(Ordering::SeqCst)
    }

    /// The largest number of publish calls that were ever in progress at once.
    pub fn max_concurrent_publishes(&self) -> usize {
        self.peak_publishes_in_flight.load(Ordering::SeqCst)
    }

    /// Message ids acknowledged so far, in acknowledgement order.
    pub fn acknowledged(&self) -> Vec<String> {
        self.lock().acknowledged.clone()
    }

    /// Messages of `subscription` that are queued or leased.
    pub fn unacknowledged(&self, subscription: &str) -> usize {
        self.lock()
            .subscriptions
            .get(subscription)
            .map_or(0, |s| s.backlog.len() + s.leased.len())
    }

    /// Removes a subscription as if it had been deleted by another process.
    pub fn delete_subscription(&self, subscription: &str) -> bool {
        let mut state = self.lock();
        let Some(removed) = state.subscriptions.remove(subscription) else {
            return false;
        };
        if let Some(subs) = state.topics.get_mut(&removed.topic) {
            subs.retain(|s| s != subscription);
        }
        true
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock cannot leave the maps half-updated.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl BrokerTransport for MemoryBroker {
    async fn topic_exists(&self, topic: &str) -> Result<bool, TransportError> {
        Ok(self.lock().topics.contains_key(topic))
    }

    async fn create_topic(&self, topic: &str) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.topics.contains_key(topic) {
            return Err(TransportError::already_exists(ResourceKind::Topic, topic));
        }
        state.topics.insert(topic.to_string(), Vec::new());
        self.topic_creations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn subscription_exists(&self, subscription: &str) -> Result<bool, TransportError> {
        Ok(self.lock().subscriptions.contains_key(subscription))
    }

    async fn create_subscription(&self, subscription: &str, topic: &str) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.subscriptions.contains_key(subscription) {
            return Err(TransportError::already_exists(ResourceKind::Subscription, subscription));
        }
        let Some(subs) = state.topics.get_mut(topic) else {
            return Err(TransportError::not_found(ResourceKind::Topic, topic));
        };
        subs.push(subscription.to_string());
        state.subscriptions.insert(
            subscription.to_string(),
            SubscriptionState {
                topic: topic.to_string(),
                ..Default::default()
            },
        );
        self.subscription_creations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, topic: &str, message: Message) -> Result<String, TransportError> {
        self.publish_calls.fetch_add(1, Ordering::SeqCst);
        let now_in_flight = self.publishes_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _in_flight = InFlight(&self.publishes_in_flight);
        self.peak_publishes_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);

        if let Some(latency) = self.publish_latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.lock();
        let Some(subs) = state.topics.get(topic).cloned() else {
            return Err(TransportError::not_found(ResourceKind::Topic, topic));
        };

        state.next_id += 1;
        let id = state.next_id.to_string();
        for sub in subs {
            if let Some(sub_state) = state.subscriptions.get_mut(&sub) {
                sub_state.backlog.push_back(Entry {
                    id: id.clone(),
                    message: message.clone(),
                    deliveries: 0,
                });
            }
        }
        Ok(id)
    }

    async fn pull(&self, subscription: &str, max_messages: usize) -> Result<Vec<ReceivedMessage>, TransportError> {
        let now = Instant::now();
        let ack_deadline = self.ack_deadline;
        let mut state = self.lock();
        let Some(sub) = state.subscriptions.get_mut(subscription) else {
            return Err(TransportError::not_found(ResourceKind::Subscription, subscription));
        };

        let mut expired: Vec<String> = sub
            .leased
            .iter()
            .filter(|(_, lease)| lease.expires <= now)
            .map(|(ack_id, _)| ack_id.clone())
            .collect();
        expired.sort();
        for ack_id in expired.into_iter().rev() {
            if let Some(lease) = sub.leased.remove(&ack_id) {
                sub.backlog.push_front(lease.entry);
            }
        }

        let mut delivered = Vec::new();
        while delivered.len() < max_messages {
            let Some(mut entry) = sub.backlog.pop_front() else {
                break;
            };
            entry.deliveries += 1;
            let ack_id = format!("{}/{}/{}", subscription, entry.id, entry.deliveries);
            delivered.push(ReceivedMessage {
                id: entry.id.clone(),
                ack_id: ack_id.clone(),
                message: entry.message.clone(),
                redelivered: entry.deliveries > 1,
            });
            sub.leased.insert(
                ack_id,
                Lease {
                    entry,
                    expires: now + ack_deadline,
                },
            );
        }
        Ok(delivered)
    }

    async fn acknowledge(&self, subscription: &str, ack_ids: &[String]) -> Result<(), TransportError> {
        let mut state = self.lock();
        let Some(sub) = state.subscriptions.get_mut(subscription) else {
            return Err(TransportError::not_found(ResourceKind::Subscription, subscription));
        };
        // Stale ack ids (from an expired lease) are ignored, as a broker would.
        let ids: Vec<String> = ack_ids
            .iter()
            .filter_map(|ack_id| sub.leased.remove(ack_id))
            .map(|lease| lease.entry.id)
            .collect();
        state.acknowledged.extend(ids);
        Ok(())
    }

    fn ack_deadline(&self) -> Option<Duration> {
        Some(self.ack_deadline)
    }

    async fn extend_leases(&self, subscription: &str, ack_ids: &[String]) -> Result<(), TransportError> {
        let expires = Instant::now() + self.ack_deadline;
        let mut state = self.lock();
        let Some(sub) = state.subscriptions.get_mut(subscription) else {
            return Err(TransportError::not_found(ResourceKind::Subscription, subscription));
        };
        for ack_id in ack_ids {
            if let Some(lease) = sub.leased.get_mut(ack_id) {
                lease.expires = expires;
            }
        }
        Ok(())
    }
}
