//! # Subscriber
//!
//! A pull loop over one subscription. Messages are pulled only while fewer
//! than `max_outstanding_messages` are unfinished; each pulled message holds
//! one permit of that budget until its handler task ends. A message is
//! acknowledged only when its handler returns `Ok`. A handler error or panic
//! leaves it unacknowledged and the broker delivers it again once the ack
//! deadline passes.
//!
//! While a message is held (waiting for a worker or being handled) a lease
//! keeper extends its ack deadline every half deadline, so a slow backlog
//! is never handed out a second time.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::{DeliveryStrategy, SubscriberConfig};
use super::error::MessagingError;
use super::message::ReceivedMessage;
use super::transport::BrokerTransport;

/// Processes one delivered message. Returning `Ok` acknowledges it.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, cancel: CancellationToken, message: ReceivedMessage) -> BoxFuture<'static, anyhow::Result<()>>;
}

impl<F, Fut> MessageHandler for F
where
    F: Fn(CancellationToken, ReceivedMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn handle(&self, cancel: CancellationToken, message: ReceivedMessage) -> BoxFuture<'static, anyhow::Result<()>> {
        self(cancel, message).boxed()
    }
}

pub struct Subscriber {
    subscription: String,
    transport: Arc<dyn BrokerTransport>,
    config: SubscriberConfig,
    strategy: DeliveryStrategy,
}

impl Subscriber {
    pub(crate) fn new(subscription: &str, transport: Arc<dyn BrokerTransport>, config: SubscriberConfig) -> Self {
        let strategy = config.delivery_strategy();
        Self {
            subscription: subscription.to_string(),
            transport,
            config,
            strategy,
        }
    }

    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    pub fn strategy(&self) -> DeliveryStrategy {
        self.strategy
    }

    /// Receives until `cancel` fires or the transport fails.
    ///
    /// Returns `Err(Cancelled)` on cancellation and the transport error, as
    /// is, when the receive loop cannot continue (for example the
    /// subscription was deleted). Only one call per subscriber at a time.
    pub async fn subscribe<H>(&self, cancel: &CancellationToken, handler: H) -> Result<(), MessagingError>
    where
        H: MessageHandler,
    {
        let handler: Arc<dyn MessageHandler> = Arc::new(handler);
        let max_outstanding = self.config.max_outstanding_messages.max(1);
        let outstanding = Arc::new(Semaphore::new(max_outstanding));
        let workers = match self.strategy {
            DeliveryStrategy::Bounded { workers } => Some(Arc::new(Semaphore::new(workers))),
            DeliveryStrategy::Concurrent => None,
        };
        let mut in_flight: JoinSet<()> = JoinSet::new();
        let held = HeldSet::default();
        let keeper_stop = CancellationToken::new();
        let _stop_keeper = keeper_stop.clone().drop_guard();
        if let Some(deadline) = self.transport.ack_deadline() {
            tokio::spawn(keep_leases(
                Arc::clone(&self.transport),
                self.subscription.clone(),
                held.clone(),
                deadline,
                keeper_stop,
            ));
        }

        info!(
            subscription = %self.subscription,
            strategy = ?self.strategy,
            max_outstanding,
            "subscriber started"
        );

        let outcome = 'receive: loop {
            while let Some(joined) = in_flight.try_join_next() {
                self.log_join(joined);
            }

            // Wait for room in the outstanding budget, then take whatever else is free.
            let first = tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'receive Err(MessagingError::Cancelled),
                permit = Arc::clone(&outstanding).acquire_owned() => permit,
            };
            let Ok(first) = first else {
                break 'receive Err(MessagingError::Cancelled);
            };
            let mut permits = vec![first];
            while permits.len() < max_outstanding {
                match Arc::clone(&outstanding).try_acquire_owned() {
                    Ok(permit) => permits.push(permit),
                    Err(_) => break,
                }
            }

            let pulled = tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'receive Err(MessagingError::Cancelled),
                pulled = self.transport.pull(&self.subscription, permits.len()) => pulled,
            };
            let messages = match pulled {
                Ok(messages) => messages,
                Err(e) => break 'receive Err(MessagingError::Transport(e)),
            };

            if messages.is_empty() {
                drop(permits);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break 'receive Err(MessagingError::Cancelled),
                    _ = tokio::time::sleep(self.config.poll_interval) => continue 'receive,
                }
            }

            debug!(subscription = %self.subscription, count = messages.len(), "pulled messages");

            // Held from here on, so deliveries waiting for a worker keep their lease.
            let batch: Vec<(ReceivedMessage, HeldLease)> = messages
                .into_iter()
                .map(|message| {
                    let lease = held.hold(&message.ack_id);
                    (message, lease)
                })
                .collect();

            for ((message, lease), permit) in batch.into_iter().zip(permits) {
                match &workers {
                    Some(slots) => {
                        let slot = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break 'receive Err(MessagingError::Cancelled),
                            slot = Arc::clone(slots).acquire_owned() => slot,
                        };
                        let Ok(slot) = slot else {
                            break 'receive Err(MessagingError::Cancelled);
                        };
                        in_flight.spawn(self.deliver(&handler, cancel, message, lease, [permit, slot]));
                    }
                    None => {
                        tokio::spawn(self.deliver(&handler, cancel, message, lease, [permit]));
                    }
                }
            }
        };

        if !in_flight.is_empty() {
            self.drain(&mut in_flight).await;
        }

        match &outcome {
            Err(MessagingError::Cancelled) => info!(subscription = %self.subscription, "subscriber stopped"),
            Err(e) => error!(subscription = %self.subscription, error = %e, "receive loop terminated"),
            Ok(()) => {}
        }
        outcome
    }

    /// One handler run followed by the acknowledgement. The permits are
    /// released when the returned future completes or is dropped.
    fn deliver<const N: usize>(
        &self,
        handler: &Arc<dyn MessageHandler>,
        cancel: &CancellationToken,
        message: ReceivedMessage,
        lease: HeldLease,
        permits: [OwnedSemaphorePermit; N],
    ) -> impl Future<Output = ()> + Send + 'static {
        let handler = Arc::clone(handler);
        let transport = Arc::clone(&self.transport);
        let subscription = self.subscription.clone();
        let cancel = cancel.clone();

        async move {
            let _permits = permits;
            let _lease = lease;
            let message_id = message.id.clone();
            let ack_id = message.ack_id.clone();

            match handler.handle(cancel, message).await {
                Ok(()) => {
                    if let Err(e) = transport.acknowledge(&subscription, &[ack_id]).await {
                        warn!(subscription = %subscription, message_id = %message_id, error = %e, "failed to acknowledge message");
                    }
                }
                Err(e) => {
                    let reason = format!("{:#}", e);
                    warn!(
                        subscription = %subscription,
                        message_id = %message_id,
                        error = %reason,
                        "handler failed, message left for redelivery"
                    );
                }
            }
        }
    }

    /// Gives in-flight handlers `shutdown_timeout` to finish, then aborts the rest.
    async fn drain(&self, in_flight: &mut JoinSet<()>) {
        let limit = self.config.shutdown_timeout;
        let finished = tokio::time::timeout(limit, async {
            while let Some(joined) = in_flight.join_next().await {
                self.log_join(joined);
            }
        })
        .await;

        if finished.is_err() {
            warn!(
                subscription = %self.subscription,
                remaining = in_flight.len(),
                timeout = ?limit,
                "aborting handlers still running after shutdown timeout"
            );
            in_flight.shutdown().await;
        }
    }

    fn log_join(&self, joined: Result<(), JoinError>) {
        if let Err(e) = joined {
            if e.is_panic() {
                error!(subscription = %self.subscription, "message handler panicked, message left for redelivery");
            }
        }
    }
}

/// Ack ids of deliveries this subscriber still owns.
#[derive(Clone, Default)]
struct HeldSet(Arc<Mutex<HashSet<String>>>);

impl HeldSet {
    fn hold(&self, ack_id: &str) -> HeldLease {
        self.lock().insert(ack_id.to_string());
        HeldLease {
            ack_id: ack_id.to_string(),
            set: self.clone(),
        }
    }

    fn snapshot(&self) -> Vec<String> {
        self.lock().iter().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Releases the ack id when the delivery ends, whichever way it ends.
struct HeldLease {
    ack_id: String,
    set: HeldSet,
}

impl Drop for HeldLease {
    fn drop(&mut self) {
        self.set.lock().remove(&self.ack_id);
    }
}

/// Extends the leases of held deliveries every half ack deadline. Keeps
/// going after `stop` until the last held delivery is released, which
/// covers detached handlers that outlive the receive loop.
async fn keep_leases(
    transport: Arc<dyn BrokerTransport>,
    subscription: String,
    held: HeldSet,
    deadline: Duration,
    stop: CancellationToken,
) {
    let period = (deadline / 2).max(Duration::from_millis(1));
    let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticks.tick().await;
        let ack_ids = held.snapshot();
        if ack_ids.is_empty() {
            if stop.is_cancelled() {
                break;
            }
            continue;
        }
        match transport.extend_leases(&subscription, &ack_ids).await {
            Ok(()) => debug!(subscription = %subscription, count = ack_ids.len(), "extended leases"),
            Err(e) if e.is_not_found() => break,
            Err(e) => warn!(subscription = %subscription, error = %e, "failed to extend leases"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::config::SubscriberConfig;
    use crate::messaging::memory::MemoryBroker;
    use crate::messaging::message::Message;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn broker(messages: usize) -> Arc<MemoryBroker> {
        let broker = Arc::new(MemoryBroker::new().with_ack_deadline(Duration::from_secs(30)));
        broker.create_topic("jobs").await.unwrap();
        broker.create_subscription("workers", "jobs").await.unwrap();
        for i in 0..messages {
            broker.publish("jobs", Message::new(format!("job-{i}"))).await.unwrap();
        }
        broker
    }

    fn config(async_pull: bool, max_outstanding: usize) -> SubscriberConfig {
        SubscriberConfig {
            max_outstanding_messages: max_outstanding,
            num_workers: 2,
            async_pull,
            poll_interval: Duration::from_millis(10),
            shutdown_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_handler_leaves_message_unacknowledged() {
        let broker = broker(1).await;
        let subscriber = Subscriber::new("workers", broker.clone(), config(false, 4));
        let cancel = CancellationToken::new();

        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            stopper.cancel();
        });

        let result = subscriber
            .subscribe(&cancel, |_cancel: CancellationToken, _msg: ReceivedMessage| async move {
                if true {
                    panic!("handler blew up");
                }
                Ok::<(), anyhow::Error>(())
            })
            .await;

        assert!(matches!(result, Err(MessagingError::Cancelled)));
        assert!(broker.acknowledged().is_empty());
        assert_eq!(broker.unacknowledged("workers"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outstanding_ceiling_limits_concurrent_handlers() {
        let broker = broker(10).await;
        let subscriber = Subscriber::new("workers", broker.clone(), config(true, 3));
        let cancel = CancellationToken::new();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            stopper.cancel();
        });

        let (r, p) = (running.clone(), peak.clone());
        let result = subscriber
            .subscribe(&cancel, move |_cancel: CancellationToken, _msg: ReceivedMessage| {
                let (running, peak) = (r.clone(), p.clone());
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<(), anyhow::Error>(())
                }
            })
            .await;

        assert!(matches!(result, Err(MessagingError::Cancelled)));
        assert_eq!(broker.acknowledged().len(), 10);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }
}
