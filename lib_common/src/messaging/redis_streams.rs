//! # Redis Streams Transport
//!
//! Maps the broker model onto Redis Streams:
//!
//! - a topic is the stream `<project>:topic:<id>`;
//! - a subscription is a consumer group on that stream, recorded in the hash
//!   `<project>:subscriptions` (subscription id -> topic id);
//! - the server-assigned message id is the stream entry id;
//! - an entry left pending longer than the ack deadline is claimed again
//!   with `XAUTOCLAIM`, which is how unacknowledged messages get redelivered.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamAutoClaimReply, StreamId, StreamReadReply};
use redis::{AsyncCommands, RedisError, Script};

use super::message::{Attributes, Message, ReceivedMessage};
use super::transport::{BrokerTransport, ResourceKind, TransportError};

const DATA_FIELD: &str = "data";
const ATTRIBUTE_PREFIX: &str = "attr:";

/// Creates an empty stream, or reports that one is already there.
const CREATE_TOPIC_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
redis.call('XADD', KEYS[1], '*', 'init', '1')
redis.call('XTRIM', KEYS[1], 'MAXLEN', 0)
return 1
"#;

pub struct RedisStreamsTransport {
    conn: ConnectionManager,
    project_id: String,
    consumer: String,
    ack_deadline: Duration,
    create_topic: Script,
}

impl RedisStreamsTransport {
    pub fn new(conn: ConnectionManager, project_id: &str, ack_deadline: Duration) -> Self {
        Self {
            conn,
            project_id: project_id.to_string(),
            consumer: consumer_name(),
            ack_deadline,
            create_topic: Script::new(CREATE_TOPIC_SCRIPT),
        }
    }

    fn topic_key(&self, topic: &str) -> String {
        topic_key(&self.project_id, topic)
    }

    fn subscriptions_key(&self) -> String {
        subscriptions_key(&self.project_id)
    }

    /// The topic a subscription is bound to.
    async fn bound_topic(&self, subscription: &str) -> Result<String, TransportError> {
        let mut conn = self.conn.clone();
        let topic: Option<String> = conn
            .hget(self.subscriptions_key(), subscription)
            .await
            .map_err(backend)?;
        topic.ok_or_else(|| TransportError::not_found(ResourceKind::Subscription, subscription))
    }
}

#[async_trait]
impl BrokerTransport for RedisStreamsTransport {
    async fn topic_exists(&self, topic: &str) -> Result<bool, TransportError> {
        let mut conn = self.conn.clone();
        let kind: String = redis::cmd("TYPE")
            .arg(self.topic_key(topic))
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(kind == "stream")
    }

    async fn create_topic(&self, topic: &str) -> Result<(), TransportError> {
        let mut conn = self.conn.clone();
        let created: i64 = self
            .create_topic
            .key(self.topic_key(topic))
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        if created == 1 {
            Ok(())
        } else {
            Err(TransportError::already_exists(ResourceKind::Topic, topic))
        }
    }

    async fn subscription_exists(&self, subscription: &str) -> Result<bool, TransportError> {
        let mut conn = self.conn.clone();
        conn.hexists(self.subscriptions_key(), subscription)
            .await
            .map_err(backend)
    }

    async fn create_subscription(&self, subscription: &str, topic: &str) -> Result<(), TransportError> {
        if !self.topic_exists(topic).await? {
            return Err(TransportError::not_found(ResourceKind::Topic, topic));
        }

        let mut conn = self.conn.clone();
        let registered: bool = conn
            .hset_nx(self.subscriptions_key(), subscription, topic)
            .await
            .map_err(backend)?;
        if !registered {
            return Err(TransportError::already_exists(ResourceKind::Subscription, subscription));
        }

        let created: Result<(), RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(self.topic_key(topic))
            .arg(subscription)
            .arg("$")
            .query_async(&mut conn)
            .await;
        match created {
            Ok(()) => Ok(()),
            // A group left over from an earlier registration keeps its position.
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => {
                let _: Result<(), RedisError> = conn.hdel(self.subscriptions_key(), subscription).await;
                Err(backend(e))
            }
        }
    }

    async fn publish(&self, topic: &str, message: Message) -> Result<String, TransportError> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(self.topic_key(topic))
            .arg("NOMKSTREAM")
            .arg("*")
            .arg(DATA_FIELD)
            .arg(message.data.as_ref());
        for (key, value) in &message.attributes {
            cmd.arg(format!("{}{}", ATTRIBUTE_PREFIX, key)).arg(value);
        }

        let mut conn = self.conn.clone();
        let id: Option<String> = cmd.query_async(&mut conn).await.map_err(backend)?;
        id.ok_or_else(|| TransportError::not_found(ResourceKind::Topic, topic))
    }

    async fn pull(&self, subscription: &str, max_messages: usize) -> Result<Vec<ReceivedMessage>, TransportError> {
        let topic = self.bound_topic(subscription).await?;
        let stream = self.topic_key(&topic);
        let count = max_messages.max(1);
        let mut conn = self.conn.clone();

        let claimed: StreamAutoClaimReply = redis::cmd("XAUTOCLAIM")
            .arg(&stream)
            .arg(subscription)
            .arg(&self.consumer)
            .arg(self.ack_deadline.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(|e| group_error(e, subscription))?;

        if !claimed.claimed.is_empty() {
            return Ok(claimed
                .claimed
                .iter()
                .map(|entry| received(entry, true))
                .collect());
        }

        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(subscription)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(count)
            .arg("STREAMS")
            .arg(&stream)
            .arg(">")
            .query_async(&mut conn)
            .await
            .map_err(|e| group_error(e, subscription))?;

        Ok(reply
            .into_iter()
            .flat_map(|reply| reply.keys)
            .flat_map(|key| key.ids)
            .map(|entry| received(&entry, false))
            .collect())
    }

    async fn acknowledge(&self, subscription: &str, ack_ids: &[String]) -> Result<(), TransportError> {
        if ack_ids.is_empty() {
            return Ok(());
        }
        let topic = self.bound_topic(subscription).await?;
        let mut conn = self.conn.clone();
        let _acked: i64 = conn
            .xack(self.topic_key(&topic), subscription, ack_ids)
            .await
            .map_err(|e| group_error(e, subscription))?;
        Ok(())
    }

    fn ack_deadline(&self) -> Option<Duration> {
        Some(self.ack_deadline)
    }

    /// `XCLAIM ... 0 <ids> JUSTID` resets the idle time of entries still
    /// pending, so `XAUTOCLAIM` leaves them alone. Acked ids are skipped by Redis.
    async fn extend_leases(&self, subscription: &str, ack_ids: &[String]) -> Result<(), TransportError> {
        if ack_ids.is_empty() {
            return Ok(());
        }
        let topic = self.bound_topic(subscription).await?;
        let mut conn = self.conn.clone();
        let _claimed: Vec<String> = redis::cmd("XCLAIM")
            .arg(self.topic_key(&topic))
            .arg(subscription)
            .arg(&self.consumer)
            .arg(0)
            .arg(ack_ids)
            .arg("JUSTID")
            .query_async(&mut conn)
            .await
            .map_err(|e| group_error(e, subscription))?;
        Ok(())
    }
}

fn topic_key(project_id: &str, topic: &str) -> String {
    format!("{}:topic:{}", project_id, topic)
}

fn subscriptions_key(project_id: &str) -> String {
    format!("{}:subscriptions", project_id)
}

/// `<hostname>-<pid>`, unique per process on a host.
fn consumer_name() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "consumer".to_string());
    format!("{}-{}", host, std::process::id())
}

fn received(entry: &StreamId, redelivered: bool) -> ReceivedMessage {
    let data: Vec<u8> = entry.get(DATA_FIELD).unwrap_or_default();
    let attributes: Attributes = entry
        .map
        .keys()
        .filter_map(|field| {
            let name = field.strip_prefix(ATTRIBUTE_PREFIX)?;
            let value: String = entry.get(field)?;
            Some((name.to_string(), value))
        })
        .collect();

    ReceivedMessage {
        id: entry.id.clone(),
        ack_id: entry.id.clone(),
        message: Message::new(data).with_attributes(attributes),
        redelivered,
    }
}

fn backend(e: RedisError) -> TransportError {
    TransportError::Backend(Box::new(e))
}

/// A vanished consumer group means the subscription is gone.
fn group_error(e: RedisError, subscription: &str) -> TransportError {
    if e.code() == Some("NOGROUP") {
        TransportError::not_found(ResourceKind::Subscription, subscription)
    } else {
        backend(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_namespaced_by_project() {
        assert_eq!(topic_key("local-project", "client-events"), "local-project:topic:client-events");
        assert_eq!(subscriptions_key("local-project"), "local-project:subscriptions");
        assert_ne!(topic_key("a", "t"), topic_key("b", "t"));
    }

    #[test]
    fn test_consumer_name_ends_with_pid() {
        let name = consumer_name();
        assert!(name.ends_with(&format!("-{}", std::process::id())));
    }
}
