use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Direction, Script};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

/// Opaque acknowledgment handle of a received message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A message received from a queue. Must be acknowledged (or released)
/// through the same client that received it.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub queue: String,
    pub body: String,
    pub receipt: ReceiptHandle,
    /// 1 on first delivery, incremented on every redelivery.
    pub receive_count: u32,
}

impl QueueMessage {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, QueueError> {
        serde_json::from_str(&self.body).map_err(QueueError::Serialize)
    }
}

/// Durable at-least-once message queue.
///
/// `receive` long-polls for up to `wait` and returns an empty vector when
/// nothing arrived; that is not an error. Received messages stay invisible
/// to other consumers until acknowledged, released, or their visibility
/// timeout elapses.
#[async_trait]
pub trait QueueClient: Send + Sync {
    async fn send(&self, queue: &str, body: &str) -> Result<(), QueueError>;

    async fn receive(
        &self,
        queue: &str,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError>;

    /// Delete the message; it will not be redelivered.
    async fn ack(&self, message: &QueueMessage) -> Result<(), QueueError>;

    /// Return an unacknowledged message to the queue, visible again after
    /// `delay`.
    async fn release(&self, message: &QueueMessage, delay: Duration) -> Result<(), QueueError>;

    /// Approximate number of messages waiting to be received.
    async fn depth(&self, queue: &str) -> Result<u64, QueueError>;

    async fn health_check(&self) -> Result<(), QueueError>;
}

/// Serialize `message` as JSON and send it.
pub async fn send_json<T: Serialize + ?Sized>(
    client: &dyn QueueClient,
    queue: &str,
    message: &T,
) -> Result<(), QueueError> {
    let body = serde_json::to_string(message).map_err(QueueError::Serialize)?;
    client.send(queue, &body).await
}

/// Wire envelope; keeps identical bodies distinct and tracks redeliveries.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    id: Uuid,
    attempts: u32,
    enqueued_at: DateTime<Utc>,
    body: String,
}

fn processing_key(queue: &str) -> String {
    format!("{queue}:processing")
}

fn leases_key(queue: &str) -> String {
    format!("{queue}:leases")
}

/// Redis-backed queue with visibility timeouts.
///
/// Each queue uses three keys: the pending list `<queue>`, the in-flight list
/// `<queue>:processing`, and the lease set `<queue>:leases` scored by the
/// instant (ms since epoch) at which an in-flight message becomes visible
/// again. Every step that touches more than one key runs as a Lua script, so
/// a message is always either pending, or in flight with a lease.
pub struct RedisQueue {
    client: redis::Client,
    visibility_timeout: Duration,
    take_script: Script,
    reclaim_script: Script,
    ack_script: Script,
}

/// Move up to `ARGV[2]` pending messages in flight, leased until `ARGV[1]`.
const TAKE_SCRIPT: &str = r#"
local taken = {}
for _ = 1, tonumber(ARGV[2]) do
    local raw = redis.call('LMOVE', KEYS[1], KEYS[2], 'RIGHT', 'LEFT')
    if not raw then
        break
    end
    redis.call('ZADD', KEYS[3], ARGV[1], raw)
    taken[#taken + 1] = raw
end
return taken
"#;

/// Return in-flight messages whose lease expired before `ARGV[1]`, or that
/// have no lease at all, to the head of the pending list.
const RECLAIM_SCRIPT: &str = r#"
local function requeue(raw)
    local ok, envelope = pcall(cjson.decode, raw)
    if ok then
        envelope.attempts = envelope.attempts + 1
        raw = cjson.encode(envelope)
    end
    redis.call('RPUSH', KEYS[1], raw)
end

local reclaimed = 0
for _, raw in ipairs(redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', ARGV[1])) do
    redis.call('ZREM', KEYS[3], raw)
    if redis.call('LREM', KEYS[2], 1, raw) > 0 then
        requeue(raw)
        reclaimed = reclaimed + 1
    end
end
for _, raw in ipairs(redis.call('LRANGE', KEYS[2], 0, -1)) do
    if not redis.call('ZSCORE', KEYS[3], raw) then
        redis.call('LREM', KEYS[2], 1, raw)
        requeue(raw)
        reclaimed = reclaimed + 1
    end
end
return reclaimed
"#;

/// Drop an in-flight message and its lease.
const ACK_SCRIPT: &str = r#"
redis.call('ZREM', KEYS[2], ARGV[1])
return redis.call('LREM', KEYS[1], 1, ARGV[1])
"#;

/// Upper bound of one blocking wait, so expired leases are reclaimed during
/// long polls.
const MAX_BLOCK: Duration = Duration::from_secs(1);
const MIN_BLOCK: Duration = Duration::from_millis(10);

impl RedisQueue {
    pub fn new(redis_url: &str, visibility_timeout: Duration) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self {
            client,
            visibility_timeout,
            take_script: Script::new(TAKE_SCRIPT),
            reclaim_script: Script::new(RECLAIM_SCRIPT),
            ack_script: Script::new(ACK_SCRIPT),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }

    /// Requeue expired and orphaned in-flight messages. Returns how many were
    /// reclaimed.
    async fn reclaim_expired(
        &self,
        conn: &mut MultiplexedConnection,
        queue: &str,
    ) -> Result<usize, QueueError> {
        let reclaimed: usize = self
            .reclaim_script
            .key(queue)
            .key(processing_key(queue))
            .key(leases_key(queue))
            .arg(Utc::now().timestamp_millis())
            .invoke_async(conn)
            .await
            .map_err(QueueError::Redis)?;

        if reclaimed > 0 {
            tracing::debug!(queue, reclaimed, "Reclaimed messages with expired visibility");
        }
        Ok(reclaimed)
    }

    async fn take(
        &self,
        conn: &mut MultiplexedConnection,
        queue: &str,
        max_messages: usize,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let visible_at = Utc::now().timestamp_millis() + self.visibility_timeout.as_millis() as i64;
        let raws: Vec<String> = self
            .take_script
            .key(queue)
            .key(processing_key(queue))
            .key(leases_key(queue))
            .arg(visible_at)
            .arg(max_messages)
            .invoke_async(conn)
            .await
            .map_err(QueueError::Redis)?;

        raws.into_iter().map(|raw| leased_message(queue, raw)).collect()
    }
}

fn leased_message(queue: &str, raw: String) -> Result<QueueMessage, QueueError> {
    let envelope: Envelope = serde_json::from_str(&raw).map_err(QueueError::Serialize)?;
    Ok(QueueMessage {
        queue: queue.to_string(),
        body: envelope.body,
        receipt: ReceiptHandle::new(raw),
        receive_count: envelope.attempts + 1,
    })
}

#[async_trait]
impl QueueClient for RedisQueue {
    async fn send(&self, queue: &str, body: &str) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let envelope = Envelope {
            id: Uuid::new_v4(),
            attempts: 0,
            enqueued_at: Utc::now(),
            body: body.to_string(),
        };
        let payload = serde_json::to_string(&envelope).map_err(QueueError::Serialize)?;
        conn.lpush::<_, _, ()>(queue, &payload)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    async fn receive(
        &self,
        queue: &str,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        if max_messages == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.connection().await?;
        let deadline = Instant::now() + wait;

        loop {
            self.reclaim_expired(&mut conn, queue).await?;
            let messages = self.take(&mut conn, queue, max_messages).await?;
            if !messages.is_empty() {
                return Ok(messages);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining < MIN_BLOCK {
                return Ok(Vec::new());
            }
            // Block until the pending list is non-empty. Moving the tail back
            // onto the tail of the same list leaves it unchanged.
            let _: Option<String> = conn
                .blmove(
                    queue,
                    queue,
                    Direction::Right,
                    Direction::Right,
                    remaining.min(MAX_BLOCK).as_secs_f64(),
                )
                .await
                .map_err(QueueError::Redis)?;
        }
    }

    async fn ack(&self, message: &QueueMessage) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let removed: usize = self
            .ack_script
            .key(processing_key(&message.queue))
            .key(leases_key(&message.queue))
            .arg(message.receipt.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        if removed == 0 {
            // Lease expired and the message was redelivered before this ack.
            tracing::warn!(queue = %message.queue, "Acknowledged message was no longer in flight");
        }
        Ok(())
    }

    async fn release(&self, message: &QueueMessage, delay: Duration) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let visible_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        // XX: a lease that was already reclaimed stays gone.
        redis::cmd("ZADD")
            .arg(leases_key(&message.queue))
            .arg("XX")
            .arg(visible_at)
            .arg(message.receipt.as_str())
            .query_async::<()>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    async fn depth(&self, queue: &str) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let depth: u64 = conn.llen(queue).await.map_err(QueueError::Redis)?;
        Ok(depth)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Queue unavailable: {0}")]
    Unavailable(String),

    #[error("Unknown receipt handle: {0}")]
    UnknownReceipt(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_keeps_body_verbatim() {
        let envelope = Envelope {
            id: Uuid::new_v4(),
            attempts: 2,
            enqueued_at: Utc::now(),
            body: r#"{"fileName":"a.jpg","result":"alice"}"#.to_string(),
        };
        let raw = serde_json::to_string(&envelope).unwrap();
        let parsed: Envelope = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.body, envelope.body);
        assert_eq!(parsed.attempts, 2);
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(processing_key("jobs"), "jobs:processing");
        assert_eq!(leases_key("jobs"), "jobs:leases");
    }

    #[test]
    fn test_leased_message_counts_previous_attempts() {
        let raw = serde_json::to_string(&Envelope {
            id: Uuid::new_v4(),
            attempts: 1,
            enqueued_at: Utc::now(),
            body: "payload".to_string(),
        })
        .unwrap();

        let message = leased_message("jobs", raw.clone()).unwrap();
        assert_eq!(message.body, "payload");
        assert_eq!(message.receive_count, 2);
        assert_eq!(message.receipt.as_str(), raw);

        assert!(matches!(
            leased_message("jobs", "not an envelope".to_string()),
            Err(QueueError::Serialize(_))
        ));
    }

    fn redis_queue(visibility_timeout: Duration) -> (RedisQueue, String) {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1".to_string());
        let queue = RedisQueue::new(&url, visibility_timeout).unwrap();
        (queue, format!("test:{}", Uuid::new_v4()))
    }

    /// Requires a running Redis: `REDIS_URL=redis://127.0.0.1 cargo test -- --ignored`
    #[tokio::test]
    #[ignore]
    async fn test_redis_visibility_roundtrip() {
        let (queue, name) = redis_queue(Duration::from_millis(200));

        queue.send(&name, "payload").await.unwrap();
        assert_eq!(queue.depth(&name).await.unwrap(), 1);

        let first = queue.receive(&name, 1, Duration::from_secs(1)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].receive_count, 1);
        assert_eq!(queue.depth(&name).await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        let again = queue.receive(&name, 1, Duration::from_secs(1)).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].body, "payload");
        assert_eq!(again[0].receive_count, 2);

        queue.ack(&again[0]).await.unwrap();
        let empty = queue.receive(&name, 1, Duration::from_millis(100)).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_in_flight_messages_always_hold_a_lease() {
        let (queue, name) = redis_queue(Duration::from_secs(30));
        for body in ["one", "two", "three"] {
            queue.send(&name, body).await.unwrap();
        }

        let received = queue.receive(&name, 3, Duration::ZERO).await.unwrap();
        assert_eq!(received.len(), 3);

        let mut conn = queue.connection().await.unwrap();
        let in_flight: Vec<String> = conn.lrange(processing_key(&name), 0, -1).await.unwrap();
        assert_eq!(in_flight.len(), 3);
        for raw in &in_flight {
            let score: Option<f64> = conn.zscore(leases_key(&name), raw).await.unwrap();
            assert!(score.is_some(), "in-flight message without a lease");
        }

        for message in &received {
            queue.ack(message).await.unwrap();
        }
        let leases: usize = conn.zcard(leases_key(&name)).await.unwrap();
        let in_flight: usize = conn.llen(processing_key(&name)).await.unwrap();
        assert_eq!((leases, in_flight), (0, 0));
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_unleased_in_flight_message_is_redelivered() {
        let (queue, name) = redis_queue(Duration::from_secs(30));
        // An in-flight entry whose lease was never written.
        let raw = serde_json::to_string(&Envelope {
            id: Uuid::new_v4(),
            attempts: 0,
            enqueued_at: Utc::now(),
            body: "stranded".to_string(),
        })
        .unwrap();
        let mut conn = queue.connection().await.unwrap();
        conn.lpush::<_, _, ()>(processing_key(&name), &raw).await.unwrap();

        let received = queue.receive(&name, 1, Duration::ZERO).await.unwrap();

        assert_eq!(received.len(), 1);
        assert_eq!(received[0].body, "stranded");
        assert_eq!(received[0].receive_count, 2);
        queue.ack(&received[0]).await.unwrap();
        let in_flight: usize = conn.llen(processing_key(&name)).await.unwrap();
        assert_eq!(in_flight, 0);
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_release_after_reclaim_is_a_no_op() {
        let (queue, name) = redis_queue(Duration::from_millis(100));
        queue.send(&name, "payload").await.unwrap();
        let first = queue.receive(&name, 1, Duration::ZERO).await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        let second = queue.receive(&name, 1, Duration::ZERO).await.unwrap();
        assert_eq!(second[0].receive_count, 2);

        // The stale receipt must not resurrect a lease for a requeued copy.
        queue.release(&first[0], Duration::ZERO).await.unwrap();
        let mut conn = queue.connection().await.unwrap();
        let leases: usize = conn.zcard(leases_key(&name)).await.unwrap();
        assert_eq!(leases, 1);
    }
}
