//! Event stream plumbing: the consumer-group seam and its Redis
//! implementation, plus the fire-and-forget delivery bus for volume events.

use async_trait::async_trait;
use cistern_core::events::{EventDelivery, VolumeEvent};
use redis::AsyncCommands;
use redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamReadOptions, StreamReadReply,
};
use std::time::Duration;
use thiserror::Error;

/// Stream errors.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// One message read from the stream. The payload is the single `payload`
/// field carrying a JSON-encoded event.
#[derive(Clone, Debug)]
pub struct StreamMessage {
    pub id: String,
    pub payload: Option<String>,
}

/// A log-structured stream read under a consumer group with per-consumer
/// pending lists.
#[async_trait]
pub trait EventStream: Send + Sync + 'static {
    /// Create the consumer group if it does not exist yet.
    async fn ensure_group(&self) -> Result<(), StreamError>;

    /// Read up to `count` new messages, blocking up to `block`.
    async fn read_batch(
        &self,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>, StreamError>;

    /// Acknowledge a processed message.
    async fn ack(&self, id: &str) -> Result<(), StreamError>;

    /// Claim messages pending longer than `min_idle` from crashed peers.
    async fn claim_idle(
        &self,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamMessage>, StreamError>;
}

/// Redis-streams implementation of [`EventStream`].
pub struct RedisEventStream {
    connection: redis::aio::MultiplexedConnection,
    stream: String,
    group: String,
}

impl RedisEventStream {
    /// Connect to Redis and bind to a stream and group.
    pub async fn connect(url: &str, stream: &str, group: &str) -> Result<Self, StreamError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            connection,
            stream: stream.to_string(),
            group: group.to_string(),
        })
    }

    fn payload_of(map: &std::collections::HashMap<String, redis::Value>) -> Option<String> {
        map.get("payload")
            .and_then(|value| redis::from_redis_value::<String>(value).ok())
    }
}

#[async_trait]
impl EventStream for RedisEventStream {
    async fn ensure_group(&self) -> Result<(), StreamError> {
        let mut conn = self.connection.clone();
        let result: Result<(), redis::RedisError> = conn
            .xgroup_create_mkstream(&self.stream, &self.group, "0")
            .await;
        match result {
            Ok(()) => Ok(()),
            // Idempotent: the group already exists.
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_batch(
        &self,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>, StreamError> {
        let mut conn = self.connection.clone();
        let options = StreamReadOptions::default()
            .group(&self.group, consumer)
            .count(count)
            .block(block.as_millis() as usize);

        let reply: StreamReadReply = conn
            .xread_options(&[&self.stream], &[">"], &options)
            .await?;

        let mut messages = Vec::new();
        for key in reply.keys {
            for entry in key.ids {
                messages.push(StreamMessage {
                    payload: Self::payload_of(&entry.map),
                    id: entry.id,
                });
            }
        }
        Ok(messages)
    }

    async fn ack(&self, id: &str) -> Result<(), StreamError> {
        let mut conn = self.connection.clone();
        let _: i64 = conn.xack(&self.stream, &self.group, &[id]).await?;
        Ok(())
    }

    async fn claim_idle(
        &self,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamMessage>, StreamError> {
        let mut conn = self.connection.clone();
        let options = StreamAutoClaimOptions::default().count(count);

        let reply: StreamAutoClaimReply = conn
            .xautoclaim_options(
                &self.stream,
                &self.group,
                consumer,
                min_idle.as_millis() as usize,
                "0",
                options,
            )
            .await?;

        Ok(reply
            .claimed
            .into_iter()
            .map(|entry| StreamMessage {
                payload: Self::payload_of(&entry.map),
                id: entry.id,
            })
            .collect())
    }
}

/// Redis-streams delivery bus for volume lifecycle events.
///
/// Callers publish from detached tasks; a lost event is a warning, never a
/// request failure.
pub struct RedisEventDelivery {
    connection: redis::aio::MultiplexedConnection,
    stream: String,
}

impl RedisEventDelivery {
    pub async fn connect(url: &str, stream: &str) -> Result<Self, StreamError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            connection,
            stream: stream.to_string(),
        })
    }
}

#[async_trait]
impl EventDelivery for RedisEventDelivery {
    async fn publish(&self, key: &str, event: &VolumeEvent) -> cistern_core::Result<()> {
        let payload = serde_json::to_string(event)
            .map_err(|e| cistern_core::Error::Serialization(e.to_string()))?;

        let mut conn = self.connection.clone();
        let result: Result<String, redis::RedisError> = conn
            .xadd(
                &self.stream,
                "*",
                &[("payload", payload.as_str()), ("key", key)],
            )
            .await;

        if let Err(e) = result {
            tracing::warn!(
                stream = %self.stream,
                event_type = %event.event_type,
                error = %e,
                "Failed to publish volume event"
            );
        }
        Ok(())
    }
}
