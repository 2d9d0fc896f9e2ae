// Redis-Streams event bus for horizontal scaling.
//
// One stream, one consumer group, one consumer per instance. Entries are
// ACKed only after every handler succeeds, so a crash between delivery and
// ACK leaves the entry pending for a surviving consumer to reclaim.
// Entries redelivered MAX_RETRIES times move to the dead-letter stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamMaxlen, StreamPendingCountReply, StreamRangeReply, StreamReadOptions,
    StreamReadReply,
};
use redis::AsyncCommands;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{EventBus, EventHandler, RepositoryEvent};
use crate::error::{Result, TitanError};

pub const STREAM_NAME: &str = "titan:events";
pub const CONSUMER_GROUP: &str = "titan-workers";
pub const DEAD_LETTER_STREAM: &str = "titan:events:dead";

const BATCH_SIZE: usize = 10;
const BLOCK_MS: usize = 1000;
const CLAIM_IDLE_MS: usize = 30_000;
const MAX_RETRIES: usize = 3;
const STREAM_MAXLEN: usize = 100_000;

/// Unique consumer id for this instance: hostname plus a random suffix.
fn generate_consumer_id() -> String {
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "titan".to_string());
    let suffix: u32 = rand::thread_rng().gen();
    format!("{hostname}-{suffix:08x}")
}

pub struct RedisStreamEventBus {
    redis: ConnectionManager,
    stream_name: String,
    consumer_group: String,
    consumer_id: String,
    handlers: Arc<RwLock<Vec<Arc<dyn EventHandler>>>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RedisStreamEventBus {
    pub fn new(redis: ConnectionManager) -> Self {
        Self::with_names(redis, STREAM_NAME, CONSUMER_GROUP, None)
    }

    pub fn with_names(
        redis: ConnectionManager,
        stream_name: &str,
        consumer_group: &str,
        consumer_id: Option<String>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            redis,
            stream_name: stream_name.to_string(),
            consumer_group: consumer_group.to_string(),
            consumer_id: consumer_id.unwrap_or_else(generate_consumer_id),
            handlers: Arc::new(RwLock::new(Vec::new())),
            shutdown,
            task: Mutex::new(None),
        }
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    /// Create the stream and consumer group if they do not exist yet.
    async fn ensure_stream_and_group(&self) -> Result<()> {
        let mut redis = self.redis.clone();
        let created: redis::RedisResult<()> = redis
            .xgroup_create_mkstream(&self.stream_name, &self.consumer_group, "0")
            .await;
        match created {
            Ok(()) => {
                info!(
                    stream = %self.stream_name,
                    group = %self.consumer_group,
                    "created consumer group"
                );
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(group = %self.consumer_group, "consumer group already exists");
                Ok(())
            }
            Err(e) => Err(TitanError::Unavailable(e.to_string())),
        }
    }

    /// Number of entries currently pending in the group.
    pub async fn pending_count(&self) -> Result<usize> {
        let mut redis = self.redis.clone();
        let reply: StreamPendingCountReply = redis
            .xpending_count(
                &self.stream_name,
                &self.consumer_group,
                "-",
                "+",
                BATCH_SIZE,
            )
            .await
            .map_err(|e| TitanError::Unavailable(e.to_string()))?;
        Ok(reply.ids.len())
    }

    pub async fn health_check(&self) -> bool {
        let mut redis = self.redis.clone();
        let len: redis::RedisResult<usize> = redis.xlen(&self.stream_name).await;
        len.is_ok()
    }
}

struct ConsumeLoop {
    redis: ConnectionManager,
    stream_name: String,
    consumer_group: String,
    consumer_id: String,
    handlers: Arc<RwLock<Vec<Arc<dyn EventHandler>>>>,
}

impl ConsumeLoop {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            // Reclaim work from dead consumers before reading new entries.
            if let Err(e) = self.claim_pending().await {
                warn!("error claiming pending entries: {e}");
            }

            let options = StreamReadOptions::default()
                .group(&self.consumer_group, &self.consumer_id)
                .count(BATCH_SIZE)
                .block(BLOCK_MS);
            let read: redis::RedisResult<StreamReadReply> = self
                .redis
                .xread_options(&[&self.stream_name], &[">"], &options)
                .await;

            match read {
                Ok(reply) => {
                    for key in reply.keys {
                        for entry in key.ids {
                            self.process_entry(&entry.id, &entry.map).await;
                        }
                    }
                }
                Err(e) => {
                    error!("error in consume loop: {e}");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }
        info!(consumer = %self.consumer_id, "consume loop stopped");
    }

    /// Claim entries pending longer than CLAIM_IDLE_MS; dead-letter those
    /// already delivered MAX_RETRIES times.
    async fn claim_pending(&mut self) -> anyhow::Result<()> {
        let pending: StreamPendingCountReply = self
            .redis
            .xpending_count(
                &self.stream_name,
                &self.consumer_group,
                "-",
                "+",
                BATCH_SIZE,
            )
            .await?;

        for entry in pending.ids {
            if entry.last_delivered_ms <= CLAIM_IDLE_MS {
                continue;
            }
            if entry.times_delivered >= MAX_RETRIES {
                self.move_to_dead_letter(&entry.id).await?;
                continue;
            }
            let claimed: StreamClaimReply = self
                .redis
                .xclaim(
                    &self.stream_name,
                    &self.consumer_group,
                    &self.consumer_id,
                    CLAIM_IDLE_MS,
                    &[&entry.id],
                )
                .await?;
            for claimed_entry in claimed.ids {
                self.process_entry(&claimed_entry.id, &claimed_entry.map).await;
            }
        }
        Ok(())
    }

    async fn process_entry(&mut self, entry_id: &str, fields: &HashMap<String, redis::Value>) {
        let Some(data) = fields.get("data").and_then(value_bytes) else {
            warn!(entry_id, "stream entry has no data field, acking");
            self.ack(entry_id).await;
            return;
        };

        let event: RepositoryEvent = match serde_json::from_slice(&data) {
            Ok(event) => event,
            Err(e) => {
                // Undecodable entries would loop forever; dead-letter them.
                error!(entry_id, "undecodable event, dead-lettering: {e}");
                if let Err(e) = self.move_to_dead_letter(entry_id).await {
                    error!(entry_id, "failed to dead-letter: {e}");
                }
                return;
            }
        };

        let handlers = self.handlers.read().await.clone();
        for handler in handlers {
            if let Err(e) = handler.handle(&event).await {
                // Not ACKed: stays pending for a later reclaim.
                error!(
                    handler = handler.name(),
                    event_id = %event.event_id,
                    "handler failed, leaving entry pending: {e:#}"
                );
                return;
            }
        }
        self.ack(entry_id).await;
        debug!(entry_id, event_id = %event.event_id, "processed and acked");
    }

    async fn ack(&mut self, entry_id: &str) {
        let acked: redis::RedisResult<usize> = self
            .redis
            .xack(&self.stream_name, &self.consumer_group, &[entry_id])
            .await;
        if let Err(e) = acked {
            error!(entry_id, "failed to ack entry: {e}");
        }
    }

    async fn move_to_dead_letter(&mut self, entry_id: &str) -> anyhow::Result<()> {
        let range: StreamRangeReply = self.redis.xrange(&self.stream_name, entry_id, entry_id).await?;
        if let Some(entry) = range.ids.first() {
            let mut fields: Vec<(String, Vec<u8>)> = vec![
                ("original_id".to_string(), entry_id.as_bytes().to_vec()),
                (
                    "original_stream".to_string(),
                    self.stream_name.as_bytes().to_vec(),
                ),
            ];
            for (key, value) in &entry.map {
                if let Some(bytes) = value_bytes(value) {
                    fields.push((key.clone(), bytes));
                }
            }
            let _: String = self.redis.xadd(DEAD_LETTER_STREAM, "*", &fields).await?;
            warn!(entry_id, "moved entry to dead letter stream");
        }
        let _: usize = self
            .redis
            .xack(&self.stream_name, &self.consumer_group, &[entry_id])
            .await?;
        Ok(())
    }
}

fn value_bytes(value: &redis::Value) -> Option<Vec<u8>> {
    match value {
        redis::Value::BulkString(bytes) => Some(bytes.clone()),
        redis::Value::SimpleString(s) => Some(s.as_bytes().to_vec()),
        _ => None,
    }
}

#[async_trait]
impl EventBus for RedisStreamEventBus {
    async fn publish(&self, event: RepositoryEvent) -> Result<()> {
        let payload = serde_json::to_vec(&event)
            .map_err(|e| TitanError::Internal(anyhow::Error::new(e)))?;
        let mut redis = self.redis.clone();
        let entry_id: String = redis
            .xadd_maxlen(
                &self.stream_name,
                StreamMaxlen::Approx(STREAM_MAXLEN),
                "*",
                &[("data", payload)],
            )
            .await
            .map_err(|e| TitanError::Unavailable(e.to_string()))?;
        debug!(event_id = %event.event_id, entry_id, "published event");
        Ok(())
    }

    async fn subscribe(&self, handler: Arc<dyn EventHandler>) {
        info!("registered event handler: {}", handler.name());
        self.handlers.write().await.push(handler);
    }

    async fn start(&self) -> Result<()> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Ok(());
        }
        self.ensure_stream_and_group().await?;

        let consume = ConsumeLoop {
            redis: self.redis.clone(),
            stream_name: self.stream_name.clone(),
            consumer_group: self.consumer_group.clone(),
            consumer_id: self.consumer_id.clone(),
            handlers: Arc::clone(&self.handlers),
        };
        let shutdown = self.shutdown.subscribe();
        *task = Some(tokio::spawn(consume.run(shutdown)));
        info!(
            consumer = %self.consumer_id,
            group = %self.consumer_group,
            "started stream consumer"
        );
        Ok(())
    }

    async fn stop(&self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_id_shape() {
        let id = generate_consumer_id();
        let (_, suffix) = id.rsplit_once('-').unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_value_bytes_variants() {
        assert_eq!(
            value_bytes(&redis::Value::BulkString(b"abc".to_vec())),
            Some(b"abc".to_vec())
        );
        assert_eq!(
            value_bytes(&redis::Value::SimpleString("ok".into())),
            Some(b"ok".to_vec())
        );
        assert_eq!(value_bytes(&redis::Value::Nil), None);
    }
}
