use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use common::{error::AppError, utils::config::AppConfig};
use redis::{
    aio::MultiplexedConnection,
    streams::{StreamId, StreamReadOptions, StreamReadReply},
    AsyncCommands,
};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{Delivery, MessageSource};

/// Stream entry field carrying the JSON payload.
const PAYLOAD_FIELD: &str = "data";

#[derive(Debug, Clone)]
pub struct RedisStreamConfig {
    pub url: String,
    pub group: String,
    pub consumer: String,
    pub block: Duration,
}

impl RedisStreamConfig {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            url: cfg.redis_url.clone(),
            group: cfg.consumer_group.clone(),
            consumer: cfg.consumer_name.clone(),
            block: Duration::from_millis(cfg.consumer_block_ms),
        }
    }
}

/// Redis Streams consumer-group source. Topics are stream keys, each stream is
/// one partition and offsets are entry ids.
///
/// On startup the consumer's own pending entries list is read first, so
/// entries fetched but never acknowledged before a restart come back.
pub struct RedisStreamSource {
    config: RedisStreamConfig,
    conn: MultiplexedConnection,
    groups: Mutex<HashSet<String>>,
    /// Per stream: `Some(id)` while replaying pending entries after `id`, `None` once caught up.
    pending_cursor: Mutex<HashMap<String, Option<String>>>,
}

fn queue_error(context: &str, err: &redis::RedisError) -> AppError {
    AppError::Queue(format!("{context}: {err}"))
}

impl RedisStreamSource {
    pub async fn connect(config: RedisStreamConfig) -> Result<Self, AppError> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| queue_error("failed to create Redis client", &e))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| queue_error("failed to connect to Redis", &e))?;

        info!(group = %config.group, consumer = %config.consumer, "connected to Redis streams");
        Ok(Self {
            config,
            conn,
            groups: Mutex::new(HashSet::new()),
            pending_cursor: Mutex::new(HashMap::new()),
        })
    }

    /// Create the consumer group (and stream) once per topic. BUSYGROUP means it already exists.
    async fn ensure_group(&self, topic: &str) -> Result<(), AppError> {
        let mut groups = self.groups.lock().await;
        if groups.contains(topic) {
            return Ok(());
        }

        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(topic)
            .arg(&self.config.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        if let Err(err) = result {
            if !err.to_string().contains("BUSYGROUP") {
                return Err(queue_error("failed to create consumer group", &err));
            }
        }

        groups.insert(topic.to_string());
        Ok(())
    }

    fn to_delivery(topic: &str, entry: &StreamId) -> Delivery {
        let payload = entry
            .get::<Vec<u8>>(PAYLOAD_FIELD)
            .map_or_else(|| fields_as_json(entry), Bytes::from);
        Delivery {
            topic: topic.to_string(),
            partition: topic.to_string(),
            offset: entry.id.clone(),
            payload,
        }
    }
}

/// Entries written field by field (no `data` field) become a flat JSON object of strings.
fn fields_as_json(entry: &StreamId) -> Bytes {
    let object: serde_json::Map<String, serde_json::Value> = entry
        .map
        .iter()
        .filter_map(|(key, value)| {
            redis::from_redis_value::<String>(value)
                .ok()
                .map(|text| (key.clone(), serde_json::Value::String(text)))
        })
        .collect();
    Bytes::from(serde_json::Value::Object(object).to_string())
}

#[async_trait]
impl MessageSource for RedisStreamSource {
    async fn fetch(&self, topics: &[String], max: usize) -> Result<Vec<Delivery>, AppError> {
        for topic in topics {
            self.ensure_group(topic).await?;
        }

        let ids: Vec<String> = {
            let mut cursors = self.pending_cursor.lock().await;
            topics
                .iter()
                .map(|topic| {
                    cursors
                        .entry(topic.clone())
                        .or_insert_with(|| Some("0".to_string()))
                        .clone()
                        .unwrap_or_else(|| ">".to_string())
                })
                .collect()
        };
        let replaying = ids.iter().any(|id| id != ">");

        let mut options = StreamReadOptions::default()
            .group(&self.config.group, &self.config.consumer)
            .count(max.max(1));
        if !replaying {
            let block_ms = usize::try_from(self.config.block.as_millis()).unwrap_or(usize::MAX);
            options = options.block(block_ms);
        }

        let mut conn = self.conn.clone();
        let reply: Option<StreamReadReply> = conn
            .xread_options(topics, ids.as_slice(), &options)
            .await
            .map_err(|e| queue_error("XREADGROUP failed", &e))?;
        let reply = reply.unwrap_or_default();

        let mut cursors = self.pending_cursor.lock().await;
        let mut batch = Vec::new();
        for (topic, id) in topics.iter().zip(&ids) {
            let entries: &[StreamId] = reply
                .keys
                .iter()
                .find(|key| key.key == *topic)
                .map(|key| key.ids.as_slice())
                .unwrap_or_default();

            if id != ">" {
                let next = entries.last().map(|entry| entry.id.clone());
                if next.is_none() {
                    debug!(%topic, "pending entries replayed");
                }
                cursors.insert(topic.clone(), next);
            }

            batch.extend(entries.iter().map(|entry| Self::to_delivery(topic, entry)));
        }

        Ok(batch)
    }

    async fn commit(&self, delivery: &Delivery) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .xack(
                &delivery.topic,
                &self.config.group,
                std::slice::from_ref(&delivery.offset),
            )
            .await
            .map_err(|e| queue_error("XACK failed", &e))?;
        Ok(())
    }
}
