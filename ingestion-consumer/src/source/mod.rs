mod memory;
mod redis_streams;

pub use memory::MemorySource;
pub use redis_streams::{RedisStreamConfig, RedisStreamSource};

use async_trait::async_trait;
use bytes::Bytes;
use common::error::AppError;

/// One message handed out by a [`MessageSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    /// Ordering domain within the topic; commits are issued in delivery order per partition.
    pub partition: String,
    /// Source-specific position used to commit this message.
    pub offset: String,
    pub payload: Bytes,
}

/// A queue with manual, per-message commits and at-least-once delivery.
///
/// Messages that are fetched but never committed are delivered again after a
/// restart or rebalance.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Fetch up to `max` messages across `topics`. May wait briefly and return
    /// an empty batch when nothing is available.
    async fn fetch(&self, topics: &[String], max: usize) -> Result<Vec<Delivery>, AppError>;

    async fn commit(&self, delivery: &Delivery) -> Result<(), AppError>;
}
