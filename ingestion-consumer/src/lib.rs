#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod consumer;
pub mod handler;
pub mod metrics;
pub mod source;

pub use consumer::{ConsumerConfig, HandlerMap, IngestionConsumer};
pub use handler::{DocumentEventHandler, MessageHandler, NewDocumentEvent};
pub use metrics::{ConsumerMetrics, ConsumerMetricsSnapshot};
pub use source::{Delivery, MemorySource, MessageSource, RedisStreamConfig, RedisStreamSource};
