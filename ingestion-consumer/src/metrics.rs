use std::{
    sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
    time::Duration,
};

use chrono::{DateTime, TimeZone, Utc};

/// Counters and gauges for one consumer. All updates are lock-free.
#[derive(Debug, Default)]
pub struct ConsumerMetrics {
    consumed: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    duplicates: AtomicU64,
    last_latency_ms: AtomicU64,
    total_latency_ms: AtomicU64,
    /// Unix millis; 0 until the first message is handled.
    last_processed_at_ms: AtomicI64,
    online: AtomicBool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerMetricsSnapshot {
    pub consumed: u64,
    pub processed: u64,
    pub failed: u64,
    pub duplicates: u64,
    pub last_latency_ms: u64,
    pub avg_latency_ms: f64,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub online: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    Processed,
    Duplicate,
    Failed,
}

impl ConsumerMetrics {
    pub fn record_consumed(&self, count: usize) {
        self.consumed
            .fetch_add(u64::try_from(count).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    pub fn record_handled(&self, outcome: HandlerOutcome, latency: Duration) {
        let counter = match outcome {
            HandlerOutcome::Processed => &self.processed,
            HandlerOutcome::Duplicate => &self.duplicates,
            HandlerOutcome::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.last_latency_ms.store(latency_ms, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.last_processed_at_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Relaxed);
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn snapshot(&self) -> ConsumerMetricsSnapshot {
        let processed = self.processed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let duplicates = self.duplicates.load(Ordering::Relaxed);
        let handled = processed.saturating_add(failed).saturating_add(duplicates);
        let total_latency = self.total_latency_ms.load(Ordering::Relaxed);
        let last_ms = self.last_processed_at_ms.load(Ordering::Relaxed);

        ConsumerMetricsSnapshot {
            consumed: self.consumed.load(Ordering::Relaxed),
            processed,
            failed,
            duplicates,
            last_latency_ms: self.last_latency_ms.load(Ordering::Relaxed),
            avg_latency_ms: if handled == 0 {
                0.0
            } else {
                total_latency as f64 / handled as f64
            },
            last_processed_at: (last_ms > 0)
                .then(|| Utc.timestamp_millis_opt(last_ms).single())
                .flatten(),
            online: self.online.load(Ordering::Relaxed),
        }
    }
}
