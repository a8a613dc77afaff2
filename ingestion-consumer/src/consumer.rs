use std::{collections::HashMap, sync::Arc, time::Duration};

use common::{error::AppError, utils::config::AppConfig};
use futures::future::join_all;
use tokio::{
    sync::{Mutex, Semaphore},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    handler::MessageHandler,
    metrics::{ConsumerMetrics, ConsumerMetricsSnapshot, HandlerOutcome},
    source::{Delivery, MessageSource},
};

pub type HandlerMap = HashMap<String, Arc<dyn MessageHandler>>;

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Maximum messages per fetch.
    pub batch_size: usize,
    /// Pause after a failed fetch.
    pub error_backoff: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            error_backoff: Duration::from_secs(1),
        }
    }
}

impl ConsumerConfig {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            batch_size: cfg.consumer_batch_size.max(1),
            ..Self::default()
        }
    }
}

/// Queue consumer that commits a message only after its handler succeeded
/// (or reported a duplicate). Everything else stays uncommitted and is
/// redelivered by the source.
pub struct IngestionConsumer {
    source: Arc<dyn MessageSource>,
    config: ConsumerConfig,
    metrics: Arc<ConsumerMetrics>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    fetch_loop: Mutex<Option<JoinHandle<()>>>,
}

struct FetchLoop {
    source: Arc<dyn MessageSource>,
    handlers: Arc<HandlerMap>,
    topics: Vec<String>,
    config: ConsumerConfig,
    slots: Arc<Semaphore>,
    metrics: Arc<ConsumerMetrics>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl IngestionConsumer {
    pub fn new(source: Arc<dyn MessageSource>, config: ConsumerConfig) -> Self {
        Self {
            source,
            config,
            metrics: Arc::new(ConsumerMetrics::default()),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            fetch_loop: Mutex::new(None),
        }
    }

    /// Spawn the fetch loop for `handlers` (topic → handler), running at most
    /// `concurrency` handlers at once.
    pub async fn start(&self, handlers: HandlerMap, concurrency: usize) -> Result<(), AppError> {
        if handlers.is_empty() {
            return Err(AppError::Validation("consumer needs at least one topic".into()));
        }
        if concurrency == 0 {
            return Err(AppError::Validation(
                "consumer concurrency must be at least 1".into(),
            ));
        }

        let mut fetch_loop = self.fetch_loop.lock().await;
        if fetch_loop.is_some() || self.shutdown.is_cancelled() {
            return Err(AppError::Validation(
                "consumer can only be started once".into(),
            ));
        }

        let mut topics: Vec<String> = handlers.keys().cloned().collect();
        topics.sort();
        info!(?topics, concurrency, "ingestion consumer starting");

        let task = FetchLoop {
            source: Arc::clone(&self.source),
            handlers: Arc::new(handlers),
            topics,
            config: self.config.clone(),
            slots: Arc::new(Semaphore::new(concurrency)),
            metrics: Arc::clone(&self.metrics),
            shutdown: self.shutdown.clone(),
            tracker: self.tracker.clone(),
        };
        self.metrics.set_online(true);
        *fetch_loop = Some(tokio::spawn(task.run()));
        Ok(())
    }

    /// Stop fetching and wait for every dispatched handler to finish.
    pub async fn stop(&self) {
        self.shutdown.cancel();

        let handle = self.fetch_loop.lock().await.take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!(error = %err, "consumer fetch loop panicked");
            }
        }

        self.tracker.close();
        self.tracker.wait().await;
        self.metrics.set_online(false);
        info!("ingestion consumer stopped");
    }

    pub fn metrics(&self) -> ConsumerMetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl FetchLoop {
    async fn run(self) {
        loop {
            let fetched = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                fetched = self.source.fetch(&self.topics, self.config.batch_size) => fetched,
            };

            match fetched {
                Ok(batch) if batch.is_empty() => {}
                Ok(batch) => {
                    self.metrics.record_consumed(batch.len());
                    self.process_batch(batch).await;
                }
                Err(err) => {
                    warn!(error = %err, "fetch failed; backing off");
                    tokio::select! {
                        () = self.shutdown.cancelled() => break,
                        () = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                }
            }
        }
        debug!("consumer fetch loop exited");
    }

    /// Dispatch every delivery under a pool permit, join them, then commit the
    /// successful ones in delivery order.
    async fn process_batch(&self, batch: Vec<Delivery>) {
        let mut dispatched = Vec::with_capacity(batch.len());

        for delivery in batch {
            let permit = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => {
                    debug!(topic = %delivery.topic, offset = %delivery.offset, "shutdown before dispatch; left uncommitted");
                    break;
                }
                permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let handler = self.handlers.get(&delivery.topic).cloned();
            let span = info_span!(
                "consume",
                topic = %delivery.topic,
                partition = %delivery.partition,
                offset = %delivery.offset
            );
            let message = delivery.clone();
            let task = self.tracker.spawn(
                async move {
                    let _permit = permit;
                    let started = Instant::now();
                    let result = match handler {
                        Some(handler) => handler.handle(&message).await,
                        None => Err(AppError::Validation(format!(
                            "no handler registered for topic {}",
                            message.topic
                        ))),
                    };
                    (result, started.elapsed())
                }
                .instrument(span),
            );
            dispatched.push((delivery, task));
        }

        let (deliveries, tasks): (Vec<_>, Vec<_>) = dispatched.into_iter().unzip();
        let results = join_all(tasks).await;

        for (delivery, joined) in deliveries.iter().zip(results) {
            let (result, latency) = match joined {
                Ok(done) => done,
                Err(err) => (
                    Err(AppError::InternalError(format!("handler task failed: {err}"))),
                    Duration::ZERO,
                ),
            };

            match result {
                Ok(()) => {
                    self.metrics.record_handled(HandlerOutcome::Processed, latency);
                    self.commit(delivery).await;
                }
                Err(err) if err.is_duplicate() => {
                    self.metrics.record_handled(HandlerOutcome::Duplicate, latency);
                    info!(topic = %delivery.topic, offset = %delivery.offset, "duplicate document; committing");
                    self.commit(delivery).await;
                }
                Err(err) => {
                    self.metrics.record_handled(HandlerOutcome::Failed, latency);
                    warn!(
                        topic = %delivery.topic,
                        offset = %delivery.offset,
                        error = %err,
                        "handler failed; message left uncommitted"
                    );
                }
            }
        }
    }

    async fn commit(&self, delivery: &Delivery) {
        if let Err(err) = self.source.commit(delivery).await {
            warn!(
                topic = %delivery.topic,
                offset = %delivery.offset,
                error = %err,
                "commit failed; message will be redelivered"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use common::storage::{db::SurrealDbClient, types::document_meta::DocumentMeta};
    use uuid::Uuid;

    use super::*;
    use crate::{handler::DocumentEventHandler, source::MemorySource};

    const TOPIC: &str = "documents.new";

    /// Fails the first `failures` calls, sleeps `delay` on each call and
    /// tracks the peak number of concurrent calls.
    #[derive(Default)]
    struct ScriptedHandler {
        failures: AtomicUsize,
        delay: Duration,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        finished: AtomicUsize,
    }

    impl ScriptedHandler {
        fn failing(failures: usize) -> Self {
            Self {
                failures: AtomicUsize::new(failures),
                ..Self::default()
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl MessageHandler for ScriptedHandler {
        async fn handle(&self, _delivery: &Delivery) -> Result<(), AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.finished.fetch_add(1, Ordering::SeqCst);

            let should_fail = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if should_fail {
                Err(AppError::Processing("transient handler failure".into()))
            } else {
                Ok(())
            }
        }
    }

    fn handlers(handler: Arc<dyn MessageHandler>) -> HandlerMap {
        HashMap::from([(TOPIC.to_string(), handler)])
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn wait_for_commits(source: &MemorySource, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while source.commit_log().await.len() < count {
            assert!(Instant::now() < deadline, "expected {count} commits");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_successful_messages_are_committed_in_order() {
        let source = Arc::new(MemorySource::new());
        for i in 0..4 {
            source.publish(TOPIC, format!("m{i}")).await;
        }

        let consumer = IngestionConsumer::new(source.clone(), ConsumerConfig::default());
        let handler = Arc::new(ScriptedHandler::default());
        consumer.start(handlers(handler.clone()), 2).await.expect("start");

        wait_for_commits(&source, 4).await;
        consumer.stop().await;

        let offsets: Vec<String> = source
            .commit_log()
            .await
            .into_iter()
            .map(|(_, offset)| offset)
            .collect();
        assert_eq!(offsets, vec!["0", "1", "2", "3"]);

        let metrics = consumer.metrics();
        assert_eq!(metrics.consumed, 4);
        assert_eq!(metrics.processed, 4);
        assert_eq!(metrics.failed, 0);
        assert!(metrics.last_processed_at.is_some());
        assert!(!metrics.online);
    }

    #[tokio::test]
    async fn test_duplicate_is_committed_once_without_new_row() {
        let db = Arc::new(
            SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
                .await
                .expect("in-memory surrealdb"),
        );
        db.ensure_initialized().await.expect("indexes");

        let source = Arc::new(MemorySource::new());
        for doc_id in ["doc-1", "doc-2"] {
            let payload = serde_json::json!({
                "doc_id": doc_id,
                "workspace_id": "ws-1",
                "sha256": "same-content",
                "stored_path": format!("ws-1/{doc_id}.pdf"),
            })
            .to_string();
            source.publish(TOPIC, payload).await;
        }

        let consumer = IngestionConsumer::new(source.clone(), ConsumerConfig::default());
        let handler = Arc::new(DocumentEventHandler::new(Arc::clone(&db)));
        consumer.start(handlers(handler), 1).await.expect("start");

        wait_for_commits(&source, 2).await;
        consumer.stop().await;

        let duplicate_commits = source
            .commit_log()
            .await
            .into_iter()
            .filter(|(_, offset)| offset == "1")
            .count();
        assert_eq!(duplicate_commits, 1);

        let rows: Vec<DocumentMeta> = db.get_all_stored_items().await.expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "doc-1");

        let metrics = consumer.metrics();
        assert_eq!(metrics.processed, 1);
        assert_eq!(metrics.duplicates, 1);
    }

    #[tokio::test]
    async fn test_failed_message_stays_uncommitted_until_redelivered() {
        let source = Arc::new(MemorySource::new());
        source.publish(TOPIC, "m0").await;

        let consumer = IngestionConsumer::new(source.clone(), ConsumerConfig::default());
        let handler = Arc::new(ScriptedHandler::failing(1));
        consumer.start(handlers(handler.clone()), 1).await.expect("start");

        wait_for(|| consumer.metrics().failed == 1).await;
        assert!(source.committed(TOPIC).await.is_empty());
        assert_eq!(source.uncommitted(TOPIC).await, 1);

        source.rebalance().await;
        wait_for_commits(&source, 1).await;
        consumer.stop().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        let metrics = consumer.metrics();
        assert_eq!((metrics.failed, metrics.processed), (1, 1));
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let source = Arc::new(MemorySource::new());
        for i in 0..8 {
            source.publish(TOPIC, format!("m{i}")).await;
        }

        let consumer = IngestionConsumer::new(source.clone(), ConsumerConfig::default());
        let handler = Arc::new(ScriptedHandler::slow(Duration::from_millis(30)));
        consumer.start(handlers(handler.clone()), 3).await.expect("start");

        wait_for_commits(&source, 8).await;
        consumer.stop().await;

        let peak = handler.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak concurrency was {peak}");
        assert!(peak >= 2, "handlers never overlapped");
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_handlers() {
        let source = Arc::new(MemorySource::new());
        source.publish(TOPIC, "slow").await;

        let consumer = IngestionConsumer::new(source.clone(), ConsumerConfig::default());
        let handler = Arc::new(ScriptedHandler::slow(Duration::from_millis(150)));
        consumer.start(handlers(handler.clone()), 1).await.expect("start");

        wait_for(|| handler.calls.load(Ordering::SeqCst) == 1).await;
        consumer.stop().await;

        assert_eq!(handler.finished.load(Ordering::SeqCst), 1);
        assert_eq!(source.committed(TOPIC).await, vec!["0".to_string()]);
    }

    #[tokio::test]
    async fn test_start_rejects_second_call_and_bad_arguments() {
        let source = Arc::new(MemorySource::new());
        let consumer = IngestionConsumer::new(source, ConsumerConfig::default());
        let handler: Arc<dyn MessageHandler> = Arc::new(ScriptedHandler::default());

        assert!(matches!(
            consumer.start(handlers(handler.clone()), 0).await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            consumer.start(HashMap::new(), 1).await,
            Err(AppError::Validation(_))
        ));

        consumer.start(handlers(handler.clone()), 1).await.expect("start");
        assert!(matches!(
            consumer.start(handlers(handler), 1).await,
            Err(AppError::Validation(_))
        ));
        consumer.stop().await;
    }
}
