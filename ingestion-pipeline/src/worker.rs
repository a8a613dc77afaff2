//! Pending-document scanner and the bounded, retrying worker pool behind it.

use std::{sync::Arc, time::Duration};

use common::{
    error::AppError,
    storage::{db::SurrealDbClient, types::document_meta::DocumentMeta},
    utils::config::AppConfig,
};
use tokio::sync::Semaphore;
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    RetryIf,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::pipeline::PipelineOrchestrator;

#[derive(Debug, Clone)]
pub struct WorkerTuning {
    pub concurrency: usize,
    pub scan_interval: Duration,
    pub scan_batch_size: usize,
    /// Retries after the first attempt.
    pub max_retries: usize,
    pub retry_backoff: Duration,
    pub retry_max_backoff: Duration,
}

impl Default for WorkerTuning {
    fn default() -> Self {
        Self {
            concurrency: 4,
            scan_interval: Duration::from_millis(2_000),
            scan_batch_size: 50,
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
            retry_max_backoff: Duration::from_secs(60),
        }
    }
}

impl WorkerTuning {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            concurrency: cfg.worker_concurrency.max(1),
            scan_interval: Duration::from_millis(cfg.scan_interval_ms),
            scan_batch_size: cfg.scan_batch_size.max(1),
            max_retries: cfg.task_max_retries,
            retry_backoff: Duration::from_millis(cfg.retry_backoff_ms),
            retry_max_backoff: Duration::from_millis(cfg.retry_max_backoff_ms),
        }
    }

    /// Delays of `backoff * 2^n`, capped and jittered, `max_retries` long.
    fn retry_strategy(&self) -> impl Iterator<Item = Duration> {
        let factor = u64::try_from(self.retry_backoff.as_millis())
            .unwrap_or(u64::MAX)
            .saturating_div(2)
            .max(1);
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(self.retry_max_backoff)
            .map(jitter)
            .take(self.max_retries)
    }
}

/// Polls the metadata store for `pending` documents and processes them on a
/// pool of at most `concurrency` tasks.
#[derive(Clone)]
pub struct PendingScanner {
    db: Arc<SurrealDbClient>,
    orchestrator: Arc<PipelineOrchestrator>,
    tuning: WorkerTuning,
    slots: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl PendingScanner {
    pub fn new(
        db: Arc<SurrealDbClient>,
        orchestrator: Arc<PipelineOrchestrator>,
        tuning: WorkerTuning,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(tuning.concurrency.max(1)));
        Self {
            db,
            orchestrator,
            tuning,
            slots,
            tracker: TaskTracker::new(),
        }
    }

    /// Scan until `shutdown` fires, then wait for dispatched documents to finish.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), AppError> {
        info!(
            concurrency = self.tuning.concurrency,
            interval_ms = self.tuning.scan_interval.as_millis(),
            "pending scanner started"
        );

        loop {
            match self.scan_once(&shutdown).await {
                Ok(0) => {}
                Ok(dispatched) => debug!(dispatched, "scan dispatched documents"),
                Err(err) => error!(error = %err, "pending scan failed"),
            }

            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(self.tuning.scan_interval) => {}
            }
        }

        self.drain().await;
        info!("pending scanner stopped");
        Ok(())
    }

    /// One pass: claim up to `scan_batch_size` pending documents and dispatch them.
    pub async fn scan_once(&self, shutdown: &CancellationToken) -> Result<usize, AppError> {
        let candidates = DocumentMeta::list_pending(&self.db, self.tuning.scan_batch_size).await?;
        let mut dispatched = 0usize;

        for candidate in candidates {
            let permit = tokio::select! {
                () = shutdown.cancelled() => break,
                permit = Arc::clone(&self.slots).acquire_owned() => permit
                    .map_err(|_| AppError::InternalError("worker pool closed".into()))?,
            };

            let Some(claimed) = DocumentMeta::claim(&self.db, &candidate.id).await? else {
                debug!(document_id = %candidate.id, "document claimed elsewhere");
                continue;
            };

            let orchestrator = Arc::clone(&self.orchestrator);
            let tuning = self.tuning.clone();
            self.tracker.spawn(async move {
                let _permit = permit;
                process_with_retry(&orchestrator, &claimed.id, &tuning).await;
            });
            dispatched = dispatched.saturating_add(1);
        }

        Ok(dispatched)
    }

    /// Wait for every dispatched document.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

/// Process one document, retrying retryable failures with backoff.
pub async fn process_with_retry(
    orchestrator: &PipelineOrchestrator,
    document_id: &str,
    tuning: &WorkerTuning,
) {
    let mut attempt = 0u32;
    let result = RetryIf::spawn(
        tuning.retry_strategy(),
        || {
            attempt = attempt.saturating_add(1);
            if attempt > 1 {
                info!(%document_id, attempt, "retrying document");
            }
            orchestrator.process(document_id)
        },
        |err: &AppError| err.is_retryable(),
    )
    .await;

    match result {
        Ok(()) => debug!(%document_id, attempt, "document done"),
        Err(err) if err.is_retryable() => {
            error!(%document_id, attempt, error = %err, "document failed after retries");
        }
        Err(err) => warn!(%document_id, attempt, error = %err, "document failed"),
    }
}

/// Convenience wrapper used by the binaries.
pub async fn run_worker_loop(
    db: Arc<SurrealDbClient>,
    orchestrator: Arc<PipelineOrchestrator>,
    tuning: WorkerTuning,
    shutdown: CancellationToken,
) -> Result<(), AppError> {
    PendingScanner::new(db, orchestrator, tuning).run(shutdown).await
}
