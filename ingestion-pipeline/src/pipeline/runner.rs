use std::{future::Future, sync::Arc, time::Instant};

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            document_meta::DocumentMeta,
            pipeline_event::{EventStatus, PipelineEvent, Stage},
        },
    },
};
use tracing::{info, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Ran { duration_ms: u64 },
    /// The latest attempt for this stage already succeeded.
    Skipped,
}

/// Runs one stage of one document and records it in the `pipeline_event` log.
#[derive(Clone)]
pub struct StageRunner {
    db: Arc<SurrealDbClient>,
}

impl StageRunner {
    pub fn new(db: Arc<SurrealDbClient>) -> Self {
        Self { db }
    }

    /// Run `stage` for `document_id`.
    ///
    /// A `processing` event is written before `f` runs and finished as
    /// `success` or `failed` afterwards. On failure the document's
    /// `error_message` is updated and the original error is returned.
    pub async fn run<F, Fut>(
        &self,
        document_id: &str,
        stage: Stage,
        trace_id: &str,
        f: F,
    ) -> Result<StageOutcome, AppError>
    where
        F: FnOnce(DocumentMeta) -> Fut,
        Fut: Future<Output = Result<(), AppError>>,
    {
        let document = DocumentMeta::get(&self.db, document_id).await?;
        let span = info_span!(
            "stage",
            %trace_id,
            workspace_id = %document.workspace_id,
            %document_id,
            %stage
        );

        self.run_in_span(document, stage, trace_id, f)
            .instrument(span)
            .await
    }

    async fn run_in_span<F, Fut>(
        &self,
        document: DocumentMeta,
        stage: Stage,
        trace_id: &str,
        f: F,
    ) -> Result<StageOutcome, AppError>
    where
        F: FnOnce(DocumentMeta) -> Fut,
        Fut: Future<Output = Result<(), AppError>>,
    {
        let document_id = document.id.clone();

        if let Some(latest) = PipelineEvent::latest(&self.db, &document_id, stage).await? {
            if latest.status == EventStatus::Success {
                info!(attempt = latest.attempt, "stage already succeeded; skipping");
                return Ok(StageOutcome::Skipped);
            }
        }

        let event = PipelineEvent::start(
            &self.db,
            &document_id,
            &document.workspace_id,
            stage,
            trace_id,
        )
        .await?;
        info!(attempt = event.attempt, "stage started");

        let started = Instant::now();
        let result = match DocumentMeta::set_stage(&self.db, &document_id, stage).await {
            Ok(current) => f(current).await,
            Err(err) => Err(err),
        };
        let duration_ms = duration_millis(started);

        match result {
            Ok(()) => {
                event.finish_success(&self.db, duration_ms).await?;
                info!(attempt = event.attempt, duration_ms, "stage succeeded");
                Ok(StageOutcome::Ran { duration_ms })
            }
            Err(err) => {
                let message = err.to_string();
                if let Err(record_err) = event.finish_failed(&self.db, duration_ms, &message).await {
                    warn!(error = %record_err, "failed to finish stage event");
                }
                if let Err(record_err) =
                    DocumentMeta::record_error(&self.db, &document_id, &message).await
                {
                    warn!(error = %record_err, "failed to record stage error on document");
                }
                warn!(
                    attempt = event.attempt,
                    duration_ms,
                    error = %message,
                    "stage failed"
                );
                Err(err)
            }
        }
    }
}

fn duration_millis(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::types::document_meta::DocumentStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    async fn setup() -> (Arc<SurrealDbClient>, DocumentMeta) {
        let database = Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("test_ns", &database)
            .await
            .expect("in-memory surrealdb");
        db.ensure_initialized().await.expect("indexes");
        let doc = DocumentMeta::new(
            "doc-1".into(),
            "ws-1".into(),
            "hash".into(),
            "ws-1/doc-1.txt".into(),
        )
        .insert_unique(&db)
        .await
        .expect("insert");
        let doc = doc.mark_processing(&db).await.expect("processing");
        (Arc::new(db), doc)
    }

    #[tokio::test]
    async fn test_success_writes_one_finished_event() {
        let (db, doc) = setup().await;
        let runner = StageRunner::new(Arc::clone(&db));

        let outcome = runner
            .run(&doc.id, Stage::Chunk, "trace-1", |current| async move {
                assert_eq!(current.status, DocumentStatus::Chunking);
                Ok(())
            })
            .await
            .expect("run");
        assert!(matches!(outcome, StageOutcome::Ran { .. }));

        let events = PipelineEvent::for_document(&db, &doc.id).await.expect("events");
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.stage, Stage::Chunk);
        assert_eq!(event.status, EventStatus::Success);
        assert_eq!(event.trace_id, "trace-1");
        assert!(event.finished_at.is_some());
        assert!(event.duration_ms.is_some());
    }

    #[tokio::test]
    async fn test_failure_is_recorded_and_reraised() {
        let (db, doc) = setup().await;
        let runner = StageRunner::new(Arc::clone(&db));

        let err = runner
            .run(&doc.id, Stage::Extract, "trace-1", |_| async {
                Err(AppError::Extraction("corrupt".into()))
            })
            .await
            .expect_err("stage error");
        assert!(matches!(err, AppError::Extraction(_)));

        let event = PipelineEvent::latest(&db, &doc.id, Stage::Extract)
            .await
            .expect("latest")
            .expect("event");
        assert_eq!(event.status, EventStatus::Failed);
        assert!(event
            .error_message
            .as_deref()
            .is_some_and(|m| m.contains("corrupt")));

        let stored = DocumentMeta::get(&db, &doc.id).await.expect("doc");
        assert!(stored
            .error_message
            .as_deref()
            .is_some_and(|m| m.contains("corrupt")));
    }

    #[tokio::test]
    async fn test_succeeded_stage_is_skipped_and_retry_increments_attempt() {
        let (db, doc) = setup().await;
        let runner = StageRunner::new(Arc::clone(&db));
        let calls = Arc::new(AtomicUsize::new(0));

        let _ = runner
            .run(&doc.id, Stage::Embed, "t1", |_| async {
                Err(AppError::Queue("backend down".into()))
            })
            .await;

        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            runner
                .run(&doc.id, Stage::Embed, "t2", |_| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
                .expect("run");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let events = PipelineEvent::for_document(&db, &doc.id).await.expect("events");
        let attempts: Vec<(u32, EventStatus)> = events.iter().map(|e| (e.attempt, e.status)).collect();
        assert_eq!(
            attempts,
            vec![(1, EventStatus::Failed), (2, EventStatus::Success)]
        );
    }

    #[tokio::test]
    async fn test_stage_outside_processing_fails_with_event() {
        let (db, doc) = setup().await;
        doc.mark_failed(&db, "stopped").await.expect("fail");
        let runner = StageRunner::new(Arc::clone(&db));

        let err = runner
            .run(&doc.id, Stage::Classify, "t", |_| async { Ok(()) })
            .await
            .expect_err("not processing");
        assert!(matches!(err, AppError::Validation(_)));

        let event = PipelineEvent::latest(&db, &doc.id, Stage::Classify)
            .await
            .expect("latest")
            .expect("event");
        assert_eq!(event.status, EventStatus::Failed);
    }

    #[tokio::test]
    async fn test_missing_document() {
        let (db, _) = setup().await;
        let runner = StageRunner::new(db);
        let err = runner
            .run("missing", Stage::Extract, "t", |_| async { Ok(()) })
            .await
            .expect_err("missing");
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
