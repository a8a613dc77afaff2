mod config;
mod graph;
mod runner;
mod services;

pub use config::{IngestionConfig, IngestionTuning};
pub use graph::{GraphReport, NodeFuture, NodeOutcome, TaskGraph};
pub use runner::{StageOutcome, StageRunner};
#[allow(clippy::module_name_repetitions)]
pub use services::{run_stage, DefaultPipelineServices, PipelineServices};

use std::{sync::Arc, time::Instant};

use common::{
    error::AppError,
    storage::{
        artifacts,
        db::SurrealDbClient,
        store::StorageManager,
        types::{
            document_meta::DocumentMeta,
            pipeline_event::{PipelineEvent, Stage},
        },
    },
    utils::embedding::EmbeddingProvider,
    vector::VectorIndex,
};
use futures::FutureExt;
use tracing::{info, warn};
use uuid::Uuid;

/// Drives one document through every stage:
/// `extract -> { detect_language, chunk -> embed, classify }`.
#[allow(clippy::module_name_repetitions)]
pub struct PipelineOrchestrator {
    db: Arc<SurrealDbClient>,
    runner: StageRunner,
    services: Arc<dyn PipelineServices>,
    storage: StorageManager,
    vector_index: Arc<dyn VectorIndex>,
}

impl PipelineOrchestrator {
    pub fn new(
        db: Arc<SurrealDbClient>,
        storage: StorageManager,
        embedder: Arc<EmbeddingProvider>,
        vector_index: Arc<dyn VectorIndex>,
        config: IngestionConfig,
    ) -> Result<Self, AppError> {
        let services = DefaultPipelineServices::new(
            Arc::clone(&db),
            storage.clone(),
            embedder,
            Arc::clone(&vector_index),
            config,
        )?;

        Ok(Self::with_services(
            db,
            storage,
            vector_index,
            Arc::new(services),
        ))
    }

    pub fn with_services(
        db: Arc<SurrealDbClient>,
        storage: StorageManager,
        vector_index: Arc<dyn VectorIndex>,
        services: Arc<dyn PipelineServices>,
    ) -> Self {
        Self {
            runner: StageRunner::new(Arc::clone(&db)),
            db,
            services,
            storage,
            vector_index,
        }
    }

    /// Process one document to `success` or `failed`.
    ///
    /// Stages that already succeeded for this document are skipped, so calling
    /// this again after a retryable failure only reruns what is missing.
    #[tracing::instrument(skip_all, fields(document_id = %document_id, trace_id))]
    pub async fn process(&self, document_id: &str) -> Result<(), AppError> {
        let trace_id = Uuid::new_v4().to_string();
        tracing::Span::current().record("trace_id", trace_id.as_str());

        let document = DocumentMeta::get(&self.db, document_id).await?;
        let document = document.mark_processing(&self.db).await?;
        let started = Instant::now();

        let mut graph = TaskGraph::new();
        graph
            .add_node("extract", &[], self.stage_task(Stage::Extract, document_id, &trace_id))?
            .add_node(
                "detect_language",
                &["extract"],
                self.stage_task(Stage::DetectLanguage, document_id, &trace_id),
            )?
            .add_node(
                "chunk",
                &["extract"],
                self.stage_task(Stage::Chunk, document_id, &trace_id),
            )?
            .add_node(
                "embed",
                &["chunk"],
                self.stage_task(Stage::Embed, document_id, &trace_id),
            )?
            .add_node(
                "classify",
                &["extract"],
                self.stage_task(Stage::Classify, document_id, &trace_id),
            )?;

        let report = graph.run().await;
        let total_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match report.into_first_error() {
            None => {
                let current = DocumentMeta::get(&self.db, document_id).await?;
                current.mark_success(&self.db).await?;
                info!(
                    workspace_id = %document.workspace_id,
                    total_ms,
                    "document processed"
                );
                Ok(())
            }
            Some(err) => {
                self.on_failure(document_id, &err).await;
                warn!(
                    workspace_id = %document.workspace_id,
                    total_ms,
                    error = %err,
                    retryable = err.is_retryable(),
                    "document processing failed"
                );
                Err(err)
            }
        }
    }

    fn stage_task(
        &self,
        stage: Stage,
        document_id: &str,
        trace_id: &str,
    ) -> impl FnOnce() -> NodeFuture + Send + 'static {
        let runner = self.runner.clone();
        let services = Arc::clone(&self.services);
        let document_id = document_id.to_string();
        let trace_id = trace_id.to_string();

        move || {
            async move {
                runner
                    .run(&document_id, stage, &trace_id, |document| async move {
                        run_stage(services.as_ref(), stage, &document).await
                    })
                    .await
                    .map(|_| ())
            }
            .boxed()
        }
    }

    /// Mark the document failed. Errors here are logged so the stage error stays the one reported.
    async fn on_failure(&self, document_id: &str, err: &AppError) {
        let result = match DocumentMeta::get(&self.db, document_id).await {
            Ok(current) => current.mark_failed(&self.db, &err.to_string()).await.map(|_| ()),
            Err(lookup_err) => Err(lookup_err),
        };
        if let Err(callback_err) = result {
            warn!(%document_id, error = %callback_err, "failed to mark document as failed");
        }
    }

    /// Put a `failed` or `success` document back to `pending`.
    ///
    /// With `full`, the event log is cleared too and every stage reruns.
    #[tracing::instrument(skip(self))]
    pub async fn requeue(&self, document_id: &str, full: bool) -> Result<DocumentMeta, AppError> {
        let document = DocumentMeta::get(&self.db, document_id).await?;
        if full {
            PipelineEvent::delete_for_document(&self.db, document_id).await?;
        }
        let requeued = document.requeue(&self.db).await?;
        info!("document requeued");
        Ok(requeued)
    }

    /// Remove a document with its vectors, artifacts and event log.
    #[tracing::instrument(skip(self))]
    pub async fn purge(&self, document_id: &str) -> Result<(), AppError> {
        let document = DocumentMeta::get(&self.db, document_id).await?;
        let workspace_id = document.workspace_id.as_str();

        self.vector_index
            .delete_by_document(workspace_id, document_id)
            .await?;

        let mut locations = vec![
            document.raw_path.clone(),
            artifacts::pages_path(workspace_id, document_id),
            artifacts::chunks_path(workspace_id, document_id),
        ];
        locations.extend(document.pages_path.clone());
        locations.extend(document.chunks_path.clone());
        locations.sort();
        locations.dedup();
        for location in &locations {
            self.storage.delete(location).await?;
        }

        PipelineEvent::delete_for_document(&self.db, document_id).await?;
        self.db.delete_item::<DocumentMeta>(document_id).await?;
        info!(%workspace_id, "document purged");
        Ok(())
    }
}
