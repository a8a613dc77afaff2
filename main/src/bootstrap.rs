//! Shared startup for the binaries: tracing, configuration and adapter wiring.
#![allow(dead_code)]

use std::{collections::HashMap, sync::Arc};

use anyhow::Context;
use common::{
    storage::{db::SurrealDbClient, store::StorageManager},
    utils::{config::AppConfig, embedding::EmbeddingProvider},
    vector::{build_vector_index, VectorIndex},
};
use ingestion_consumer::{
    ConsumerConfig, DocumentEventHandler, HandlerMap, IngestionConsumer, MessageHandler,
    MessageSource,
};
use ingestion_pipeline::{IngestionConfig, PendingScanner, PipelineOrchestrator, WorkerTuning};
use retrieval_pipeline::{RagRetriever, Reranker, RerankerPool};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();
}

/// Adapters built once at startup and shared by every worker.
#[derive(Clone)]
pub struct Services {
    pub config: AppConfig,
    pub db: Arc<SurrealDbClient>,
    pub storage: StorageManager,
    pub embedder: Arc<EmbeddingProvider>,
    pub vector_index: Arc<dyn VectorIndex>,
}

impl Services {
    pub async fn connect(config: AppConfig) -> anyhow::Result<Self> {
        let db = Arc::new(
            SurrealDbClient::new(
                &config.surrealdb_address,
                &config.surrealdb_username,
                &config.surrealdb_password,
                &config.surrealdb_namespace,
                &config.surrealdb_database,
            )
            .await
            .context("connecting to SurrealDB")?,
        );
        db.ensure_initialized()
            .await
            .context("creating metadata indexes")?;

        let storage = StorageManager::new(&config)
            .await
            .context("opening object storage")?;

        let embedder = Arc::new(EmbeddingProvider::from_config(&config).await?);
        info!(
            embedding_backend = embedder.backend_label(),
            embedding_model = ?embedder.model_code(),
            embedding_dimension = embedder.dimension(),
            "embedding provider initialized"
        );

        Ok(Self::from_parts(config, db, storage, embedder))
    }

    pub fn from_parts(
        config: AppConfig,
        db: Arc<SurrealDbClient>,
        storage: StorageManager,
        embedder: Arc<EmbeddingProvider>,
    ) -> Self {
        let vector_index = build_vector_index(&config, Arc::clone(&db), storage.clone());
        info!(backend = vector_index.name(), "vector index ready");
        Self {
            config,
            db,
            storage,
            embedder,
            vector_index,
        }
    }

    pub fn orchestrator(&self) -> anyhow::Result<Arc<PipelineOrchestrator>> {
        let orchestrator = PipelineOrchestrator::new(
            Arc::clone(&self.db),
            self.storage.clone(),
            Arc::clone(&self.embedder),
            Arc::clone(&self.vector_index),
            IngestionConfig::from_app_config(&self.config),
        )?;
        Ok(Arc::new(orchestrator))
    }

    pub fn scanner(&self) -> anyhow::Result<PendingScanner> {
        Ok(PendingScanner::new(
            Arc::clone(&self.db),
            self.orchestrator()?,
            WorkerTuning::from_config(&self.config),
        ))
    }

    /// Consumer over `source` with the document handler bound to every configured topic.
    pub fn consumer(&self, source: Arc<dyn MessageSource>) -> (IngestionConsumer, HandlerMap) {
        let handler: Arc<dyn MessageHandler> =
            Arc::new(DocumentEventHandler::new(Arc::clone(&self.db)));
        let handlers: HandlerMap = self
            .config
            .consumer_topics
            .iter()
            .map(|topic| (topic.clone(), Arc::clone(&handler)))
            .collect::<HashMap<_, _>>();

        (
            IngestionConsumer::new(source, ConsumerConfig::from_config(&self.config)),
            handlers,
        )
    }

    pub fn retriever(&self) -> anyhow::Result<RagRetriever> {
        let reranker = RerankerPool::maybe_from_config(&self.config)?
            .map(|pool| -> Arc<dyn Reranker> { pool });
        Ok(RagRetriever::new(
            Arc::clone(&self.db),
            self.storage.clone(),
            Arc::clone(&self.embedder),
            Arc::clone(&self.vector_index),
        )
        .with_reranker(reranker))
    }
}

/// Token cancelled on Ctrl-C.
pub fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown requested"),
            Err(err) => warn!(error = %err, "failed to listen for Ctrl-C; shutting down"),
        }
        trigger.cancel();
    });
    token
}
