use std::sync::Arc;

use async_trait::async_trait;
use common::{
    error::AppError,
    storage::{
        artifacts,
        db::SurrealDbClient,
        store::StorageManager,
        types::{
            chunk::{Chunk, Page},
            document_meta::DocumentMeta,
            pipeline_event::Stage,
        },
    },
    utils::embedding::EmbeddingProvider,
    vector::{Vector, VectorIndex, VectorPayload},
};
use tracing::{debug, info};

use super::config::IngestionConfig;
use crate::{
    chunker::Chunker,
    utils::{
        classification::classify_text,
        file_text_extraction::{extract_pages, resolve_mime},
        language::{detect_language, sample_text},
    },
};

/// The work behind each stage. Every method reads its inputs from the
/// artifacts of earlier stages and persists its own results.
#[async_trait]
pub trait PipelineServices: Send + Sync {
    async fn extract(&self, document: &DocumentMeta) -> Result<(), AppError>;

    async fn detect_language(&self, document: &DocumentMeta) -> Result<(), AppError>;

    async fn split_into_chunks(&self, document: &DocumentMeta) -> Result<(), AppError>;

    async fn embed_and_index(&self, document: &DocumentMeta) -> Result<(), AppError>;

    async fn classify(&self, document: &DocumentMeta) -> Result<(), AppError>;
}

/// Dispatch `stage` to the matching service method.
pub async fn run_stage(
    services: &dyn PipelineServices,
    stage: Stage,
    document: &DocumentMeta,
) -> Result<(), AppError> {
    match stage {
        Stage::Extract => services.extract(document).await,
        Stage::DetectLanguage => services.detect_language(document).await,
        Stage::Chunk => services.split_into_chunks(document).await,
        Stage::Embed => services.embed_and_index(document).await,
        Stage::Classify => services.classify(document).await,
    }
}

pub struct DefaultPipelineServices {
    db: Arc<SurrealDbClient>,
    storage: StorageManager,
    embedder: Arc<EmbeddingProvider>,
    vector_index: Arc<dyn VectorIndex>,
    chunker: Chunker,
    config: IngestionConfig,
}

impl DefaultPipelineServices {
    pub fn new(
        db: Arc<SurrealDbClient>,
        storage: StorageManager,
        embedder: Arc<EmbeddingProvider>,
        vector_index: Arc<dyn VectorIndex>,
        config: IngestionConfig,
    ) -> Result<Self, AppError> {
        let chunker = Chunker::new(config.chunker.clone())?;
        Ok(Self {
            db,
            storage,
            embedder,
            vector_index,
            chunker,
            config,
        })
    }

    async fn load_pages(&self, document: &DocumentMeta) -> Result<Vec<Page>, AppError> {
        let location = document
            .pages_path
            .clone()
            .unwrap_or_else(|| artifacts::pages_path(&document.workspace_id, &document.id));
        artifacts::load_json(&self.storage, &location).await
    }

    async fn load_chunks(&self, document: &DocumentMeta) -> Result<Vec<Chunk>, AppError> {
        let location = document
            .chunks_path
            .clone()
            .unwrap_or_else(|| artifacts::chunks_path(&document.workspace_id, &document.id));
        artifacts::load_json(&self.storage, &location).await
    }
}

#[async_trait]
impl PipelineServices for DefaultPipelineServices {
    async fn extract(&self, document: &DocumentMeta) -> Result<(), AppError> {
        let bytes = self
            .storage
            .get(&document.raw_path)
            .await
            .map_err(|err| match err {
                object_store::Error::NotFound { .. } => AppError::Extraction(format!(
                    "raw file {} is missing",
                    document.raw_path
                )),
                other => AppError::ObjectStore(other),
            })?;

        let mime = resolve_mime(document.mime.as_deref(), &document.raw_path);
        let extracted = extract_pages(bytes.to_vec(), mime.as_deref(), &document.id).await?;
        let page_count = u32::try_from(extracted.pages.len()).unwrap_or(u32::MAX);

        let location = artifacts::pages_path(&document.workspace_id, &document.id);
        artifacts::save_json(&self.storage, &location, &extracted.pages).await?;
        DocumentMeta::update_extraction(
            &self.db,
            &document.id,
            &location,
            page_count,
            extracted.author,
            extracted.created_at,
        )
        .await?;

        info!(page_count, mime = mime.as_deref().unwrap_or("unknown"), "pages extracted");
        Ok(())
    }

    async fn detect_language(&self, document: &DocumentMeta) -> Result<(), AppError> {
        let pages = self.load_pages(document).await?;
        let sample = sample_text(&pages, self.config.tuning.language_sample_chars);

        match detect_language(&sample) {
            Some(detected) => {
                DocumentMeta::update_language(
                    &self.db,
                    &document.id,
                    detected.code,
                    detected.confidence,
                )
                .await?;
                info!(
                    language = detected.code,
                    confidence = detected.confidence,
                    "language detected"
                );
            }
            None => debug!("no language detected"),
        }
        Ok(())
    }

    async fn split_into_chunks(&self, document: &DocumentMeta) -> Result<(), AppError> {
        let pages = self.load_pages(document).await?;
        let chunks = self.chunker.split(&pages);
        let chunk_count = u32::try_from(chunks.len()).unwrap_or(u32::MAX);

        let location = artifacts::chunks_path(&document.workspace_id, &document.id);
        artifacts::save_json(&self.storage, &location, &chunks).await?;
        DocumentMeta::update_chunks(&self.db, &document.id, &location, chunk_count).await?;

        info!(chunk_count, "document chunked");
        Ok(())
    }

    async fn embed_and_index(&self, document: &DocumentMeta) -> Result<(), AppError> {
        let chunks = self.load_chunks(document).await?;

        // Chunk ids change when chunking reruns, so old points are dropped first.
        self.vector_index
            .delete_by_document(&document.workspace_id, &document.id)
            .await?;
        if chunks.is_empty() {
            debug!("no chunks to embed");
            return Ok(());
        }

        let texts = chunks.iter().map(|chunk| chunk.text.clone()).collect();
        let embeddings = self.embedder.encode(texts).await?;

        let vectors: Vec<Vector> = chunks
            .into_iter()
            .zip(embeddings)
            .map(|(chunk, values)| Vector {
                id: chunk.id.clone(),
                values,
                payload: VectorPayload {
                    workspace_id: document.workspace_id.clone(),
                    document_id: document.id.clone(),
                    page_start: chunk.page_start(),
                    page_end: chunk.page_end(),
                    chunk_id: chunk.id,
                    text: chunk.text,
                    extra: serde_json::Map::new(),
                },
            })
            .collect();

        let count = vectors.len();
        self.vector_index.upsert(vectors).await?;
        info!(vectors = count, backend = self.vector_index.name(), "chunks indexed");
        Ok(())
    }

    async fn classify(&self, document: &DocumentMeta) -> Result<(), AppError> {
        if self.config.classification_labels.is_empty() {
            debug!("no classification labels configured");
            return Ok(());
        }

        let pages = self.load_pages(document).await?;
        let sample = sample_text(&pages, self.config.tuning.classification_sample_chars);
        let result = classify_text(
            &self.embedder,
            &sample,
            &self.config.classification_labels,
        )
        .await?;

        if let Some(result) = result {
            DocumentMeta::update_classification(
                &self.db,
                &document.id,
                &result.label,
                result.score,
            )
            .await?;
            info!(label = %result.label, score = result.score, "document classified");
        }
        Ok(())
    }
}
