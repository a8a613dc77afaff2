//! Query-time retrieval: question → embedding → vector search → chunk text →
//! optional rerank → sources grouped by document.

use std::{
    cmp::Ordering,
    collections::{HashMap, HashSet},
    sync::Arc,
};

use common::{
    error::AppError,
    storage::{
        artifacts,
        db::SurrealDbClient,
        store::StorageManager,
        types::{
            chunk::{Chunk, PageSpan},
            document_meta::DocumentMeta,
        },
    },
    utils::embedding::EmbeddingProvider,
    vector::{ScoredVector, TopK, VectorIndex},
};
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::reranking::Reranker;

#[derive(Debug, Clone)]
pub struct RetrievalQuery {
    pub workspace_id: String,
    pub question: String,
    pub top_k: TopK,
    pub threshold: f64,
}

impl RetrievalQuery {
    pub fn new(workspace_id: impl Into<String>, question: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            question: question.into(),
            top_k: TopK::Limit(8),
            threshold: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub text: String,
    pub score: f64,
    pub page_start: Option<u32>,
    pub page_end: Option<u32>,
    /// Empty when the chunk artifact could not be read.
    pub spans: Vec<PageSpan>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedSource {
    pub document_id: String,
    pub title: Option<String>,
    pub best_score: f64,
    pub chunks: Vec<RetrievedChunk>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetrievalResult {
    /// Sorted by `best_score`, highest first.
    pub sources: Vec<RetrievedSource>,
}

impl RetrievalResult {
    pub fn chunk_count(&self) -> usize {
        self.sources.iter().map(|source| source.chunks.len()).sum()
    }
}

pub struct RagRetriever {
    db: Arc<SurrealDbClient>,
    storage: StorageManager,
    embedder: Arc<EmbeddingProvider>,
    vector_index: Arc<dyn VectorIndex>,
    reranker: Option<Arc<dyn Reranker>>,
}

impl RagRetriever {
    pub fn new(
        db: Arc<SurrealDbClient>,
        storage: StorageManager,
        embedder: Arc<EmbeddingProvider>,
        vector_index: Arc<dyn VectorIndex>,
    ) -> Self {
        Self {
            db,
            storage,
            embedder,
            vector_index,
            reranker: None,
        }
    }

    #[must_use]
    pub fn with_reranker(mut self, reranker: Option<Arc<dyn Reranker>>) -> Self {
        self.reranker = reranker;
        self
    }

    #[instrument(skip_all, fields(workspace_id = %query.workspace_id))]
    pub async fn retrieve(&self, query: &RetrievalQuery) -> Result<RetrievalResult, AppError> {
        let question = query.question.trim();
        if question.is_empty() {
            return Err(AppError::Validation("question must not be empty".into()));
        }

        let embedding = self.embedder.embed(question).await?;
        let hits = self
            .vector_index
            .search(&embedding, query.top_k, &query.workspace_id, query.threshold)
            .await?;
        debug!(hits = hits.len(), backend = self.vector_index.name(), "vector search done");
        if hits.is_empty() {
            return Ok(RetrievalResult::default());
        }

        let documents = self.load_documents(&query.workspace_id, &hits).await?;
        let mut chunks: Vec<(String, RetrievedChunk)> = hits
            .into_iter()
            .map(|hit| resolve_chunk(hit, &documents))
            .collect();

        if let Some(reranker) = &self.reranker {
            chunks = rerank(reranker.as_ref(), question, chunks).await?;
        }

        Ok(RetrievalResult {
            sources: group_by_document(chunks, &documents),
        })
    }

    /// Metadata and chunk artifacts for every document among `hits`.
    async fn load_documents(
        &self,
        workspace_id: &str,
        hits: &[ScoredVector],
    ) -> Result<HashMap<String, LoadedDocument>, AppError> {
        let mut seen = HashSet::new();
        let mut documents = HashMap::new();

        for hit in hits {
            let document_id = &hit.vector.payload.document_id;
            if !seen.insert(document_id.clone()) {
                continue;
            }

            let meta = self.db.get_item::<DocumentMeta>(document_id).await?;
            let location = meta
                .as_ref()
                .and_then(|meta| meta.chunks_path.clone())
                .unwrap_or_else(|| artifacts::chunks_path(workspace_id, document_id));

            let chunks = match artifacts::load_json::<Vec<Chunk>>(&self.storage, &location).await {
                Ok(chunks) => chunks,
                Err(AppError::NotFound(_)) => {
                    debug!(%document_id, "chunk artifact missing; using vector payload text");
                    Vec::new()
                }
                Err(err) => return Err(err),
            };

            documents.insert(
                document_id.clone(),
                LoadedDocument {
                    title: meta.and_then(|meta| meta.title),
                    chunks: chunks
                        .into_iter()
                        .map(|chunk| (chunk.id.clone(), chunk))
                        .collect(),
                },
            );
        }

        Ok(documents)
    }
}

struct LoadedDocument {
    title: Option<String>,
    chunks: HashMap<String, Chunk>,
}

fn resolve_chunk(
    hit: ScoredVector,
    documents: &HashMap<String, LoadedDocument>,
) -> (String, RetrievedChunk) {
    let payload = hit.vector.payload;
    let stored = documents
        .get(&payload.document_id)
        .and_then(|document| document.chunks.get(&payload.chunk_id));

    let chunk = match stored {
        Some(chunk) => RetrievedChunk {
            chunk_id: chunk.id.clone(),
            text: chunk.text.clone(),
            score: hit.score,
            page_start: chunk.page_start(),
            page_end: chunk.page_end(),
            spans: chunk.spans.clone(),
        },
        None => RetrievedChunk {
            chunk_id: payload.chunk_id,
            text: payload.text,
            score: hit.score,
            page_start: payload.page_start,
            page_end: payload.page_end,
            spans: Vec::new(),
        },
    };
    (payload.document_id, chunk)
}

/// Replace vector scores with reranker scores and reorder. Chunks the
/// reranker does not score keep their order after the scored ones.
async fn rerank(
    reranker: &dyn Reranker,
    question: &str,
    chunks: Vec<(String, RetrievedChunk)>,
) -> Result<Vec<(String, RetrievedChunk)>, AppError> {
    let texts = chunks.iter().map(|(_, chunk)| chunk.text.clone()).collect();
    let scores = reranker.rerank(question, texts).await?;

    let mut slots: Vec<Option<(String, RetrievedChunk)>> = chunks.into_iter().map(Some).collect();
    let mut scored = Vec::with_capacity(slots.len());
    for score in scores {
        match slots.get_mut(score.index).and_then(Option::take) {
            Some((document_id, mut chunk)) => {
                chunk.score = f64::from(score.score);
                scored.push((document_id, chunk));
            }
            None => warn!(index = score.index, "reranker returned an unknown index"),
        }
    }
    sort_by_score(&mut scored);
    scored.extend(slots.into_iter().flatten());
    Ok(scored)
}

fn sort_by_score(chunks: &mut [(String, RetrievedChunk)]) {
    chunks.sort_by(|(_, a), (_, b)| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
}

fn group_by_document(
    chunks: Vec<(String, RetrievedChunk)>,
    documents: &HashMap<String, LoadedDocument>,
) -> Vec<RetrievedSource> {
    let mut order: Vec<String> = Vec::new();
    let mut grouped: HashMap<String, Vec<RetrievedChunk>> = HashMap::new();
    for (document_id, chunk) in chunks {
        let entry = grouped.entry(document_id.clone()).or_default();
        if entry.is_empty() {
            order.push(document_id);
        }
        entry.push(chunk);
    }

    let mut sources: Vec<RetrievedSource> = order
        .into_iter()
        .filter_map(|document_id| {
            let chunks = grouped.remove(&document_id)?;
            let best_score = chunks
                .iter()
                .map(|chunk| chunk.score)
                .fold(f64::NEG_INFINITY, f64::max);
            Some(RetrievedSource {
                title: documents
                    .get(&document_id)
                    .and_then(|document| document.title.clone()),
                document_id,
                best_score,
                chunks,
            })
        })
        .collect();

    sources.sort_by(|a, b| {
        b.best_score
            .partial_cmp(&a.best_score)
            .unwrap_or(Ordering::Equal)
    });
    sources
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::{
        utils::embedding::EmbeddingLimits,
        vector::{local::LocalVectorIndex, Vector, VectorIndexConfig, VectorPayload},
    };
    use uuid::Uuid;

    use crate::reranking::RerankScore;

    struct Harness {
        db: Arc<SurrealDbClient>,
        storage: StorageManager,
        embedder: Arc<EmbeddingProvider>,
        index: Arc<dyn VectorIndex>,
    }

    impl Harness {
        async fn new() -> Self {
            let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
                .await
                .expect("in-memory surrealdb");
            let storage = StorageManager::memory();
            let index: Arc<dyn VectorIndex> = Arc::new(LocalVectorIndex::new(
                storage.clone(),
                VectorIndexConfig::default(),
            ));
            Self {
                db: Arc::new(db),
                storage,
                embedder: Arc::new(
                    EmbeddingProvider::new_hashed(64, EmbeddingLimits::default()).expect("hashed"),
                ),
                index,
            }
        }

        fn retriever(&self) -> RagRetriever {
            RagRetriever::new(
                Arc::clone(&self.db),
                self.storage.clone(),
                Arc::clone(&self.embedder),
                Arc::clone(&self.index),
            )
        }

        /// Index `texts` for one document; with `store_chunks` also write its chunk artifact.
        async fn index(&self, workspace: &str, document: &str, texts: &[&str], store_chunks: bool) {
            let chunks: Vec<Chunk> = texts
                .iter()
                .enumerate()
                .map(|(i, text)| Chunk {
                    id: format!("{document}-c{i}"),
                    text: (*text).to_string(),
                    spans: vec![PageSpan {
                        page_num: u32::try_from(i + 1).expect("page"),
                        text: (*text).to_string(),
                        start_on_page: 0,
                        end_on_page: text.chars().count(),
                    }],
                })
                .collect();

            let embeddings = self
                .embedder
                .encode(texts.iter().map(ToString::to_string).collect())
                .await
                .expect("embed");
            let vectors = chunks
                .iter()
                .zip(embeddings)
                .map(|(chunk, values)| Vector {
                    id: chunk.id.clone(),
                    values,
                    payload: VectorPayload {
                        workspace_id: workspace.into(),
                        document_id: document.into(),
                        chunk_id: chunk.id.clone(),
                        text: format!("payload: {}", chunk.text),
                        page_start: chunk.page_start(),
                        page_end: chunk.page_end(),
                        extra: serde_json::Map::new(),
                    },
                })
                .collect();
            self.index.upsert(vectors).await.expect("upsert");

            if store_chunks {
                artifacts::save_json(
                    &self.storage,
                    &artifacts::chunks_path(workspace, document),
                    &chunks,
                )
                .await
                .expect("chunks");
            }
        }
    }

    fn query(question: &str) -> RetrievalQuery {
        RetrievalQuery {
            workspace_id: "ws-1".into(),
            question: question.into(),
            top_k: TopK::Limit(10),
            threshold: -1.0,
        }
    }

    #[tokio::test]
    async fn test_sources_are_grouped_and_resolved() {
        let harness = Harness::new().await;
        harness
            .index(
                "ws-1",
                "doc-a",
                &["telescopes observe distant galaxies", "orbits of planets"],
                true,
            )
            .await;
        harness
            .index("ws-1", "doc-b", &["bread needs flour and an oven"], false)
            .await;

        let mut meta = DocumentMeta::new(
            "doc-a".into(),
            "ws-1".into(),
            "sha-a".into(),
            "ws-1/doc-a.pdf".into(),
        );
        meta.title = Some("Astronomy notes".into());
        harness.db.store_item(meta).await.expect("meta");

        let result = harness
            .retriever()
            .retrieve(&query("telescopes observe distant galaxies"))
            .await
            .expect("retrieve");

        assert_eq!(result.sources.len(), 2);
        assert_eq!(result.chunk_count(), 3);

        let top = &result.sources[0];
        assert_eq!(top.document_id, "doc-a");
        assert_eq!(top.title.as_deref(), Some("Astronomy notes"));
        assert!((top.best_score - 1.0).abs() < 1e-6);
        assert_eq!(top.chunks[0].text, "telescopes observe distant galaxies");
        assert_eq!(top.chunks[0].spans.len(), 1);
        assert_eq!(top.chunks.len(), 2);

        let fallback = &result.sources[1];
        assert_eq!(fallback.document_id, "doc-b");
        assert!(fallback.title.is_none());
        assert_eq!(fallback.chunks[0].text, "payload: bread needs flour and an oven");
        assert!(fallback.chunks[0].spans.is_empty());
        assert!(result.sources[0].best_score >= result.sources[1].best_score);
    }

    #[tokio::test]
    async fn test_other_workspaces_are_invisible() {
        let harness = Harness::new().await;
        harness
            .index("ws-2", "doc-x", &["telescopes observe distant galaxies"], true)
            .await;

        let result = harness
            .retriever()
            .retrieve(&query("telescopes observe distant galaxies"))
            .await
            .expect("retrieve");
        assert!(result.sources.is_empty());
    }

    /// Scores passages by ascending position, so the last passage wins.
    struct ReverseReranker;

    #[async_trait]
    impl Reranker for ReverseReranker {
        async fn rerank(
            &self,
            _query: &str,
            documents: Vec<String>,
        ) -> Result<Vec<RerankScore>, AppError> {
            Ok((0..documents.len())
                .map(|index| RerankScore {
                    index,
                    score: index as f32,
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn test_reranker_reorders_and_rescores() {
        let harness = Harness::new().await;
        harness
            .index("ws-1", "doc-a", &["telescopes observe distant galaxies"], true)
            .await;
        harness
            .index("ws-1", "doc-b", &["bread needs flour and an oven"], true)
            .await;

        let retriever = harness
            .retriever()
            .with_reranker(Some(Arc::new(ReverseReranker)));
        let result = retriever
            .retrieve(&query("telescopes observe distant galaxies"))
            .await
            .expect("retrieve");

        assert_eq!(result.sources.len(), 2);
        assert_eq!(result.sources[0].document_id, "doc-b");
        assert!((result.sources[0].best_score - 1.0).abs() < 1e-9);
        assert!(result.sources[1].best_score.abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_blank_question_is_rejected() {
        let harness = Harness::new().await;
        let err = harness
            .retriever()
            .retrieve(&query("   "))
            .await
            .expect_err("blank question");
        assert!(matches!(err, AppError::Validation(_)));
    }
}
