//! Vector storage and similarity search, scoped by workspace.
//!
//! Two backends share the [`VectorIndex`] contract:
//! - [`surreal::SurrealVectorIndex`]: points live in a SurrealDB table and the
//!   database ranks and filters them.
//! - [`local::LocalVectorIndex`]: per-document JSON files in object storage,
//!   scored by brute-force cosine similarity in process.

pub mod local;
pub mod surreal;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    error::AppError,
    storage::{db::SurrealDbClient, store::StorageManager},
    utils::config::{AppConfig, VectorBackendKind},
};

/// Payload stored next to every vector. Unknown keys round-trip through `extra`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorPayload {
    pub workspace_id: String,
    pub document_id: String,
    pub chunk_id: String,
    pub text: String,
    pub page_start: Option<u32>,
    pub page_end: Option<u32>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Vector {
    pub id: String,
    pub values: Vec<f32>,
    pub payload: VectorPayload,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredVector {
    pub vector: Vector,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopK {
    Limit(usize),
    /// Every match above the threshold, fetched page by page.
    All,
}

#[derive(Debug, Clone, Copy)]
pub struct VectorIndexConfig {
    pub upsert_batch_size: usize,
    pub search_page_size: usize,
}

impl Default for VectorIndexConfig {
    fn default() -> Self {
        Self {
            upsert_batch_size: 100,
            search_page_size: 100,
        }
    }
}

impl VectorIndexConfig {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            upsert_batch_size: cfg.vector_upsert_batch_size.max(1),
            search_page_size: cfg.vector_search_page_size.max(1),
        }
    }
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &'static str;

    fn search_page_size(&self) -> usize;

    /// Insert or replace vectors by id.
    async fn upsert(&self, vectors: Vec<Vector>) -> Result<(), AppError>;

    /// One page of matches in `workspace_id` scoring at least `threshold`,
    /// ordered by descending score.
    async fn search_page(
        &self,
        embedding: &[f32],
        workspace_id: &str,
        threshold: f64,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ScoredVector>, AppError>;

    async fn delete_by_document(&self, workspace_id: &str, document_id: &str)
        -> Result<(), AppError>;

    async fn delete_by_workspace(&self, workspace_id: &str) -> Result<(), AppError>;

    async fn search(
        &self,
        embedding: &[f32],
        top_k: TopK,
        workspace_id: &str,
        threshold: f64,
    ) -> Result<Vec<ScoredVector>, AppError> {
        validate_search(embedding, workspace_id, threshold)?;

        match top_k {
            TopK::Limit(0) => Ok(Vec::new()),
            TopK::Limit(limit) => {
                self.search_page(embedding, workspace_id, threshold, limit, 0)
                    .await
            }
            TopK::All => {
                let page_size = self.search_page_size().max(1);
                let mut results = Vec::new();
                let mut offset = 0usize;
                loop {
                    let page = self
                        .search_page(embedding, workspace_id, threshold, page_size, offset)
                        .await?;
                    let fetched = page.len();
                    results.extend(page);
                    if fetched < page_size {
                        break;
                    }
                    offset = offset.saturating_add(page_size);
                }
                Ok(results)
            }
        }
    }
}

fn validate_search(embedding: &[f32], workspace_id: &str, threshold: f64) -> Result<(), AppError> {
    if workspace_id.trim().is_empty() {
        return Err(AppError::Validation(
            "vector search requires a workspace_id filter".into(),
        ));
    }
    if embedding.is_empty() {
        return Err(AppError::Validation("query embedding is empty".into()));
    }
    if threshold.is_nan() {
        return Err(AppError::Validation("score threshold is NaN".into()));
    }
    Ok(())
}

/// `dot(a, b) / (|a| |b|)`, or 0 when either norm is 0 or the dimensions differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let (mut dot, mut norm_a, mut norm_b) = (0f64, 0f64, 0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Construct the configured backend.
pub fn build_vector_index(
    cfg: &AppConfig,
    db: Arc<SurrealDbClient>,
    storage: StorageManager,
) -> Arc<dyn VectorIndex> {
    let index_config = VectorIndexConfig::from_config(cfg);
    match cfg.vector_backend {
        VectorBackendKind::Surreal => Arc::new(surreal::SurrealVectorIndex::new(db, index_config)),
        VectorBackendKind::Local => Arc::new(local::LocalVectorIndex::new(storage, index_config)),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_parallel_and_orthogonal_vectors() {
        assert!((cosine_similarity(&[1.0, 2.0], &[2.0, 4.0]) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-9);
    }

    #[test]
    fn cosine_is_zero_for_zero_norm_or_mismatched_dims() {
        assert_eq!(cosine_similarity(&[0.0, 0.0, 0.0], &[1.0, 2.0, 3.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0, 0.0], &[0.0, 0.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0, 2.0, 3.0]), 0.0);
    }

    #[test]
    fn payload_extra_fields_are_flattened() {
        let mut payload = test_support::vector("v1", "ws", "doc", vec![1.0]).payload;
        payload
            .extra
            .insert("language".into(), serde_json::json!("eng"));

        let json = serde_json::to_value(&payload).expect("serialize");
        assert_eq!(json["workspace_id"], "ws");
        assert_eq!(json["language"], "eng");

        let back: VectorPayload = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, payload);
    }

    #[test]
    fn search_arguments_are_validated() {
        assert!(validate_search(&[1.0], "", 0.0).is_err());
        assert!(validate_search(&[], "ws", 0.0).is_err());
        assert!(validate_search(&[1.0], "ws", f64::NAN).is_err());
        assert!(validate_search(&[0.0], "ws", 0.35).is_ok());
    }
}
