use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::{error::AppError, storage::store::StorageManager};

use super::{cosine_similarity, ScoredVector, Vector, VectorIndex, VectorIndexConfig};

const ROOT: &str = "vectors";

/// Brute-force index over per-document JSON files at `vectors/{workspace}/{document}.json`.
///
/// Every search loads all of the workspace's vectors, so this backend suits small
/// deployments and tests. Ties keep insertion order within a document; documents
/// are visited in storage listing order.
#[derive(Clone)]
pub struct LocalVectorIndex {
    storage: StorageManager,
    config: VectorIndexConfig,
}

impl LocalVectorIndex {
    pub fn new(storage: StorageManager, config: VectorIndexConfig) -> Self {
        Self { storage, config }
    }

    fn document_path(workspace_id: &str, document_id: &str) -> Result<String, AppError> {
        check_segment(workspace_id)?;
        check_segment(document_id)?;
        Ok(format!("{ROOT}/{workspace_id}/{document_id}.json"))
    }

    fn workspace_prefix(workspace_id: &str) -> Result<String, AppError> {
        check_segment(workspace_id)?;
        Ok(format!("{ROOT}/{workspace_id}"))
    }

    async fn load(&self, location: &str) -> Result<Vec<Vector>, AppError> {
        match self.storage.get(location).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(object_store::Error::NotFound { .. }) => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    async fn load_workspace(&self, workspace_id: &str) -> Result<Vec<Vector>, AppError> {
        let prefix = Self::workspace_prefix(workspace_id)?;
        let mut files = self.storage.list(Some(&prefix)).await?;
        files.sort_by(|a, b| a.location.as_ref().cmp(b.location.as_ref()));

        let mut vectors = Vec::new();
        for file in files {
            vectors.extend(self.load(file.location.as_ref()).await?);
        }
        Ok(vectors)
    }
}

fn check_segment(segment: &str) -> Result<(), AppError> {
    if segment.is_empty() || segment.contains('/') || segment == "." || segment == ".." {
        return Err(AppError::Validation(format!(
            "invalid identifier for vector storage: {segment:?}"
        )));
    }
    Ok(())
}

#[async_trait]
impl VectorIndex for LocalVectorIndex {
    fn name(&self) -> &'static str {
        "local"
    }

    fn search_page_size(&self) -> usize {
        self.config.search_page_size
    }

    async fn upsert(&self, vectors: Vec<Vector>) -> Result<(), AppError> {
        // Group by target file, keeping first-seen order.
        let mut groups: Vec<(String, Vec<Vector>)> = Vec::new();
        for vector in vectors {
            let path =
                Self::document_path(&vector.payload.workspace_id, &vector.payload.document_id)?;
            match groups.iter_mut().find(|(p, _)| *p == path) {
                Some((_, group)) => group.push(vector),
                None => groups.push((path, vec![vector])),
            }
        }

        for (path, incoming) in groups {
            let mut stored = self.load(&path).await?;
            let count = incoming.len();
            for vector in incoming {
                match stored.iter_mut().find(|existing| existing.id == vector.id) {
                    Some(existing) => *existing = vector,
                    None => stored.push(vector),
                }
            }
            let body = serde_json::to_vec(&stored)?;
            self.storage.put(&path, Bytes::from(body)).await?;
            debug!(path = %path, upserted = count, total = stored.len(), "local vectors written");
        }

        Ok(())
    }

    async fn search_page(
        &self,
        embedding: &[f32],
        workspace_id: &str,
        threshold: f64,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ScoredVector>, AppError> {
        let candidates = self.load_workspace(workspace_id).await?;

        let mut scored: Vec<ScoredVector> = candidates
            .into_iter()
            .filter(|vector| vector.payload.workspace_id == workspace_id)
            .map(|vector| ScoredVector {
                score: cosine_similarity(embedding, &vector.values),
                vector,
            })
            .filter(|hit| hit.score >= threshold)
            .collect();

        // sort_by is stable, so equal scores keep load order.
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));

        Ok(scored.into_iter().skip(offset).take(limit).collect())
    }

    async fn delete_by_document(
        &self,
        workspace_id: &str,
        document_id: &str,
    ) -> Result<(), AppError> {
        let path = Self::document_path(workspace_id, document_id)?;
        self.storage.delete(&path).await?;
        Ok(())
    }

    async fn delete_by_workspace(&self, workspace_id: &str) -> Result<(), AppError> {
        let prefix = Self::workspace_prefix(workspace_id)?;
        self.storage.delete_prefix(&prefix).await?;
        Ok(())
    }
}
