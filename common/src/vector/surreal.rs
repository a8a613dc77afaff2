use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::{error::AppError, storage::db::SurrealDbClient};

use super::{ScoredVector, Vector, VectorIndex, VectorIndexConfig, VectorPayload};

pub const VECTOR_TABLE: &str = "vector_point";

const UPSERT_POINTS: &str = r"
    FOR $point IN $points {
        UPSERT type::thing($table, $point.id) CONTENT {
            workspace_id: $point.payload.workspace_id,
            document_id: $point.payload.document_id,
            embedding: $point.values,
            payload: $point.payload
        };
    };
";

// Points whose dimension differs from the query, or that have a zero norm,
// score 0 instead of failing the whole query, matching `cosine_similarity`.
const SEARCH_POINTS: &str = r"
    SELECT * FROM (
        SELECT
            record::id(id) AS id,
            embedding,
            payload,
            IF array::len(embedding) != array::len($query)
                OR vector::magnitude(embedding) = 0
                OR vector::magnitude($query) = 0
            THEN 0.0
            ELSE vector::similarity::cosine(embedding, $query)
            END AS score
        FROM type::table($table)
        WHERE workspace_id = $workspace_id
    )
    WHERE score >= $threshold
    ORDER BY score DESC
    LIMIT $limit START $start;
";

/// Vector index backed by a SurrealDB table; ranking and threshold filtering
/// run inside the database.
#[derive(Clone)]
pub struct SurrealVectorIndex {
    db: Arc<SurrealDbClient>,
    config: VectorIndexConfig,
}

#[derive(Debug, Deserialize)]
struct PointHit {
    id: String,
    embedding: Vec<f32>,
    payload: VectorPayload,
    score: f64,
}

impl SurrealVectorIndex {
    pub fn new(db: Arc<SurrealDbClient>, config: VectorIndexConfig) -> Self {
        Self { db, config }
    }
}

#[async_trait]
impl VectorIndex for SurrealVectorIndex {
    fn name(&self) -> &'static str {
        "surreal"
    }

    fn search_page_size(&self) -> usize {
        self.config.search_page_size
    }

    async fn upsert(&self, vectors: Vec<Vector>) -> Result<(), AppError> {
        let total = vectors.len();
        for batch in vectors.chunks(self.config.upsert_batch_size.max(1)) {
            let points = serde_json::to_value(batch)?;
            self.db
                .client
                .query(UPSERT_POINTS)
                .bind(("table", VECTOR_TABLE))
                .bind(("points", points))
                .await?
                .check()?;
            debug!(batch = batch.len(), total, "vector batch upserted");
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
        let mut response = self
            .db
            .client
            .query(SEARCH_POINTS)
            .bind(("table", VECTOR_TABLE))
            .bind(("query", embedding.to_vec()))
            .bind(("workspace_id", workspace_id.to_string()))
            .bind(("threshold", threshold))
            .bind(("limit", limit))
            .bind(("start", offset))
            .await?;

        let rows: Vec<serde_json::Value> = response.take(0)?;
        rows.into_iter()
            .map(|row| {
                let hit: PointHit = serde_json::from_value(row)?;
                Ok(ScoredVector {
                    score: hit.score,
                    vector: Vector {
                        id: hit.id,
                        values: hit.embedding,
                        payload: hit.payload,
                    },
                })
            })
            .collect()
    }

    async fn delete_by_document(
        &self,
        workspace_id: &str,
        document_id: &str,
    ) -> Result<(), AppError> {
        self.db
            .client
            .query(
                "DELETE type::table($table) WHERE workspace_id = $workspace_id AND document_id = $document_id",
            )
            .bind(("table", VECTOR_TABLE))
            .bind(("workspace_id", workspace_id.to_string()))
            .bind(("document_id", document_id.to_string()))
            .await?
            .check()?;
        Ok(())
    }

    async fn delete_by_workspace(&self, workspace_id: &str) -> Result<(), AppError> {
        self.db
            .client
            .query("DELETE type::table($table) WHERE workspace_id = $workspace_id")
            .bind(("table", VECTOR_TABLE))
            .bind(("workspace_id", workspace_id.to_string()))
            .await?
            .check()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        storage::store::StorageManager,
        vector::{local::LocalVectorIndex, test_support::vector, TopK},
    };
    use uuid::Uuid;

    async fn index(page_size: usize, batch_size: usize) -> SurrealVectorIndex {
        let database = Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("test_ns", &database)
            .await
            .expect("in-memory surrealdb");
        SurrealVectorIndex::new(
            Arc::new(db),
            VectorIndexConfig {
                upsert_batch_size: batch_size,
                search_page_size: page_size,
            },
        )
    }

    #[tokio::test]
    async fn test_upsert_in_batches_and_search() {
        let index = index(100, 2).await;
        index
            .upsert(vec![
                vector("a", "ws", "doc-1", vec![1.0, 0.0]),
                vector("b", "ws", "doc-1", vec![0.7, 0.7]),
                vector("c", "ws", "doc-2", vec![0.0, 1.0]),
                vector("d", "other", "doc-3", vec![1.0, 0.0]),
                vector("e", "ws", "doc-2", vec![0.9, 0.1]),
            ])
            .await
            .expect("upsert");

        let hits = index
            .search(&[1.0, 0.0], TopK::Limit(10), "ws", 0.5)
            .await
            .expect("search");
        let ids: Vec<&str> = hits.iter().map(|h| h.vector.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "e", "b"]);
        assert!(hits.iter().all(|h| h.vector.payload.workspace_id == "ws"));
        assert_eq!(hits.first().map(|h| h.vector.values.clone()), Some(vec![1.0, 0.0]));
    }

    #[tokio::test]
    async fn test_upsert_twice_leaves_results_unchanged() {
        let index = index(100, 10).await;
        let batch = vec![
            vector("a", "ws", "doc", vec![1.0, 0.0]),
            vector("b", "ws", "doc", vec![0.5, 0.5]),
        ];
        index.upsert(batch.clone()).await.expect("first");
        let before = index
            .search(&[1.0, 0.0], TopK::All, "ws", 0.0)
            .await
            .expect("before");
        index.upsert(batch).await.expect("second");
        let after = index
            .search(&[1.0, 0.0], TopK::All, "ws", 0.0)
            .await
            .expect("after");

        assert_eq!(before.len(), 2);
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_all_pages_through_results() {
        let index = index(2, 10).await;
        let vectors: Vec<Vector> = (0..5u8)
            .map(|i| {
                let x = f32::from(i) + 1.0;
                vector(&format!("v{i}"), "ws", "doc", vec![x, 1.0])
            })
            .collect();
        index.upsert(vectors).await.expect("upsert");

        let all = index
            .search(&[1.0, 0.0], TopK::All, "ws", 0.0)
            .await
            .expect("all");
        assert_eq!(all.len(), 5);
        assert!(all.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[tokio::test]
    async fn test_delete_filters() {
        let index = index(100, 10).await;
        index
            .upsert(vec![
                vector("a", "ws-1", "doc-1", vec![1.0, 0.0]),
                vector("b", "ws-1", "doc-2", vec![1.0, 0.0]),
                vector("c", "ws-2", "doc-3", vec![1.0, 0.0]),
            ])
            .await
            .expect("upsert");

        index
            .delete_by_document("ws-1", "doc-1")
            .await
            .expect("delete doc");
        let remaining = index
            .search(&[1.0, 0.0], TopK::All, "ws-1", 0.0)
            .await
            .expect("search");
        assert_eq!(remaining.len(), 1);

        index.delete_by_workspace("ws-1").await.expect("delete ws");
        assert!(index
            .search(&[1.0, 0.0], TopK::All, "ws-1", 0.0)
            .await
            .expect("search")
            .is_empty());
        assert_eq!(
            index
                .search(&[1.0, 0.0], TopK::All, "ws-2", 0.0)
                .await
                .expect("search")
                .len(),
            1
        );
    }

    fn scores(hits: &[ScoredVector]) -> Vec<(String, f64)> {
        let mut scores: Vec<(String, f64)> = hits
            .iter()
            .map(|h| (h.vector.id.clone(), (h.score * 1e6).round() / 1e6))
            .collect();
        scores.sort_by(|a, b| a.0.cmp(&b.0));
        scores
    }

    #[tokio::test]
    async fn test_zero_norm_and_mismatched_dimensions_score_zero() {
        let index = index(100, 10).await;
        index
            .upsert(vec![
                vector("a", "ws", "doc", vec![1.0, 0.0]),
                vector("z", "ws", "doc", vec![0.0, 0.0]),
                vector("wide", "ws", "doc", vec![1.0, 0.0, 0.0]),
            ])
            .await
            .expect("upsert");

        let hits = index
            .search(&[1.0, 0.0], TopK::All, "ws", 0.0)
            .await
            .expect("search succeeds despite a mismatched dimension");
        assert_eq!(
            scores(&hits),
            vec![
                ("a".to_string(), 1.0),
                ("wide".to_string(), 0.0),
                ("z".to_string(), 0.0)
            ]
        );
        assert_eq!(hits.first().map(|h| h.vector.id.as_str()), Some("a"));

        let above = index
            .search(&[1.0, 0.0], TopK::All, "ws", 0.1)
            .await
            .expect("search");
        assert_eq!(scores(&above), vec![("a".to_string(), 1.0)]);
    }

    #[tokio::test]
    async fn test_scores_match_local_backend() {
        let surreal = index(100, 10).await;
        let local = LocalVectorIndex::new(StorageManager::memory(), VectorIndexConfig::default());
        let vectors = vec![
            vector("a", "ws", "doc-1", vec![1.0, 0.0]),
            vector("b", "ws", "doc-1", vec![0.6, 0.8]),
            vector("c", "ws", "doc-2", vec![-1.0, 0.2]),
            vector("z", "ws", "doc-2", vec![0.0, 0.0]),
            vector("wide", "ws", "doc-3", vec![1.0, 0.0, 0.0]),
        ];
        surreal.upsert(vectors.clone()).await.expect("surreal upsert");
        local.upsert(vectors).await.expect("local upsert");

        for threshold in [-1.0, 0.0, 0.5] {
            let from_surreal = surreal
                .search(&[1.0, 0.0], TopK::All, "ws", threshold)
                .await
                .expect("surreal search");
            let from_local = local
                .search(&[1.0, 0.0], TopK::All, "ws", threshold)
                .await
                .expect("local search");
            assert_eq!(
                scores(&from_surreal),
                scores(&from_local),
                "threshold {threshold}"
            );
        }
    }
}
