use surrealdb::sql::Datetime as SurrealDatetime;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

use super::document_meta::DocumentStatus;

/// Named steps of document processing.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extract,
    DetectLanguage,
    Chunk,
    Embed,
    Classify,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::DetectLanguage => "detect_language",
            Stage::Chunk => "chunk",
            Stage::Embed => "embed",
            Stage::Classify => "classify",
        }
    }

    /// Document status shown while this stage runs. Language detection has no
    /// dedicated status and reports plain `processing`.
    pub fn document_status(&self) -> DocumentStatus {
        match self {
            Stage::Extract => DocumentStatus::Extracting,
            Stage::DetectLanguage => DocumentStatus::Processing,
            Stage::Chunk => DocumentStatus::Chunking,
            Stage::Embed => DocumentStatus::Embedding,
            Stage::Classify => DocumentStatus::Classification,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Processing,
    Success,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Processing => "processing",
            EventStatus::Success => "success",
            EventStatus::Failed => "failed",
        }
    }
}

stored_object!(PipelineEvent, "pipeline_event", {
    document_id: String,
    workspace_id: String,
    stage: Stage,
    status: EventStatus,
    attempt: u32,
    trace_id: String,
    #[serde(with = "crate::storage::types::surreal_serde::datetime")]
    started_at: DateTime<Utc>,
    #[serde(with = "crate::storage::types::surreal_serde::option_datetime", default)]
    finished_at: Option<DateTime<Utc>>,
    duration_ms: Option<u64>,
    error_message: Option<String>
});

impl PipelineEvent {
    /// Append the `processing` row for a new attempt of `stage`.
    pub async fn start(
        db: &SurrealDbClient,
        document_id: &str,
        workspace_id: &str,
        stage: Stage,
        trace_id: &str,
    ) -> Result<PipelineEvent, AppError> {
        let attempt = Self::latest(db, document_id, stage)
            .await?
            .map_or(1, |event| event.attempt.saturating_add(1));
        let now = Utc::now();

        let event = PipelineEvent {
            id: Uuid::new_v4().to_string(),
            document_id: document_id.to_string(),
            workspace_id: workspace_id.to_string(),
            stage,
            status: EventStatus::Processing,
            attempt,
            trace_id: trace_id.to_string(),
            started_at: now,
            finished_at: None,
            duration_ms: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        };

        db.store_item(event.clone())
            .await?
            .ok_or_else(|| AppError::InternalError("pipeline event was not stored".into()))
    }

    pub async fn finish_success(
        &self,
        db: &SurrealDbClient,
        duration_ms: u64,
    ) -> Result<PipelineEvent, AppError> {
        self.finish(db, EventStatus::Success, duration_ms, None).await
    }

    pub async fn finish_failed(
        &self,
        db: &SurrealDbClient,
        duration_ms: u64,
        error_message: &str,
    ) -> Result<PipelineEvent, AppError> {
        self.finish(
            db,
            EventStatus::Failed,
            duration_ms,
            Some(error_message.to_string()),
        )
        .await
    }

    async fn finish(
        &self,
        db: &SurrealDbClient,
        status: EventStatus,
        duration_ms: u64,
        error_message: Option<String>,
    ) -> Result<PipelineEvent, AppError> {
        const FINISH_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET status = $status,
                finished_at = $now,
                duration_ms = $duration_ms,
                error_message = $error_message,
                updated_at = $now
            WHERE status = $processing
            RETURN AFTER;
        "#;

        let now = Utc::now();
        let mut result = db
            .client
            .query(FINISH_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("status", status.as_str()))
            .bind(("processing", EventStatus::Processing.as_str()))
            .bind(("now", SurrealDatetime::from(now)))
            .bind(("duration_ms", duration_ms))
            .bind(("error_message", error_message))
            .await?;

        let updated: Option<PipelineEvent> = result.take(0)?;
        updated.ok_or_else(|| {
            AppError::Validation(format!(
                "pipeline event {} for stage {} is already finished",
                self.id, self.stage
            ))
        })
    }

    /// Most recent attempt for `(document, stage)`.
    pub async fn latest(
        db: &SurrealDbClient,
        document_id: &str,
        stage: Stage,
    ) -> Result<Option<PipelineEvent>, AppError> {
        let mut result = db
            .client
            .query(
                "SELECT * FROM type::table($table)
                 WHERE document_id = $document_id AND stage = $stage
                 ORDER BY attempt DESC
                 LIMIT 1",
            )
            .bind(("table", Self::table_name()))
            .bind(("document_id", document_id.to_string()))
            .bind(("stage", stage.as_str()))
            .await?;

        let events: Vec<PipelineEvent> = result.take(0)?;
        Ok(events.into_iter().next())
    }

    pub async fn for_document(
        db: &SurrealDbClient,
        document_id: &str,
    ) -> Result<Vec<PipelineEvent>, AppError> {
        let events: Vec<PipelineEvent> = db
            .client
            .query(
                "SELECT * FROM type::table($table)
                 WHERE document_id = $document_id
                 ORDER BY started_at ASC, attempt ASC",
            )
            .bind(("table", Self::table_name()))
            .bind(("document_id", document_id.to_string()))
            .await?
            .take(0)?;

        Ok(events)
    }

    pub async fn delete_for_document(
        db: &SurrealDbClient,
        document_id: &str,
    ) -> Result<(), AppError> {
        db.client
            .query("DELETE type::table($table) WHERE document_id = $document_id")
            .bind(("table", Self::table_name()))
            .bind(("document_id", document_id.to_string()))
            .await?
            .check()?;
        Ok(())
    }
}
