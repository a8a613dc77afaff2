use state_machines::state_machine;
use surrealdb::sql::Datetime as SurrealDatetime;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

use super::pipeline_event::Stage;

#[derive(Debug, Default, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    #[default]
    Pending,
    Queued,
    Processing,
    Extracting,
    Chunking,
    Embedding,
    Classification,
    Success,
    Failed,
}

impl DocumentStatus {
    pub const PROCESSING_STATES: [DocumentStatus; 5] = [
        DocumentStatus::Processing,
        DocumentStatus::Extracting,
        DocumentStatus::Chunking,
        DocumentStatus::Embedding,
        DocumentStatus::Classification,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Queued => "queued",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Extracting => "extracting",
            DocumentStatus::Chunking => "chunking",
            DocumentStatus::Embedding => "embedding",
            DocumentStatus::Classification => "classification",
            DocumentStatus::Success => "success",
            DocumentStatus::Failed => "failed",
        }
    }

    /// Per-stage statuses collapse onto `Processing`.
    pub fn coarse(self) -> DocumentStatus {
        if Self::PROCESSING_STATES.contains(&self) {
            DocumentStatus::Processing
        } else {
            self
        }
    }

    fn names(states: &[DocumentStatus]) -> Vec<&'static str> {
        states.iter().map(DocumentStatus::as_str).collect()
    }
}

#[derive(Debug, Clone, Copy)]
enum LifecycleEvent {
    Claim,
    Start,
    Succeed,
    Fail,
    Requeue,
}

impl LifecycleEvent {
    fn as_str(self) -> &'static str {
        match self {
            LifecycleEvent::Claim => "claim",
            LifecycleEvent::Start => "start",
            LifecycleEvent::Succeed => "succeed",
            LifecycleEvent::Fail => "fail",
            LifecycleEvent::Requeue => "requeue",
        }
    }

    /// Coarse states a row must be in for the conditional update to apply.
    fn allowed_from(self) -> Vec<DocumentStatus> {
        match self {
            LifecycleEvent::Claim => vec![DocumentStatus::Pending],
            LifecycleEvent::Start => vec![
                DocumentStatus::Pending,
                DocumentStatus::Queued,
                DocumentStatus::Failed,
            ],
            LifecycleEvent::Succeed => DocumentStatus::PROCESSING_STATES.to_vec(),
            LifecycleEvent::Fail => {
                let mut states = vec![DocumentStatus::Pending, DocumentStatus::Queued];
                states.extend(DocumentStatus::PROCESSING_STATES);
                states
            }
            LifecycleEvent::Requeue => vec![DocumentStatus::Failed, DocumentStatus::Success],
        }
    }
}

mod lifecycle {
    use super::state_machine;

    state_machine! {
        name: DocumentLifecycleMachine,
        initial: Pending,
        states: [Pending, Queued, Processing, Success, Failed],
        events {
            claim {
                transition: { from: Pending, to: Queued }
            }
            start {
                transition: { from: Pending, to: Processing }
                transition: { from: Queued, to: Processing }
                transition: { from: Failed, to: Processing }
            }
            succeed {
                transition: { from: Processing, to: Success }
            }
            fail {
                transition: { from: Pending, to: Failed }
                transition: { from: Queued, to: Failed }
                transition: { from: Processing, to: Failed }
            }
            requeue {
                transition: { from: Failed, to: Pending }
                transition: { from: Success, to: Pending }
            }
        }
    }

    pub(super) fn pending() -> DocumentLifecycleMachine<(), Pending> {
        DocumentLifecycleMachine::new(())
    }

    pub(super) fn queued() -> Option<DocumentLifecycleMachine<(), Queued>> {
        pending().claim().ok()
    }

    pub(super) fn processing() -> Option<DocumentLifecycleMachine<(), Processing>> {
        pending().start().ok()
    }

    pub(super) fn failed() -> Option<DocumentLifecycleMachine<(), Failed>> {
        pending().fail().ok()
    }

    pub(super) fn success() -> Option<DocumentLifecycleMachine<(), Success>> {
        processing()?.succeed().ok()
    }
}

fn invalid_transition(state: DocumentStatus, event: LifecycleEvent) -> AppError {
    AppError::Validation(format!(
        "Invalid document transition: {} -> {}",
        state.as_str(),
        event.as_str()
    ))
}

fn compute_next_state(
    state: DocumentStatus,
    event: LifecycleEvent,
) -> Result<DocumentStatus, AppError> {
    use lifecycle::*;
    let next = match (state.coarse(), event) {
        (DocumentStatus::Pending, LifecycleEvent::Claim) => {
            pending().claim().ok().map(|_| DocumentStatus::Queued)
        }
        (DocumentStatus::Pending, LifecycleEvent::Start) => {
            pending().start().ok().map(|_| DocumentStatus::Processing)
        }
        (DocumentStatus::Queued, LifecycleEvent::Start) => queued()
            .and_then(|m| m.start().ok())
            .map(|_| DocumentStatus::Processing),
        (DocumentStatus::Failed, LifecycleEvent::Start) => failed()
            .and_then(|m| m.start().ok())
            .map(|_| DocumentStatus::Processing),
        (DocumentStatus::Processing, LifecycleEvent::Succeed) => processing()
            .and_then(|m| m.succeed().ok())
            .map(|_| DocumentStatus::Success),
        (DocumentStatus::Pending, LifecycleEvent::Fail) => {
            pending().fail().ok().map(|_| DocumentStatus::Failed)
        }
        (DocumentStatus::Queued, LifecycleEvent::Fail) => queued()
            .and_then(|m| m.fail().ok())
            .map(|_| DocumentStatus::Failed),
        (DocumentStatus::Processing, LifecycleEvent::Fail) => processing()
            .and_then(|m| m.fail().ok())
            .map(|_| DocumentStatus::Failed),
        (DocumentStatus::Failed, LifecycleEvent::Requeue) => failed()
            .and_then(|m| m.requeue().ok())
            .map(|_| DocumentStatus::Pending),
        (DocumentStatus::Success, LifecycleEvent::Requeue) => success()
            .and_then(|m| m.requeue().ok())
            .map(|_| DocumentStatus::Pending),
        _ => None,
    };
    next.ok_or_else(|| invalid_transition(state, event))
}

stored_object!(DocumentMeta, "document", {
    workspace_id: String,
    source_id: Option<String>,
    sha256: String,
    title: Option<String>,
    mime: Option<String>,
    size_bytes: Option<u64>,
    #[serde(with = "crate::storage::types::surreal_serde::option_datetime", default)]
    fetched_at: Option<DateTime<Utc>>,
    #[serde(with = "crate::storage::types::surreal_serde::option_datetime", default)]
    stored_at: Option<DateTime<Utc>>,
    raw_path: String,
    pages_path: Option<String>,
    chunks_path: Option<String>,
    status: DocumentStatus,
    error_message: Option<String>,
    stage: Option<Stage>,
    page_count: Option<u32>,
    chunk_count: Option<u32>,
    author: Option<String>,
    document_created_at: Option<String>,
    language: Option<String>,
    language_confidence: Option<f64>,
    classification: Option<String>,
    classification_score: Option<f64>
});

impl DocumentMeta {
    /// A fresh `pending` document pointing at an already stored raw file.
    pub fn new(id: String, workspace_id: String, sha256: String, raw_path: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            workspace_id,
            source_id: None,
            sha256,
            title: None,
            mime: None,
            size_bytes: None,
            fetched_at: None,
            stored_at: None,
            raw_path,
            pages_path: None,
            chunks_path: None,
            status: DocumentStatus::Pending,
            error_message: None,
            stage: None,
            page_count: None,
            chunk_count: None,
            author: None,
            document_created_at: None,
            language: None,
            language_confidence: None,
            classification: None,
            classification_score: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub async fn get(db: &SurrealDbClient, id: &str) -> Result<DocumentMeta, AppError> {
        db.get_item::<DocumentMeta>(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("document {id}")))
    }

    pub async fn find_by_sha256(
        db: &SurrealDbClient,
        workspace_id: &str,
        sha256: &str,
    ) -> Result<Option<DocumentMeta>, AppError> {
        let mut result = db
            .client
            .query(
                "SELECT * FROM type::table($table)
                 WHERE workspace_id = $workspace_id AND sha256 = $sha256
                 LIMIT 1",
            )
            .bind(("table", Self::table_name()))
            .bind(("workspace_id", workspace_id.to_string()))
            .bind(("sha256", sha256.to_string()))
            .await?;

        let found: Vec<DocumentMeta> = result.take(0)?;
        Ok(found.into_iter().next())
    }

    /// Insert the row unless `(workspace_id, sha256)` is already present.
    ///
    /// The lookup covers the common case; the unique index catches two inserts
    /// racing past it. Both surface as `DuplicateDocument`.
    pub async fn insert_unique(self, db: &SurrealDbClient) -> Result<DocumentMeta, AppError> {
        if Self::find_by_sha256(db, &self.workspace_id, &self.sha256)
            .await?
            .is_some()
        {
            return Err(self.duplicate_error());
        }
        if db.get_item::<DocumentMeta>(&self.id).await?.is_some() {
            return Err(self.id_conflict_error());
        }

        let duplicate = self.duplicate_error();
        let conflict = self.id_conflict_error();
        match db.store_item(self).await {
            Ok(Some(stored)) => Ok(stored),
            Ok(None) => Err(AppError::InternalError(
                "document insert returned no row".into(),
            )),
            Err(err) if is_sha_index_violation(&err) => Err(duplicate),
            Err(err) if is_record_conflict(&err) => Err(conflict),
            Err(err) => Err(err.into()),
        }
    }

    /// Same id already registered with different content.
    fn id_conflict_error(&self) -> AppError {
        AppError::Validation(format!(
            "document {} is already registered with different content (sha256 {} rejected)",
            self.id, self.sha256
        ))
    }

    fn duplicate_error(&self) -> AppError {
        AppError::DuplicateDocument {
            workspace_id: self.workspace_id.clone(),
            sha256: self.sha256.clone(),
        }
    }

    pub async fn list_pending(
        db: &SurrealDbClient,
        limit: usize,
    ) -> Result<Vec<DocumentMeta>, AppError> {
        let documents: Vec<DocumentMeta> = db
            .client
            .query(
                "SELECT * FROM type::table($table)
                 WHERE status = $pending
                 ORDER BY created_at ASC
                 LIMIT $limit",
            )
            .bind(("table", Self::table_name()))
            .bind(("pending", DocumentStatus::Pending.as_str()))
            .bind(("limit", limit))
            .await?
            .take(0)?;

        Ok(documents)
    }

    /// Atomically move a `pending` row to `queued`.
    ///
    /// Returns `None` when another scanner claimed it first or the row left `pending`.
    pub async fn claim(
        db: &SurrealDbClient,
        id: &str,
    ) -> Result<Option<DocumentMeta>, AppError> {
        debug_assert!(compute_next_state(DocumentStatus::Pending, LifecycleEvent::Claim).is_ok());
        Self::conditional_status_update(db, id, LifecycleEvent::Claim, DocumentStatus::Queued)
            .await
    }

    pub async fn mark_processing(&self, db: &SurrealDbClient) -> Result<DocumentMeta, AppError> {
        self.transition(db, LifecycleEvent::Start).await
    }

    pub async fn mark_success(&self, db: &SurrealDbClient) -> Result<DocumentMeta, AppError> {
        self.transition(db, LifecycleEvent::Succeed).await
    }

    /// Reset a terminal document to `pending` so the scanner picks it up again.
    pub async fn requeue(&self, db: &SurrealDbClient) -> Result<DocumentMeta, AppError> {
        self.transition(db, LifecycleEvent::Requeue).await
    }

    pub async fn mark_failed(
        &self,
        db: &SurrealDbClient,
        error_message: &str,
    ) -> Result<DocumentMeta, AppError> {
        compute_next_state(self.status, LifecycleEvent::Fail)?;

        const FAIL_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET status = $failed,
                error_message = $error_message,
                updated_at = $now
            WHERE status IN $allowed
            RETURN AFTER;
        "#;

        let mut result = db
            .client
            .query(FAIL_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("failed", DocumentStatus::Failed.as_str()))
            .bind(("error_message", error_message.to_string()))
            .bind(("allowed", DocumentStatus::names(&LifecycleEvent::Fail.allowed_from())))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .await?;

        let updated: Option<DocumentMeta> = result.take(0)?;
        updated.ok_or_else(|| invalid_transition(self.status, LifecycleEvent::Fail))
    }

    async fn transition(
        &self,
        db: &SurrealDbClient,
        event: LifecycleEvent,
    ) -> Result<DocumentMeta, AppError> {
        let next = compute_next_state(self.status, event)?;
        Self::conditional_status_update(db, &self.id, event, next)
            .await?
            .ok_or_else(|| invalid_transition(self.status, event))
    }

    async fn conditional_status_update(
        db: &SurrealDbClient,
        id: &str,
        event: LifecycleEvent,
        next: DocumentStatus,
    ) -> Result<Option<DocumentMeta>, AppError> {
        const STATUS_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET status = $next,
                error_message = if $clear_error THEN NONE ELSE error_message END,
                stage = if $clear_stage THEN NONE ELSE stage END,
                updated_at = $now
            WHERE status IN $allowed
            RETURN AFTER;
        "#;

        let clear_error = matches!(event, LifecycleEvent::Succeed | LifecycleEvent::Requeue);
        let clear_stage = matches!(event, LifecycleEvent::Requeue);

        let mut result = db
            .client
            .query(STATUS_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_string()))
            .bind(("next", next.as_str()))
            .bind(("clear_error", clear_error))
            .bind(("clear_stage", clear_stage))
            .bind(("allowed", DocumentStatus::names(&event.allowed_from())))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .await?;

        let updated: Option<DocumentMeta> = result.take(0)?;
        Ok(updated)
    }

    /// Record the running stage and its per-stage status. Only valid while processing.
    pub async fn set_stage(
        db: &SurrealDbClient,
        id: &str,
        stage: Stage,
    ) -> Result<DocumentMeta, AppError> {
        const STAGE_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET stage = $stage,
                status = $status,
                updated_at = $now
            WHERE status IN $processing
            RETURN AFTER;
        "#;

        let mut result = db
            .client
            .query(STAGE_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_string()))
            .bind(("stage", stage.as_str()))
            .bind(("status", stage.document_status().as_str()))
            .bind((
                "processing",
                DocumentStatus::names(&DocumentStatus::PROCESSING_STATES),
            ))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .await?;

        let updated: Option<DocumentMeta> = result.take(0)?;
        updated.ok_or_else(|| {
            AppError::Validation(format!(
                "document {id} is not processing; cannot enter stage {stage}"
            ))
        })
    }

    pub async fn record_error(
        db: &SurrealDbClient,
        id: &str,
        error_message: &str,
    ) -> Result<(), AppError> {
        Self::patch(
            db,
            id,
            serde_json::json!({ "error_message": error_message }),
        )
        .await
    }

    pub async fn update_extraction(
        db: &SurrealDbClient,
        id: &str,
        pages_path: &str,
        page_count: u32,
        author: Option<String>,
        document_created_at: Option<String>,
    ) -> Result<(), AppError> {
        Self::patch(
            db,
            id,
            serde_json::json!({
                "pages_path": pages_path,
                "page_count": page_count,
                "author": author,
                "document_created_at": document_created_at,
            }),
        )
        .await
    }

    pub async fn update_language(
        db: &SurrealDbClient,
        id: &str,
        language: &str,
        confidence: f64,
    ) -> Result<(), AppError> {
        Self::patch(
            db,
            id,
            serde_json::json!({ "language": language, "language_confidence": confidence }),
        )
        .await
    }

    pub async fn update_chunks(
        db: &SurrealDbClient,
        id: &str,
        chunks_path: &str,
        chunk_count: u32,
    ) -> Result<(), AppError> {
        Self::patch(
            db,
            id,
            serde_json::json!({ "chunks_path": chunks_path, "chunk_count": chunk_count }),
        )
        .await
    }

    pub async fn update_classification(
        db: &SurrealDbClient,
        id: &str,
        label: &str,
        score: f64,
    ) -> Result<(), AppError> {
        Self::patch(
            db,
            id,
            serde_json::json!({ "classification": label, "classification_score": score }),
        )
        .await
    }

    /// Merge plain fields into the row. Lifecycle fields go through the
    /// conditional updates above instead.
    async fn patch(
        db: &SurrealDbClient,
        id: &str,
        fields: serde_json::Value,
    ) -> Result<(), AppError> {
        let mut result = db
            .client
            .query(
                "UPDATE type::thing($table, $id) MERGE $fields RETURN NONE;
                 UPDATE type::thing($table, $id) SET updated_at = $now RETURN AFTER;",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_string()))
            .bind(("fields", fields))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .await?
            .check()?;

        let updated: Option<DocumentMeta> = result.take(1)?;
        updated
            .map(|_| ())
            .ok_or_else(|| AppError::NotFound(format!("document {id}")))
    }
}

fn is_sha_index_violation(err: &surrealdb::Error) -> bool {
    let message = err.to_string();
    message.contains("idx_document_sha") && message.contains("already contains")
}

fn is_record_conflict(err: &surrealdb::Error) -> bool {
    err.to_string().contains("already exists")
}
