use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{
    error::AppError,
    storage::{db::SurrealDbClient, types::document_meta::DocumentMeta},
};
use serde::Deserialize;
use tracing::{debug, info};

use crate::source::Delivery;

/// Handles one delivery. Must be idempotent: failed deliveries are redelivered.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> Result<(), AppError>;
}

/// New-document notification as published by the fetcher.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct NewDocumentEvent {
    pub doc_id: String,
    pub workspace_id: String,
    #[serde(default)]
    pub source_id: Option<String>,
    pub sha256: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub mime: Option<String>,
    pub stored_path: String,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub fetched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stored_at: Option<DateTime<Utc>>,
}

impl NewDocumentEvent {
    pub fn parse(payload: &[u8]) -> Result<Self, AppError> {
        let event: Self = serde_json::from_slice(payload)?;
        if event.doc_id.trim().is_empty()
            || event.workspace_id.trim().is_empty()
            || event.sha256.trim().is_empty()
            || event.stored_path.trim().is_empty()
        {
            return Err(AppError::Validation(
                "new-document event is missing doc_id, workspace_id, sha256 or stored_path".into(),
            ));
        }
        Ok(event)
    }

    pub fn into_document(self) -> DocumentMeta {
        let mut document =
            DocumentMeta::new(self.doc_id, self.workspace_id, self.sha256, self.stored_path);
        document.source_id = self.source_id;
        document.title = self.title;
        document.mime = self.mime;
        document.size_bytes = self.size_bytes;
        document.fetched_at = self.fetched_at;
        document.stored_at = self.stored_at;
        document
    }
}

/// Materializes `pending` document rows from new-document events.
pub struct DocumentEventHandler {
    db: Arc<SurrealDbClient>,
}

impl DocumentEventHandler {
    pub fn new(db: Arc<SurrealDbClient>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MessageHandler for DocumentEventHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<(), AppError> {
        let event = NewDocumentEvent::parse(&delivery.payload)?;
        let document_id = event.doc_id.clone();
        let workspace_id = event.workspace_id.clone();

        if let Some(existing) = self.db.get_item::<DocumentMeta>(&document_id).await? {
            if existing.workspace_id == workspace_id && existing.sha256 == event.sha256 {
                debug!(%document_id, "document row already exists; redelivery");
                return Ok(());
            }
        }

        let stored = event.into_document().insert_unique(&self.db).await?;
        info!(
            document_id = %stored.id,
            workspace_id = %stored.workspace_id,
            "document registered as pending"
        );
        Ok(())
    }
}
