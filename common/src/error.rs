use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("Object storage error: {0}")]
    ObjectStore(#[from] object_store::Error),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("OpenAI error: {0}")]
    OpenAI(#[from] OpenAIError),
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("Extraction error: {0}")]
    Extraction(String),
    #[error("Document contains no usable text: {0}")]
    EmptyText(String),
    #[error("Duplicate document: sha256 {sha256} already present in workspace {workspace_id}")]
    DuplicateDocument { workspace_id: String, sha256: String },
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Queue error: {0}")]
    Queue(String),
    #[error("Cancelled: {0}")]
    Cancelled(String),
    #[error("Ingestion Processing error: {0}")]
    Processing(String),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

impl AppError {
    /// Whether the task layer may retry the operation that produced this error.
    ///
    /// Backend failures (storage, vector backend, queue, embedding) are transient;
    /// content and programmer errors are not.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            AppError::Extraction(_)
                | AppError::EmptyText(_)
                | AppError::DuplicateDocument { .. }
                | AppError::Validation(_)
                | AppError::NotFound(_)
                | AppError::Serialization(_)
        )
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, AppError::DuplicateDocument { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_errors_are_not_retryable() {
        assert!(!AppError::Extraction("corrupt".into()).is_retryable());
        assert!(!AppError::EmptyText("doc".into()).is_retryable());
        assert!(!AppError::Validation("bad filter".into()).is_retryable());
        assert!(!AppError::DuplicateDocument {
            workspace_id: "ws".into(),
            sha256: "abc".into()
        }
        .is_retryable());
    }

    #[test]
    fn backend_errors_are_retryable() {
        assert!(AppError::Queue("connection reset".into()).is_retryable());
        assert!(AppError::Cancelled("embedding slot".into()).is_retryable());
        assert!(AppError::Io(std::io::Error::other("disk")).is_retryable());
    }

    #[test]
    fn duplicate_is_detected() {
        let err = AppError::DuplicateDocument {
            workspace_id: "ws".into(),
            sha256: "abc".into(),
        };
        assert!(err.is_duplicate());
        assert!(!AppError::NotFound("doc".into()).is_duplicate());
    }
}
