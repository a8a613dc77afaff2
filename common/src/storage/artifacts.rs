//! Locations and JSON helpers for per-document artifacts in object storage.

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::AppError;

use super::store::StorageManager;

/// `{workspace}/{document}{ext}`, where `ext` includes the leading dot (or is empty).
pub fn raw_path(workspace_id: &str, document_id: &str, ext: &str) -> String {
    format!("{workspace_id}/{document_id}{ext}")
}

pub fn pages_path(workspace_id: &str, document_id: &str) -> String {
    format!("{workspace_id}/{document_id}.pages.json")
}

pub fn chunks_path(workspace_id: &str, document_id: &str) -> String {
    format!("{workspace_id}/{document_id}.chunks.json")
}

pub async fn save_json<T: Serialize + ?Sized>(
    storage: &StorageManager,
    location: &str,
    value: &T,
) -> Result<(), AppError> {
    let body = serde_json::to_vec(value)?;
    storage.put(location, Bytes::from(body)).await?;
    Ok(())
}

pub async fn load_json<T: DeserializeOwned>(
    storage: &StorageManager,
    location: &str,
) -> Result<T, AppError> {
    let bytes = storage.get(location).await.map_err(|err| match err {
        object_store::Error::NotFound { .. } => {
            AppError::NotFound(format!("artifact {location}"))
        }
        other => AppError::ObjectStore(other),
    })?;
    Ok(serde_json::from_slice(&bytes)?)
}
