use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::{path::Path as ObjPath, ObjectStore};

use crate::utils::config::{AppConfig, StorageKind};

pub type DynStore = Arc<dyn ObjectStore>;

/// Object storage for raw documents and derived artifacts.
///
/// Keys are logical `/`-separated locations (`{workspace}/{document}.pages.json`);
/// the backend is either the local filesystem under `data_dir` or memory.
#[derive(Clone)]
pub struct StorageManager {
    store: DynStore,
    backend_kind: StorageKind,
    local_base: Option<PathBuf>,
}

impl StorageManager {
    pub async fn new(cfg: &AppConfig) -> object_store::Result<Self> {
        let backend_kind = cfg.storage.clone();
        let (store, local_base) = create_storage_backend(&cfg.storage, &cfg.data_dir).await?;

        Ok(Self {
            store,
            backend_kind,
            local_base,
        })
    }

    /// Local filesystem storage rooted at `base`, created if missing.
    pub async fn local(base: impl AsRef<Path>) -> object_store::Result<Self> {
        let base = base.as_ref().to_string_lossy().to_string();
        let (store, local_base) = create_storage_backend(&StorageKind::Local, &base).await?;
        Ok(Self {
            store,
            backend_kind: StorageKind::Local,
            local_base,
        })
    }

    /// Volatile in-memory storage; contents live as long as the manager (and its clones).
    pub fn memory() -> Self {
        Self::with_backend(Arc::new(InMemory::new()), StorageKind::Memory)
    }

    pub fn with_backend(store: DynStore, backend_kind: StorageKind) -> Self {
        Self {
            store,
            backend_kind,
            local_base: None,
        }
    }

    pub fn local_base_path(&self) -> Option<&Path> {
        self.local_base.as_deref()
    }

    pub async fn put(&self, location: &str, data: Bytes) -> object_store::Result<()> {
        let path = ObjPath::from(location);
        let payload = object_store::PutPayload::from_bytes(data);
        self.store.put(&path, payload).await.map(|_| ())
    }

    pub async fn get(&self, location: &str) -> object_store::Result<Bytes> {
        let path = ObjPath::from(location);
        let result = self.store.get(&path).await?;
        result.bytes().await
    }

    /// Delete a single object. Deleting a missing object is not an error.
    pub async fn delete(&self, location: &str) -> object_store::Result<()> {
        let path = ObjPath::from(location);
        match self.store.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Delete all objects below the specified prefix.
    ///
    /// For local filesystem backends, this also attempts to clean up empty directories.
    pub async fn delete_prefix(&self, prefix: &str) -> object_store::Result<()> {
        let prefix_path = ObjPath::from(prefix);
        let locations = self
            .store
            .list(Some(&prefix_path))
            .map_ok(|m| m.location)
            .boxed();
        self.store
            .delete_stream(locations)
            .try_collect::<Vec<_>>()
            .await?;

        if matches!(self.backend_kind, StorageKind::Local) {
            self.cleanup_filesystem_directories(prefix).await;
        }

        Ok(())
    }

    pub async fn list(
        &self,
        prefix: Option<&str>,
    ) -> object_store::Result<Vec<object_store::ObjectMeta>> {
        let prefix_path = prefix.map(ObjPath::from);
        self.store.list(prefix_path.as_ref()).try_collect().await
    }

    pub async fn exists(&self, location: &str) -> object_store::Result<bool> {
        let path = ObjPath::from(location);
        self.store
            .head(&path)
            .await
            .map(|_| true)
            .or_else(|e| match e {
                object_store::Error::NotFound { .. } => Ok(false),
                _ => Err(e),
            })
    }

    /// Best-effort removal of empty directories left behind by `delete_prefix`.
    async fn cleanup_filesystem_directories(&self, prefix: &str) {
        let Some(base) = &self.local_base else {
            return;
        };

        let relative = Path::new(prefix);
        if relative.is_absolute()
            || relative
                .components()
                .any(|component| matches!(component, Component::ParentDir | Component::Prefix(_)))
        {
            tracing::warn!(
                prefix = %prefix,
                "Skipping directory cleanup for unsupported prefix components"
            );
            return;
        }

        let mut current = base.join(relative);

        while current.starts_with(base) && current.as_path() != base.as_path() {
            match tokio::fs::remove_dir(&current).await {
                Ok(()) => {}
                Err(err) => match err.kind() {
                    ErrorKind::NotFound => {}
                    ErrorKind::DirectoryNotEmpty => break,
                    _ => tracing::debug!(
                        error = %err,
                        path = %current.display(),
                        "Failed to remove directory during cleanup"
                    ),
                },
            }

            if let Some(parent) = current.parent() {
                current = parent.to_path_buf();
            } else {
                break;
            }
        }
    }
}

async fn create_storage_backend(
    kind: &StorageKind,
    data_dir: &str,
) -> object_store::Result<(DynStore, Option<PathBuf>)> {
    match kind {
        StorageKind::Local => {
            let base = resolve_base_dir(data_dir);
            if !base.exists() {
                tokio::fs::create_dir_all(&base).await.map_err(|e| {
                    object_store::Error::Generic {
                        store: "LocalFileSystem",
                        source: e.into(),
                    }
                })?;
            }
            let store = LocalFileSystem::new_with_prefix(base.clone())?;
            Ok((Arc::new(store), Some(base)))
        }
        StorageKind::Memory => Ok((Arc::new(InMemory::new()), None)),
    }
}

/// Resolve the absolute base directory used for local storage.
///
/// If `data_dir` is relative, it is resolved against the current working directory.
pub fn resolve_base_dir(data_dir: &str) -> PathBuf {
    let path = PathBuf::from(data_dir);
    if path.is_absolute() {
        path
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_memory_basic_operations() {
        let storage = StorageManager::memory();
        assert!(storage.local_base_path().is_none());

        let location = "ws-1/doc-1.pages.json";
        let data = b"[]";

        storage
            .put(location, Bytes::from(data.to_vec()))
            .await
            .expect("put");
        let retrieved = storage.get(location).await.expect("get");
        assert_eq!(retrieved.as_ref(), data);
        assert!(storage.exists(location).await.expect("exists check"));

        storage.delete(location).await.expect("delete");
        assert!(!storage.exists(location).await.expect("exists after delete"));

        // Deleting twice is fine.
        storage.delete(location).await.expect("delete missing");
    }

    #[tokio::test]
    async fn test_local_delete_prefix_cleans_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = StorageManager::local(dir.path()).await.expect("local storage");
        let base = storage.local_base_path().expect("base").to_path_buf();

        storage
            .put("ws-1/doc-1.pdf", Bytes::from_static(b"%PDF"))
            .await
            .expect("put raw");
        storage
            .put("ws-1/doc-1.chunks.json", Bytes::from_static(b"[]"))
            .await
            .expect("put chunks");
        storage
            .put("ws-2/doc-9.pdf", Bytes::from_static(b"%PDF"))
            .await
            .expect("put other workspace");

        storage.delete_prefix("ws-1").await.expect("delete prefix");

        assert!(!storage.exists("ws-1/doc-1.pdf").await.expect("exists"));
        assert!(!storage
            .exists("ws-1/doc-1.chunks.json")
            .await
            .expect("exists"));
        assert!(storage.exists("ws-2/doc-9.pdf").await.expect("exists"));
        assert!(
            tokio::fs::metadata(base.join("ws-1")).await.is_err(),
            "workspace directory should be removed"
        );
        tokio::fs::metadata(&base)
            .await
            .expect("base directory remains intact");
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let storage = StorageManager::memory();
        for location in ["a/one.json", "a/two.json", "b/three.json"] {
            storage
                .put(location, Bytes::from_static(b"{}"))
                .await
                .expect("put");
        }

        let listed = storage.list(Some("a")).await.expect("list");
        let mut names: Vec<String> = listed.iter().map(|m| m.location.to_string()).collect();
        names.sort();
        assert_eq!(names, vec!["a/one.json".to_string(), "a/two.json".to_string()]);

        let all = storage.list(None).await.expect("list all");
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let storage = StorageManager::memory();
        let err = storage.get("missing.json").await.expect_err("missing object");
        assert!(matches!(err, object_store::Error::NotFound { .. }));
    }

    #[test]
    fn test_resolve_base_dir_absolute_and_relative() {
        assert_eq!(resolve_base_dir("/srv/data"), PathBuf::from("/srv/data"));
        let relative = resolve_base_dir("data");
        assert!(relative.is_absolute());
        assert!(relative.ends_with("data"));
    }
}
