use super::types::{document_meta::DocumentMeta, pipeline_event::PipelineEvent, StoredObject};
use std::ops::Deref;
use surrealdb::{
    engine::any::{connect, Any},
    opt::auth::Root,
    Error, Surreal,
};

/// Metadata repository handle. Entity-specific queries live on the entity types.
#[derive(Clone)]
pub struct SurrealDbClient {
    pub client: Surreal<Any>,
}

impl SurrealDbClient {
    pub async fn new(
        address: &str,
        username: &str,
        password: &str,
        namespace: &str,
        database: &str,
    ) -> Result<Self, Error> {
        let db = connect(address).await?;

        // Sign in to database
        db.signin(Root { username, password }).await?;

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }

    pub async fn ensure_initialized(&self) -> Result<(), Error> {
        self.build_indexes().await
    }

    /// Indexes backing the scanner, the per-stage event lookups and the
    /// `(workspace_id, sha256)` uniqueness rule.
    pub async fn build_indexes(&self) -> Result<(), Error> {
        let document = DocumentMeta::table_name();
        let event = PipelineEvent::table_name();

        self.client
            .query(format!(
                "DEFINE INDEX IF NOT EXISTS idx_document_sha ON {document} FIELDS workspace_id, sha256 UNIQUE"
            ))
            .await?
            .check()?;
        self.client
            .query(format!(
                "DEFINE INDEX IF NOT EXISTS idx_document_status ON {document} FIELDS status"
            ))
            .await?
            .check()?;
        self.client
            .query(format!(
                "DEFINE INDEX IF NOT EXISTS idx_event_document_stage ON {event} FIELDS document_id, stage"
            ))
            .await?
            .check()?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_vector_workspace ON vector_point FIELDS workspace_id")
            .await?
            .check()?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_vector_document ON vector_point FIELDS document_id")
            .await?
            .check()?;

        Ok(())
    }

    /// Operation to store a object in SurrealDB, requires the struct to implement StoredObject
    pub async fn store_item<T>(&self, item: T) -> Result<Option<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.client
            .create((T::table_name(), item.get_id()))
            .content(item)
            .await
    }

    pub async fn get_all_stored_items<T>(&self) -> Result<Vec<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select(T::table_name()).await
    }

    pub async fn get_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select((T::table_name(), id)).await
    }

    pub async fn delete_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.delete((T::table_name(), id)).await
    }
}

impl Deref for SurrealDbClient {
    type Target = Surreal<Any>;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl SurrealDbClient {
    /// Create an in-memory SurrealDB client for testing.
    pub async fn memory(namespace: &str, database: &str) -> Result<Self, Error> {
        let db = connect("mem://").await?;

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }
}

#[cfg(test)]
mod tests {
    use crate::stored_object;

    use super::*;
    use uuid::Uuid;

    stored_object!(Dummy, "dummy", {
        name: String
    });

    #[tokio::test]
    async fn test_initialization_and_crud() {
        let namespace = "test_ns";
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("Failed to start in-memory surrealdb");

        db.ensure_initialized()
            .await
            .expect("Failed to initialize schema");

        let dummy = Dummy {
            id: "abc".to_string(),
            name: "first".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let stored = db.store_item(dummy.clone()).await.expect("Failed to store");
        assert!(stored.is_some());

        let fetched = db
            .get_item::<Dummy>(&dummy.id)
            .await
            .expect("Failed to fetch");
        assert_eq!(fetched, Some(dummy.clone()));

        let all = db
            .get_all_stored_items::<Dummy>()
            .await
            .expect("Failed to fetch all");
        assert!(all.contains(&dummy));

        let deleted = db
            .delete_item::<Dummy>(&dummy.id)
            .await
            .expect("Failed to delete");
        assert_eq!(deleted, Some(dummy));

        let fetch_post = db
            .get_item::<Dummy>("abc")
            .await
            .expect("Failed fetch post delete");
        assert!(fetch_post.is_none());
    }

    #[tokio::test]
    async fn test_build_indexes_is_idempotent() {
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("test_ns", database)
            .await
            .expect("Failed to start in-memory surrealdb");

        db.build_indexes().await.expect("first build");
        db.build_indexes().await.expect("second build");
    }
}
