use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread::available_parallelism,
};

use async_trait::async_trait;
use common::{error::AppError, utils::config::AppConfig};
use fastembed::{RerankInitOptions, TextRerank};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Relevance of `documents[index]` to the query; higher is better.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RerankScore {
    pub index: usize,
    pub score: f32,
}

/// Cross-encoder style rescoring of retrieved passages.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(&self, query: &str, documents: Vec<String>)
        -> Result<Vec<RerankScore>, AppError>;
}

pub struct RerankerPool {
    engines: Vec<Arc<Mutex<TextRerank>>>,
    semaphore: Arc<Semaphore>,
    next_engine: AtomicUsize,
}

impl RerankerPool {
    /// Build the pool at startup.
    /// `pool_size` controls max parallel reranks.
    pub fn new(pool_size: usize) -> Result<Arc<Self>, AppError> {
        Self::new_with_options(pool_size, RerankInitOptions::default())
    }

    fn new_with_options(
        pool_size: usize,
        init_options: RerankInitOptions,
    ) -> Result<Arc<Self>, AppError> {
        if pool_size == 0 {
            return Err(AppError::Validation(
                "reranking_pool_size must be greater than zero".to_string(),
            ));
        }

        fs::create_dir_all(&init_options.cache_dir)?;

        let mut engines = Vec::with_capacity(pool_size);
        for x in 0..pool_size {
            debug!("Creating reranking engine: {x}");
            let model = TextRerank::try_new(init_options.clone())
                .map_err(|e| AppError::InternalError(e.to_string()))?;
            engines.push(Arc::new(Mutex::new(model)));
        }

        Ok(Arc::new(Self {
            engines,
            semaphore: Arc::new(Semaphore::new(pool_size)),
            next_engine: AtomicUsize::new(0),
        }))
    }

    /// `None` unless `reranking_enabled` is set.
    pub fn maybe_from_config(config: &AppConfig) -> Result<Option<Arc<Self>>, AppError> {
        if !config.reranking_enabled {
            return Ok(None);
        }

        let pool_size = config.reranking_pool_size.unwrap_or_else(default_pool_size);
        Self::new_with_options(pool_size, build_rerank_init_options(config)?).map(Some)
    }

    /// Wait for capacity and pick an engine round-robin.
    pub async fn checkout(&self) -> Result<RerankerLease, AppError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| AppError::Cancelled("reranker pool closed".into()))?;

        let idx = self.next_engine.fetch_add(1, Ordering::Relaxed) % self.engines.len().max(1);
        let engine = self
            .engines
            .get(idx)
            .cloned()
            .ok_or_else(|| AppError::InternalError("reranker pool is empty".into()))?;

        Ok(RerankerLease {
            _permit: permit,
            engine,
        })
    }
}

#[async_trait]
impl Reranker for RerankerPool {
    async fn rerank(
        &self,
        query: &str,
        documents: Vec<String>,
    ) -> Result<Vec<RerankScore>, AppError> {
        self.checkout().await?.rerank(query, documents).await
    }
}

fn default_pool_size() -> usize {
    available_parallelism()
        .map(|value| value.get().min(2))
        .unwrap_or(2)
        .max(1)
}

fn build_rerank_init_options(config: &AppConfig) -> Result<RerankInitOptions, AppError> {
    let mut options = RerankInitOptions::default();

    let cache_dir = env::var("RERANKING_CACHE_DIR")
        .ok()
        .or_else(|| env::var("FASTEMBED_CACHE_DIR").ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            Path::new(&config.data_dir)
                .join("fastembed")
                .join("reranker")
        });
    fs::create_dir_all(&cache_dir)?;
    options.cache_dir = cache_dir;

    if let Some(max_length) = env::var("RERANKING_MAX_LENGTH")
        .ok()
        .and_then(|value| value.parse().ok())
    {
        options.max_length = max_length;
    }

    Ok(options)
}

/// Active lease on a single TextRerank instance.
pub struct RerankerLease {
    // When this drops the semaphore permit is released.
    _permit: OwnedSemaphorePermit,
    engine: Arc<Mutex<TextRerank>>,
}

impl RerankerLease {
    pub async fn rerank(
        &self,
        query: &str,
        documents: Vec<String>,
    ) -> Result<Vec<RerankScore>, AppError> {
        let mut guard = self.engine.lock().await;

        let results = guard
            .rerank(query.to_owned(), documents, false, None)
            .map_err(|e| AppError::InternalError(e.to_string()))?;
        Ok(results
            .into_iter()
            .map(|result| RerankScore {
                index: result.index,
                score: result.score,
            })
            .collect())
    }
}
