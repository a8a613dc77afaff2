use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    str::FromStr,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use async_openai::{config::OpenAIConfig, types::CreateEmbeddingRequestArgs, Client};
use fastembed::{EmbeddingModel, ModelTrait, TextEmbedding, TextInitOptions};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::{error::AppError, utils::config::AppConfig};

const DEFAULT_OPENAI_MODEL: &str = "text-embedding-3-small";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmbeddingBackend {
    OpenAI,
    #[default]
    FastEmbed,
    Hashed,
}

impl std::str::FromStr for EmbeddingBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "hashed" => Ok(Self::Hashed),
            "fastembed" | "fast-embed" | "fast" => Ok(Self::FastEmbed),
            other => Err(anyhow!(
                "unknown embedding backend '{other}'. Expected 'openai', 'hashed', or 'fastembed'."
            )),
        }
    }
}

/// Batching and admission limits shared by every backend.
#[derive(Debug, Clone, Copy)]
pub struct EmbeddingLimits {
    pub batch_size: usize,
    pub max_concurrency: usize,
    /// How long a caller waits for a free slot before giving up with `Cancelled`.
    pub acquire_timeout: Option<Duration>,
}

impl Default for EmbeddingLimits {
    fn default() -> Self {
        Self {
            batch_size: 32,
            max_concurrency: 2,
            acquire_timeout: None,
        }
    }
}

impl EmbeddingLimits {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            batch_size: cfg.embedding_batch_size.max(1),
            max_concurrency: cfg.embedding_max_concurrency.max(1),
            acquire_timeout: cfg.embedding_acquire_timeout_ms.map(Duration::from_millis),
        }
    }
}

#[derive(Clone)]
pub struct EmbeddingProvider {
    inner: EmbeddingInner,
    limits: EmbeddingLimits,
    slots: Arc<Semaphore>,
}

#[derive(Clone)]
enum EmbeddingInner {
    OpenAI {
        client: Arc<Client<OpenAIConfig>>,
        model: String,
        dimensions: u32,
    },
    Hashed {
        dimension: usize,
    },
    FastEmbed {
        model: Arc<Mutex<TextEmbedding>>,
        model_name: EmbeddingModel,
        dimension: usize,
    },
}

impl EmbeddingProvider {
    fn with_inner(inner: EmbeddingInner, limits: EmbeddingLimits) -> Self {
        Self {
            inner,
            limits,
            slots: Arc::new(Semaphore::new(limits.max_concurrency.max(1))),
        }
    }

    /// Build the backend named by `embedding_backend`.
    pub async fn from_config(cfg: &AppConfig) -> Result<Self> {
        let limits = EmbeddingLimits::from_config(cfg);
        match EmbeddingBackend::from_str(&cfg.embedding_backend)? {
            EmbeddingBackend::Hashed => {
                Self::new_hashed(cfg.embedding_dimensions as usize, limits)
            }
            EmbeddingBackend::FastEmbed => {
                Self::new_fastembed(cfg.embedding_model.clone(), limits).await
            }
            EmbeddingBackend::OpenAI => {
                let api_key = cfg
                    .openai_api_key
                    .clone()
                    .ok_or_else(|| anyhow!("openai_api_key is required for the openai backend"))?;
                let client = Client::with_config(
                    OpenAIConfig::new()
                        .with_api_key(api_key)
                        .with_api_base(&cfg.openai_base_url),
                );
                Self::new_openai(
                    Arc::new(client),
                    cfg.embedding_model
                        .clone()
                        .unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
                    cfg.embedding_dimensions,
                    limits,
                )
            }
        }
    }

    pub fn backend_label(&self) -> &'static str {
        match self.inner {
            EmbeddingInner::Hashed { .. } => "hashed",
            EmbeddingInner::FastEmbed { .. } => "fastembed",
            EmbeddingInner::OpenAI { .. } => "openai",
        }
    }

    pub fn dimension(&self) -> usize {
        match &self.inner {
            EmbeddingInner::Hashed { dimension } | EmbeddingInner::FastEmbed { dimension, .. } => {
                *dimension
            }
            EmbeddingInner::OpenAI { dimensions, .. } => *dimensions as usize,
        }
    }

    pub fn model_code(&self) -> Option<String> {
        match &self.inner {
            EmbeddingInner::FastEmbed { model_name, .. } => Some(model_name.to_string()),
            EmbeddingInner::OpenAI { model, .. } => Some(model.clone()),
            EmbeddingInner::Hashed { .. } => None,
        }
    }

    /// Embed `texts`, preserving order. Inputs are sent in batches of
    /// `batch_size`; each batch holds one concurrency slot while it runs.
    pub async fn encode(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, AppError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let total = texts.len();
        let mut out = Vec::with_capacity(total);
        let mut remaining = texts.into_iter().peekable();

        while remaining.peek().is_some() {
            let batch: Vec<String> = remaining.by_ref().take(self.limits.batch_size.max(1)).collect();
            let expected = batch.len();

            let _permit = self.acquire_slot().await?;
            let embeddings = self.embed_batch(batch).await?;
            if embeddings.len() != expected {
                return Err(AppError::Processing(format!(
                    "{} backend returned {} embeddings for {expected} inputs",
                    self.backend_label(),
                    embeddings.len()
                )));
            }
            out.extend(embeddings);
        }

        debug!(
            backend = self.backend_label(),
            inputs = total,
            "encoded embedding batch"
        );
        Ok(out)
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError> {
        self.encode(vec![text.to_owned()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::Processing("embedding backend returned nothing".into()))
    }

    async fn acquire_slot(&self) -> Result<OwnedSemaphorePermit, AppError> {
        let acquire = Arc::clone(&self.slots).acquire_owned();
        let permit = match self.limits.acquire_timeout {
            Some(limit) => tokio::time::timeout(limit, acquire).await.map_err(|_| {
                AppError::Cancelled(format!(
                    "no embedding slot available within {}ms",
                    limit.as_millis()
                ))
            })?,
            None => acquire.await,
        };
        permit.map_err(|_| AppError::Cancelled("embedding service is shut down".into()))
    }

    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        match &self.inner {
            EmbeddingInner::Hashed { dimension } => Ok(texts
                .into_iter()
                .map(|text| hashed_embedding(&text, *dimension))
                .collect()),
            EmbeddingInner::FastEmbed { model, .. } => {
                // Inference saturates the CPU; keep it off the async workers.
                let model = Arc::clone(model);
                tokio::task::spawn_blocking(move || -> Result<Vec<Vec<f32>>> {
                    let mut guard = model
                        .lock()
                        .map_err(|_| anyhow!("fastembed model lock poisoned"))?;
                    guard
                        .embed(texts, None)
                        .context("generating fastembed batch embeddings")
                })
                .await
                .context("joining fastembed inference task")?
            }
            EmbeddingInner::OpenAI {
                client,
                model,
                dimensions,
            } => {
                let request = CreateEmbeddingRequestArgs::default()
                    .model(model.clone())
                    .input(texts)
                    .dimensions(*dimensions)
                    .build()?;

                let response = client.embeddings().create(request).await?;

                Ok(response
                    .data
                    .into_iter()
                    .map(|item| item.embedding)
                    .collect())
            }
        }
    }

    pub fn new_openai(
        client: Arc<Client<OpenAIConfig>>,
        model: String,
        dimensions: u32,
        limits: EmbeddingLimits,
    ) -> Result<Self> {
        Ok(Self::with_inner(
            EmbeddingInner::OpenAI {
                client,
                model,
                dimensions,
            },
            limits,
        ))
    }

    pub async fn new_fastembed(
        model_override: Option<String>,
        limits: EmbeddingLimits,
    ) -> Result<Self> {
        let model_name = if let Some(code) = model_override {
            EmbeddingModel::from_str(&code).map_err(|err| anyhow!(err))?
        } else {
            EmbeddingModel::default()
        };

        let options = TextInitOptions::new(model_name.clone()).with_show_download_progress(true);
        let model_name_for_task = model_name.clone();
        let model_name_code = model_name.to_string();

        let (model, dimension) = tokio::task::spawn_blocking(move || -> Result<_> {
            let model =
                TextEmbedding::try_new(options).context("initialising FastEmbed text model")?;
            let info = EmbeddingModel::get_model_info(&model_name_for_task)
                .ok_or_else(|| anyhow!("FastEmbed model metadata missing for {model_name_code}"))?;
            Ok((model, info.dim))
        })
        .await
        .context("joining FastEmbed initialisation task")??;

        Ok(Self::with_inner(
            EmbeddingInner::FastEmbed {
                model: Arc::new(Mutex::new(model)),
                model_name,
                dimension,
            },
            limits,
        ))
    }

    pub fn new_hashed(dimension: usize, limits: EmbeddingLimits) -> Result<Self> {
        Ok(Self::with_inner(
            EmbeddingInner::Hashed {
                dimension: dimension.max(1),
            },
            limits,
        ))
    }
}

// Helper functions for hashed embeddings
fn hashed_embedding(text: &str, dimension: usize) -> Vec<f32> {
    let dim = dimension.max(1);
    let mut vector = vec![0.0f32; dim];
    if text.is_empty() {
        return vector;
    }

    let mut token_count = 0usize;
    for token in tokens(text) {
        token_count += 1;
        if let Some(slot) = vector.get_mut(bucket(&token, dim)) {
            *slot += 1.0;
        }
    }

    if token_count == 0 {
        return vector;
    }

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut vector {
            *value /= norm;
        }
    }

    vector
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
}

fn bucket(token: &str, dimension: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    token.hash(&mut hasher);
    (hasher.finish() % dimension as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(batch_size: usize, max_concurrency: usize) -> EmbeddingLimits {
        EmbeddingLimits {
            batch_size,
            max_concurrency,
            acquire_timeout: None,
        }
    }

    #[tokio::test]
    async fn test_hashed_encode_preserves_order_across_batches() {
        let provider = EmbeddingProvider::new_hashed(16, limits(2, 1)).expect("provider");
        let texts: Vec<String> = ["alpha", "beta", "gamma", "delta", "epsilon"]
            .iter()
            .map(|s| (*s).to_string())
            .collect();

        let batched = provider.encode(texts.clone()).await.expect("encode");
        assert_eq!(batched.len(), texts.len());

        for (text, vector) in texts.iter().zip(&batched) {
            let single = provider.embed(text).await.expect("embed");
            assert_eq!(&single, vector);
            assert_eq!(vector.len(), 16);
        }
    }

    #[tokio::test]
    async fn test_empty_input_returns_empty() {
        let provider = EmbeddingProvider::new_hashed(8, limits(4, 1)).expect("provider");
        assert!(provider.encode(Vec::new()).await.expect("encode").is_empty());
    }

    #[tokio::test]
    async fn test_acquire_timeout_surfaces_cancelled() {
        let provider = EmbeddingProvider::new_hashed(
            8,
            EmbeddingLimits {
                batch_size: 4,
                max_concurrency: 1,
                acquire_timeout: Some(Duration::from_millis(20)),
            },
        )
        .expect("provider");

        // Hold the only slot so the next caller has to wait.
        let held = provider.acquire_slot().await.expect("slot");
        let err = provider
            .encode(vec!["blocked".into()])
            .await
            .expect_err("should time out");
        assert!(matches!(err, AppError::Cancelled(_)));
        assert!(err.is_retryable());

        drop(held);
        provider
            .encode(vec!["free".into()])
            .await
            .expect("slot released");
    }

    #[test]
    fn test_backend_parsing() {
        assert_eq!(
            EmbeddingBackend::from_str("HASHED").expect("parse"),
            EmbeddingBackend::Hashed
        );
        assert!(EmbeddingBackend::from_str("word2vec").is_err());
    }

    #[test]
    fn test_hashed_embedding_is_normalized() {
        let vector = hashed_embedding("the quick brown fox", 32);
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!(hashed_embedding("", 4).iter().all(|v| *v == 0.0));
    }
}
