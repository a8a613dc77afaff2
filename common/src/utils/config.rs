use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Local,
    Memory,
}

#[derive(Clone, Copy, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VectorBackendKind {
    /// Vectors live in the SurrealDB `vector_point` table, ranked by the database.
    Surreal,
    /// Brute-force cosine over per-document JSON files in object storage.
    Local,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct ClassificationLabel {
    pub name: String,
    pub description: String,
}

fn default_storage_kind() -> StorageKind {
    StorageKind::Local
}

fn default_vector_backend() -> VectorBackendKind {
    VectorBackendKind::Surreal
}

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_storage_kind")]
    pub storage: StorageKind,

    #[serde(default = "default_embedding_backend")]
    pub embedding_backend: String,
    #[serde(default)]
    pub embedding_model: Option<String>,
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: u32,
    #[serde(default = "default_embedding_batch_size")]
    pub embedding_batch_size: usize,
    #[serde(default = "default_embedding_max_concurrency")]
    pub embedding_max_concurrency: usize,
    #[serde(default)]
    pub embedding_acquire_timeout_ms: Option<u64>,
    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default = "default_base_url")]
    pub openai_base_url: String,

    #[serde(default = "default_vector_backend")]
    pub vector_backend: VectorBackendKind,
    #[serde(default = "default_vector_upsert_batch_size")]
    pub vector_upsert_batch_size: usize,
    #[serde(default = "default_vector_search_page_size")]
    pub vector_search_page_size: usize,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_chunk_separator")]
    pub chunk_separator: String,
    #[serde(default = "default_classification_labels")]
    pub classification_labels: Vec<ClassificationLabel>,

    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
    #[serde(default = "default_scan_batch_size")]
    pub scan_batch_size: usize,
    #[serde(default = "default_task_max_retries")]
    pub task_max_retries: usize,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_retry_max_backoff_ms")]
    pub retry_max_backoff_ms: u64,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    #[serde(default = "default_consumer_name")]
    pub consumer_name: String,
    #[serde(default = "default_consumer_topics")]
    pub consumer_topics: Vec<String>,
    #[serde(default = "default_consumer_concurrency")]
    pub consumer_concurrency: usize,
    #[serde(default = "default_consumer_batch_size")]
    pub consumer_batch_size: usize,
    #[serde(default = "default_consumer_block_ms")]
    pub consumer_block_ms: u64,

    #[serde(default)]
    pub reranking_enabled: bool,
    #[serde(default)]
    pub reranking_pool_size: Option<usize>,
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_embedding_backend() -> String {
    "fastembed".to_string()
}

fn default_embedding_dimensions() -> u32 {
    1536
}

fn default_embedding_batch_size() -> usize {
    32
}

fn default_embedding_max_concurrency() -> usize {
    2
}

fn default_vector_upsert_batch_size() -> usize {
    100
}

fn default_vector_search_page_size() -> usize {
    100
}

fn default_chunk_size() -> usize {
    1000
}

fn default_chunk_overlap() -> usize {
    200
}

fn default_chunk_separator() -> String {
    "\n".to_string()
}

fn default_classification_labels() -> Vec<ClassificationLabel> {
    [
        ("contract", "legal agreement, terms and conditions, obligations of parties"),
        ("invoice", "invoice, bill, amounts due, payment terms, line items"),
        ("report", "report with findings, analysis, results and conclusions"),
        ("manual", "manual, guide, instructions, how to operate or configure"),
        ("correspondence", "letter, email or memo addressed to a recipient"),
    ]
    .into_iter()
    .map(|(name, description)| ClassificationLabel {
        name: name.to_string(),
        description: description.to_string(),
    })
    .collect()
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_scan_interval_ms() -> u64 {
    2_000
}

fn default_scan_batch_size() -> usize {
    50
}

fn default_task_max_retries() -> usize {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_retry_max_backoff_ms() -> u64 {
    60_000
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_consumer_group() -> String {
    "document-ingestion".to_string()
}

fn default_consumer_name() -> String {
    "ingestion-consumer-0".to_string()
}

fn default_consumer_topics() -> Vec<String> {
    vec!["documents.new".to_string()]
}

fn default_consumer_concurrency() -> usize {
    8
}

fn default_consumer_batch_size() -> usize {
    16
}

fn default_consumer_block_ms() -> u64 {
    2_000
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}
