use common::utils::config::{AppConfig, ClassificationLabel};

use crate::chunker::ChunkerConfig;

#[derive(Debug, Clone)]
pub struct IngestionTuning {
    /// Characters of page text handed to language detection.
    pub language_sample_chars: usize,
    /// Characters of page text embedded for classification.
    pub classification_sample_chars: usize,
}

impl Default for IngestionTuning {
    fn default() -> Self {
        Self {
            language_sample_chars: 4_000,
            classification_sample_chars: 2_000,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IngestionConfig {
    pub tuning: IngestionTuning,
    pub chunker: ChunkerConfig,
    pub classification_labels: Vec<ClassificationLabel>,
}

impl IngestionConfig {
    pub fn from_app_config(cfg: &AppConfig) -> Self {
        Self {
            tuning: IngestionTuning::default(),
            chunker: ChunkerConfig::from_config(cfg),
            classification_labels: cfg.classification_labels.clone(),
        }
    }
}
