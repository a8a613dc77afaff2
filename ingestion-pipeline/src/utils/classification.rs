use common::{
    error::AppError,
    utils::{config::ClassificationLabel, embedding::EmbeddingProvider},
    vector::cosine_similarity,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub label: String,
    pub score: f64,
}

/// Zero-shot classification: embed the sample next to every label description
/// and keep the closest label. Earlier labels win ties.
pub async fn classify_text(
    embedder: &EmbeddingProvider,
    sample: &str,
    labels: &[ClassificationLabel],
) -> Result<Option<Classification>, AppError> {
    if labels.is_empty() || sample.trim().is_empty() {
        return Ok(None);
    }

    let mut inputs = Vec::with_capacity(labels.len().saturating_add(1));
    inputs.push(sample.to_string());
    inputs.extend(
        labels
            .iter()
            .map(|label| format!("{}: {}", label.name, label.description)),
    );

    let embeddings = embedder.encode(inputs).await?;
    let Some((query, label_vectors)) = embeddings.split_first() else {
        return Ok(None);
    };

    let mut best: Option<Classification> = None;
    for (label, vector) in labels.iter().zip(label_vectors) {
        let score = cosine_similarity(query, vector);
        if best.as_ref().map_or(true, |b| score > b.score) {
            best = Some(Classification {
                label: label.name.clone(),
                score,
            });
        }
    }

    Ok(best)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::utils::embedding::EmbeddingLimits;

    fn label(name: &str, description: &str) -> ClassificationLabel {
        ClassificationLabel {
            name: name.into(),
            description: description.into(),
        }
    }

    #[tokio::test]
    async fn test_picks_a_configured_label() {
        let embedder = EmbeddingProvider::new_hashed(64, EmbeddingLimits::default()).expect("hashed");
        let labels = vec![
            label("invoice", "invoice amount due payment total"),
            label("recipe", "recipe flour sugar oven bake"),
        ];

        let result = classify_text(&embedder, "bake the flour and sugar in the oven", &labels)
            .await
            .expect("classify")
            .expect("label");
        assert_eq!(result.label, "recipe");
        assert!(result.score > 0.0);
    }

    #[tokio::test]
    async fn test_no_labels_or_blank_sample() {
        let embedder = EmbeddingProvider::new_hashed(16, EmbeddingLimits::default()).expect("hashed");
        assert!(classify_text(&embedder, "text", &[])
            .await
            .expect("classify")
            .is_none());
        assert!(classify_text(&embedder, "  ", &[label("a", "b")])
            .await
            .expect("classify")
            .is_none());
    }
}
