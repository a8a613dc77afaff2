use common::storage::types::chunk::Page;

/// Detected language as an ISO 639-3 code with the detector's confidence.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedLanguage {
    pub code: &'static str,
    pub confidence: f64,
}

/// Build a detection sample from the leading pages, capped at `max_chars`.
pub fn sample_text(pages: &[Page], max_chars: usize) -> String {
    let mut sample = String::new();
    let mut remaining = max_chars;
    for page in pages {
        if remaining == 0 {
            break;
        }
        if !sample.is_empty() {
            sample.push('\n');
        }
        let taken: String = page.text.chars().take(remaining).collect();
        remaining = remaining.saturating_sub(taken.chars().count());
        sample.push_str(&taken);
    }
    sample
}

pub fn detect_language(text: &str) -> Option<DetectedLanguage> {
    if text.trim().is_empty() {
        return None;
    }
    whatlang::detect(text).map(|info| DetectedLanguage {
        code: info.lang().code(),
        confidence: info.confidence(),
    })
}
