//! Page-aware chunking.
//!
//! Pages are joined into one working text, split with a recursive character
//! splitter, and every chunk is mapped back onto the pages it overlaps using
//! the byte offset the splitter reports for it.

use common::{
    error::AppError,
    storage::types::chunk::{Chunk, Page, PageSpan},
    utils::config::AppConfig,
};
use text_splitter::{Characters, ChunkConfig, TextSplitter};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// Maximum chunk length in characters.
    pub chunk_size: usize,
    /// Characters shared between consecutive chunks.
    pub chunk_overlap: usize,
    /// Inserted between pages when they are merged.
    pub separator: String,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
            separator: "\n".to_string(),
        }
    }
}

impl ChunkerConfig {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            chunk_size: cfg.chunk_size,
            chunk_overlap: cfg.chunk_overlap,
            separator: cfg.chunk_separator.clone(),
        }
    }
}

pub struct Chunker {
    config: ChunkerConfig,
    splitter: TextSplitter<Characters>,
}

/// Byte range of one page inside the merged text.
struct PageRange<'a> {
    page: &'a Page,
    start: usize,
    end: usize,
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Result<Self, AppError> {
        if config.chunk_size == 0 {
            return Err(AppError::Validation("chunk_size must be positive".into()));
        }
        if config.chunk_overlap >= config.chunk_size {
            return Err(AppError::Validation(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                config.chunk_overlap, config.chunk_size
            )));
        }

        let chunk_config = ChunkConfig::new(config.chunk_size)
            .with_overlap(config.chunk_overlap)
            .map_err(|err| AppError::Validation(format!("invalid chunk configuration: {err}")))?;

        Ok(Self {
            config,
            splitter: TextSplitter::new(chunk_config),
        })
    }

    pub fn split(&self, pages: &[Page]) -> Vec<Chunk> {
        self.split_with_separator(pages, &self.config.separator)
    }

    pub fn split_with_separator(&self, pages: &[Page], separator: &str) -> Vec<Chunk> {
        if pages.is_empty() {
            return Vec::new();
        }

        let (merged, ranges) = merge_pages(pages, separator);

        let mut chunks = Vec::new();
        for (index, (start, piece)) in self.splitter.chunk_indices(&merged).enumerate() {
            let end = start.saturating_add(piece.len());
            let spans = spans_for(&merged, &ranges, start, end);
            if spans.is_empty() {
                debug!(chunk_index = index, "chunk covers no page text; dropped");
                continue;
            }
            chunks.push(Chunk {
                id: Uuid::new_v4().to_string(),
                text: piece.to_string(),
                spans,
            });
        }

        chunks
    }
}

fn merge_pages<'a>(pages: &'a [Page], separator: &str) -> (String, Vec<PageRange<'a>>) {
    let capacity = pages
        .iter()
        .map(|p| p.text.len().saturating_add(separator.len()))
        .sum();
    let mut merged = String::with_capacity(capacity);
    let mut ranges = Vec::with_capacity(pages.len());

    for (i, page) in pages.iter().enumerate() {
        if i > 0 {
            merged.push_str(separator);
        }
        let start = merged.len();
        merged.push_str(&page.text);
        ranges.push(PageRange {
            page,
            start,
            end: merged.len(),
        });
    }

    (merged, ranges)
}

/// Intersect `[start, end)` with every page, converting to page-relative character offsets.
fn spans_for(merged: &str, ranges: &[PageRange<'_>], start: usize, end: usize) -> Vec<PageSpan> {
    ranges
        .iter()
        .filter_map(|range| {
            let lo = start.max(range.start);
            let hi = end.min(range.end);
            if lo >= hi {
                return None;
            }
            let text = merged.get(lo..hi)?;
            let prefix = merged.get(range.start..lo)?;
            let start_on_page = prefix.chars().count();
            Some(PageSpan {
                page_num: range.page.num,
                text: text.to_string(),
                start_on_page,
                end_on_page: start_on_page.saturating_add(text.chars().count()),
            })
        })
        .collect()
}
