use serde::{Deserialize, Serialize};

/// One page of extracted text. Page numbers start at 1.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Page {
    pub num: u32,
    pub text: String,
}

impl Page {
    pub fn new(num: u32, text: impl Into<String>) -> Self {
        Self {
            num,
            text: text.into(),
        }
    }
}

/// The part of a single page that a chunk overlaps.
///
/// `start_on_page`/`end_on_page` are character offsets into the page's own text,
/// `[start, end)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PageSpan {
    pub page_num: u32,
    pub text: String,
    pub start_on_page: usize,
    pub end_on_page: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chunk {
    pub id: String,
    pub text: String,
    pub spans: Vec<PageSpan>,
}

impl Chunk {
    pub fn page_start(&self) -> Option<u32> {
        self.spans.first().map(|s| s.page_num)
    }

    pub fn page_end(&self) -> Option<u32> {
        self.spans.last().map(|s| s.page_num)
    }
}
