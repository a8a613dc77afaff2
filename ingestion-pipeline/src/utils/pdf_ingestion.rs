use chrono::NaiveDateTime;
use common::{error::AppError, storage::types::chunk::Page};
use lopdf::{Document, Object};
use tracing::{debug, warn};

/// Text and document-level metadata pulled out of a PDF.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PdfContent {
    pub pages: Vec<Page>,
    pub author: Option<String>,
    pub created_at: Option<String>,
}

/// Parse a PDF held in memory, one [`Page`] per PDF page in page order.
///
/// A document lopdf cannot load is an extraction error. A single page whose
/// text cannot be decoded is kept as an empty page so numbering stays aligned.
pub async fn extract_pdf_pages(pdf_bytes: Vec<u8>) -> Result<PdfContent, AppError> {
    tokio::task::spawn_blocking(move || -> Result<PdfContent, AppError> {
        let document = Document::load_mem(&pdf_bytes)
            .map_err(|err| AppError::Extraction(format!("failed to parse PDF: {err}")))?;

        let mut numbers: Vec<u32> = document.get_pages().keys().copied().collect();
        numbers.sort_unstable();
        if numbers.is_empty() {
            return Err(AppError::Extraction("PDF contains no pages".into()));
        }

        let pages = numbers
            .into_iter()
            .map(|num| {
                let text = document.extract_text(&[num]).unwrap_or_else(|err| {
                    warn!(page = num, error = %err, "failed to extract PDF page text");
                    String::new()
                });
                Page::new(num, normalize_page_text(&text))
            })
            .collect::<Vec<_>>();

        let author = info_string(&document, b"Author");
        let created_at = info_string(&document, b"CreationDate").map(|raw| parse_pdf_date(&raw));
        debug!(page_count = pages.len(), has_author = author.is_some(), "pdf parsed");

        Ok(PdfContent {
            pages,
            author,
            created_at,
        })
    })
    .await?
}

/// lopdf separates text operations with newlines; trailing whitespace is noise.
fn normalize_page_text(text: &str) -> String {
    text.lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

fn info_string(document: &Document, key: &[u8]) -> Option<String> {
    let info = document.trailer.get(b"Info").ok()?;
    let dict = match info {
        Object::Reference(id) => document.get_dictionary(*id).ok()?,
        Object::Dictionary(dict) => dict,
        _ => return None,
    };
    let raw = dict.get(key).ok()?.as_str().ok()?;
    let text = decode_pdf_string(raw);
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// PDF text strings are either UTF-16BE with a BOM or a single-byte encoding.
fn decode_pdf_string(raw: &[u8]) -> String {
    match raw.strip_prefix(&[0xFE, 0xFF]) {
        Some(utf16) => {
            let units: Vec<u16> = utf16
                .chunks_exact(2)
                .map(|pair| match pair {
                    [hi, lo] => u16::from_be_bytes([*hi, *lo]),
                    _ => 0,
                })
                .collect();
            String::from_utf16_lossy(&units)
        }
        None => String::from_utf8_lossy(raw).into_owned(),
    }
}

/// `D:YYYYMMDDHHmmSS...` to `YYYY-MM-DDTHH:MM:SS`; anything else is returned as found.
fn parse_pdf_date(raw: &str) -> String {
    let digits: String = raw
        .trim_start_matches("D:")
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();

    let padded = match digits.len() {
        8 => format!("{digits}000000"),
        12 => format!("{digits}00"),
        n if n >= 14 => digits.chars().take(14).collect(),
        _ => return raw.to_string(),
    };

    NaiveDateTime::parse_from_str(&padded, "%Y%m%d%H%M%S")
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S").to_string())
        .unwrap_or_else(|_| raw.to_string())
}
