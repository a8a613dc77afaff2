use common::{error::AppError, storage::types::chunk::Page};

use super::pdf_ingestion::{extract_pdf_pages, PdfContent};

const FORM_FEED: char = '\u{c}';

/// Pages plus whatever document metadata the format carries.
pub type ExtractedDocument = PdfContent;

/// Resolve the effective MIME type, falling back to the raw file's extension.
pub fn resolve_mime(mime: Option<&str>, raw_path: &str) -> Option<String> {
    if let Some(mime) = mime.map(str::trim).filter(|m| !m.is_empty()) {
        let base = mime.split(';').next().unwrap_or(mime).trim();
        return Some(base.to_ascii_lowercase());
    }

    let ext = raw_path.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase())?;
    let guessed = match ext.as_str() {
        "pdf" => "application/pdf",
        "txt" | "text" | "log" => "text/plain",
        "md" | "markdown" => "text/markdown",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "xml" => "application/xml",
        _ => return None,
    };
    Some(guessed.to_string())
}

/// Turn raw bytes into pages according to `mime`.
///
/// Fails with `Extraction` for unsupported or undecodable content and with
/// `EmptyText` when nothing but whitespace comes out.
pub async fn extract_pages(
    bytes: Vec<u8>,
    mime: Option<&str>,
    document_id: &str,
) -> Result<ExtractedDocument, AppError> {
    let extracted = match mime {
        Some("application/pdf") => extract_pdf_pages(bytes).await?,
        Some(m) if is_textual(m) => ExtractedDocument {
            pages: text_pages(bytes, document_id)?,
            ..ExtractedDocument::default()
        },
        Some(other) => {
            return Err(AppError::Extraction(format!(
                "unsupported content type {other} for document {document_id}"
            )))
        }
        None => {
            return Err(AppError::Extraction(format!(
                "unknown content type for document {document_id}"
            )))
        }
    };

    if extracted.pages.iter().all(|p| p.text.trim().is_empty()) {
        return Err(AppError::EmptyText(format!("document {document_id}")));
    }

    Ok(extracted)
}

fn is_textual(mime: &str) -> bool {
    mime.starts_with("text/") || matches!(mime, "application/json" | "application/xml")
}

/// UTF-8 text; form feeds separate pages.
fn text_pages(bytes: Vec<u8>, document_id: &str) -> Result<Vec<Page>, AppError> {
    let text = String::from_utf8(bytes).map_err(|err| {
        AppError::Extraction(format!("document {document_id} is not valid UTF-8: {err}"))
    })?;
    let text = text.strip_prefix('\u{feff}').unwrap_or(&text);

    Ok(text
        .split(FORM_FEED)
        .zip(1u32..)
        .map(|(page, num)| Page::new(num, page))
        .collect())
}
