pub mod classification;
pub mod file_text_extraction;
pub mod language;
pub mod pdf_ingestion;
