//! Page-level text extraction for uploaded documents.
//!
//! Extraction is a collaborator of the indexing pipeline: it turns file
//! bytes plus a declared file type into per-page UTF-8 text. Any failure is
//! a [`IndexError::FileReadError`] and is not retried here.

use crate::error::{IndexError, Result};

/// Extracted page texts. `pages[i]` is page `i + 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedText {
    pub pages: Vec<String>,
    pub page_count: u32,
}

impl ExtractedText {
    pub fn from_pages(pages: Vec<String>) -> Self {
        let page_count = pages.len() as u32;
        Self { pages, page_count }
    }
}

pub trait TextExtractor: Send + Sync {
    fn extract(&self, bytes: &[u8], file_type: &str) -> Result<ExtractedText>;
}

/// Handles `pdf` through `pdf-extract`, and `txt`/`text` with form feeds
/// (`\x0c`) as page breaks.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultExtractor;

impl TextExtractor for DefaultExtractor {
    fn extract(&self, bytes: &[u8], file_type: &str) -> Result<ExtractedText> {
        if bytes.is_empty() {
            return Err(IndexError::FileReadError("file is empty".into()));
        }
        match file_type.trim().to_ascii_lowercase().as_str() {
            "pdf" => extract_pdf(bytes),
            "txt" | "text" => extract_plain(bytes),
            other => Err(IndexError::FileReadError(format!(
                "unsupported file type: {other}"
            ))),
        }
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<ExtractedText> {
    let pages = pdf_extract::extract_text_from_mem_by_pages(bytes)
        .map_err(|e| IndexError::FileReadError(format!("PDF extraction failed: {e}")))?;
    Ok(ExtractedText::from_pages(pages))
}

fn extract_plain(bytes: &[u8]) -> Result<ExtractedText> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| IndexError::FileReadError(format!("text file is not UTF-8: {e}")))?;
    let pages = text.split('\x0c').map(str::to_string).collect();
    Ok(ExtractedText::from_pages(pages))
}
