//! Best-effort direct text extraction from PDFs.
//!
//! Distinguishes text-native PDFs from scans: if the first pages carry at
//! least `min_chars` of text the document is considered usable and OCR is
//! skipped.

use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
pub struct PdfText {
    pub text: String,
    pub usable: bool,
}

impl PdfText {
    fn unusable() -> Self {
        Self {
            text: String::new(),
            usable: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PdfTextExtractor {
    max_pages: usize,
    min_chars: usize,
}

impl Default for PdfTextExtractor {
    fn default() -> Self {
        Self {
            max_pages: 3,
            min_chars: 100,
        }
    }
}

impl PdfTextExtractor {
    pub fn new(max_pages: usize, min_chars: usize) -> Self {
        Self {
            max_pages: max_pages.max(1),
            min_chars,
        }
    }

    /// Never fails. Unreadable files, malformed PDFs, and parser panics all
    /// come back as `("", false)`.
    pub async fn try_extract(&self, path: &Path) -> PdfText {
        match tokio::fs::read(path).await {
            Ok(bytes) => self.try_extract_bytes(bytes).await,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "cannot read PDF");
                PdfText::unusable()
            }
        }
    }

    pub async fn try_extract_bytes(&self, bytes: Vec<u8>) -> PdfText {
        // pdf-extract is synchronous and may panic on malformed input; a
        // panic surfaces here as a JoinError.
        let joined = tokio::task::spawn_blocking(move || {
            pdf_extract::extract_text_from_mem_by_pages(&bytes)
        })
        .await;

        match joined {
            Ok(Ok(pages)) => self.judge(pages),
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "PDF text extraction failed");
                PdfText::unusable()
            }
            Err(e) => {
                tracing::warn!(error = %e, "PDF text extraction panicked");
                PdfText::unusable()
            }
        }
    }

    /// Joins the leading pages and decides whether their text layer is
    /// enough to skip OCR.
    pub fn judge(&self, pages: Vec<String>) -> PdfText {
        let text = pages
            .into_iter()
            .take(self.max_pages)
            .collect::<Vec<_>>()
            .join("\n");
        let trimmed = text.trim();
        PdfText {
            usable: trimmed.chars().count() >= self.min_chars,
            text: trimmed.to_string(),
        }
    }
}
