//! Plain-text extraction for indexable files.
//!
//! `.pdf` goes through `pdf_extract`; every other allowed extension is read
//! as UTF-8. Extraction never panics into the caller: a malformed PDF (the
//! parser can panic on hostile input) surfaces as [`ExtractError::Pdf`] and
//! the folder job records the file as skipped.

use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("file is not valid UTF-8 text")]
    NotUtf8,
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("no extractable text")]
    Empty,
}

/// Lowercased extension with a leading dot (`"notes.MD"` → `".md"`).
pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
}

pub fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    let owned = bytes.to_vec();
    match std::panic::catch_unwind(move || pdf_extract::extract_text_from_mem(&owned)) {
        Ok(Ok(text)) => Ok(text),
        Ok(Err(e)) => Err(ExtractError::Pdf(e.to_string())),
        Err(_) => Err(ExtractError::Pdf("parser panicked".to_string())),
    }
}

/// Extract text from in-memory bytes, dispatching on extension.
pub fn extract_bytes(bytes: &[u8], extension: &str) -> Result<String, ExtractError> {
    let text = if extension == ".pdf" {
        extract_pdf(bytes)?
    } else {
        String::from_utf8(bytes.to_vec()).map_err(|_| ExtractError::NotUtf8)?
    };
    if text.trim().is_empty() {
        return Err(ExtractError::Empty);
    }
    Ok(text)
}

/// Read and extract a file on a blocking thread.
pub async fn extract_file(path: &Path) -> Result<String, ExtractError> {
    let ext = extension_of(path).unwrap_or_default();
    let bytes = tokio::fs::read(path).await?;
    tokio::task::spawn_blocking(move || extract_bytes(&bytes, &ext))
        .await
        .map_err(|e| ExtractError::Pdf(e.to_string()))?
}
