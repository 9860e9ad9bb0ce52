//! Error types for the ocr-hindi library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`OcrError`] is **fatal**: the run cannot proceed at all (bad input
//!   file, unreadable progress record, provider not configured, every page
//!   failed). Returned as `Err(OcrError)` from [`crate::run()`].
//!
//! * [`PageError`] is **non-fatal**: a single page failed (render glitch,
//!   throttling that outlasted every retry, a refusal from the remote model,
//!   a full disk) while all other pages carry on. Page errors are caught at
//!   the per-page boundary, written to the progress record and logged; they
//!   never abort sibling pages.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the ocr-hindi library.
#[derive(Debug, Error)]
pub enum OcrError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Document not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The input string is not a valid file path or URL.
    #[error("Invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'")]
    DownloadTimeout { url: String, secs: u64 },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{path}' is corrupt: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    /// Selected page numbers exceed the actual page count.
    #[error("Page {page} is out of range (document has {total} pages)")]
    PageOutOfRange { page: usize, total: usize },

    /// The page-range expression could not be parsed.
    #[error("Invalid page selection '{input}': {reason}\nExpected: all, 5, 1-50, or 1,5,10-20")]
    InvalidPageSpec { input: String, reason: String },

    // ── Engine errors ─────────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// A required engine is missing (binary not installed, language data absent).
    #[error("{engine} is not available: {hint}")]
    EngineUnavailable { engine: String, hint: String },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium or install pdfium system-wide."
    )]
    PdfiumBindingFailed(String),

    // ── Persistent state errors ───────────────────────────────────────────
    /// A durable-state file (progress record, merged artifact) could not be written.
    #[error("Failed to write '{path}': {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The progress record exists but cannot be parsed.
    #[error("Progress record '{path}' is corrupt: {detail}\nDelete it or re-run without --resume.")]
    StateCorrupt { path: PathBuf, detail: String },

    /// A page state transition outside PENDING → IN_PROGRESS → {COMPLETED | FAILED}.
    #[error("Illegal transition for page {page}: {from} → {to}")]
    InvalidTransition {
        page: usize,
        from: &'static str,
        to: &'static str,
    },

    /// Zero requested pages were completed; there is nothing to show.
    #[error("All {total} pages failed.\nFirst error: {first_error}")]
    AllPagesFailed { total: usize, first_error: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single page.
///
/// Recorded in the progress file as the reason of a `Failed` state, so it is
/// serialisable. The run continues unless every page fails.
#[derive(Debug, Clone, PartialEq, Error, serde::Serialize, serde::Deserialize)]
pub enum PageError {
    /// Page rasterisation failed.
    #[error("Page {page}: rasterisation failed: {detail}")]
    RenderFailed { page: usize, detail: String },

    /// Local engine failed in local-only mode (nothing to escalate to).
    #[error("Page {page}: local engine failed: {detail}")]
    LocalFailed { page: usize, detail: String },

    /// Remote engine kept throttling or timing out until retries ran out.
    #[error("Page {page}: remote engine failed after {retries} retries: {detail}")]
    TransientExhausted {
        page: usize,
        retries: u32,
        detail: String,
    },

    /// Remote engine returned a permanent error.
    #[error("Page {page}: remote engine failed: {detail}")]
    RemoteFailed { page: usize, detail: String },

    /// Output was produced but judged invalid; nothing was cached.
    #[error("Page {page}: output rejected: {reason}")]
    ValidationRejected { page: usize, reason: String },

    /// Durable write of the cache entry failed.
    #[error("Page {page}: cache write failed: {detail}")]
    CacheWriteFailed { page: usize, detail: String },

    /// The whole per-page pipeline exceeded its time budget.
    #[error("Page {page}: timed out after {secs}s")]
    Timeout { page: usize, secs: u64 },

    /// The per-page task panicked.
    #[error("Page {page}: worker panicked: {detail}")]
    Panicked { page: usize, detail: String },
}

impl PageError {
    /// The 1-based page index this error belongs to.
    pub fn page(&self) -> usize {
        match self {
            PageError::RenderFailed { page, .. }
            | PageError::LocalFailed { page, .. }
            | PageError::TransientExhausted { page, .. }
            | PageError::RemoteFailed { page, .. }
            | PageError::ValidationRejected { page, .. }
            | PageError::CacheWriteFailed { page, .. }
            | PageError::Timeout { page, .. }
            | PageError::Panicked { page, .. } => *page,
        }
    }
}
