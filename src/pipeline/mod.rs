//! Per-page pipeline stages.
//!
//! Each submodule implements exactly one step. The scheduler strings them
//! together for every page; nothing here knows about concurrency, progress
//! or shutdown.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ rasterize ──▶ router ─────────────────────────▶ postprocess ──▶ validate
//! (URL/path) (pdfium)     ├─ local   (tesseract, blocking)   (cleanup)       (accept?)
//!                         ├─ decision + mantra
//!                         └─ remote  (vision LLM, limiter, retry)
//! ```
//!
//! 1. [`input`]     : canonicalise the user-supplied path or URL to a local file
//! 2. [`rasterize`] : render one page to a PNG owned by a scratch-file handle
//! 3. [`local`]     : Tesseract pass with per-word confidence
//! 4. [`mantra`] / [`decision`]: pure routing judgement for hybrid mode
//! 5. [`remote`]    : vision-LLM call with token-bucket [`limiter`] and backoff
//! 6. [`router`]    : the closed set of backend combinations
//! 7. [`postprocess`]: deterministic cleanup of engine quirks
//! 8. [`validate`]  : reject refusals and fragments before they are cached

pub mod decision;
pub mod encode;
pub mod input;
pub mod limiter;
pub mod local;
pub mod mantra;
pub mod postprocess;
pub mod rasterize;
pub mod remote;
pub mod router;
pub mod validate;
