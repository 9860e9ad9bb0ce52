//! # ocr-hindi
//!
//! Resilient OCR of scanned Hindi and Sanskrit PDFs into Unicode Markdown.
//!
//! ## Why hybrid?
//!
//! Tesseract reads clean Devanagari print well and costs nothing, but it
//! silently mangles conjuncts, diacritics and the dense verse blocks common
//! in tantra and stotra literature. Vision LLMs read those pages far better
//! at a price. The hybrid engine runs Tesseract on every page and escalates
//! a page to the vision model only when the local result looks unreliable:
//! the engine failed, reported no confidence, scored under the threshold, or
//! the text contains mantra content where a single wrong syllable matters.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Input      resolve local file or download from URL
//!  ├─ 2. Reconcile  progress record ↔ result cache, pick PENDING pages
//!  ├─ 3. Schedule   N workers, cooperative shutdown, per-page isolation
//!  │     ├─ rasterize   pdfium, one scratch PNG per page
//!  │     ├─ route       local │ remote │ local → decision → remote
//!  │     ├─ validate    reject refusals and fragments
//!  │     └─ commit      atomic cache entry, then COMPLETED
//!  └─ 4. Merge      cache → <stem>_unicode.md, on every exit path
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ocr_hindi::{run, Engines, NoopProgressCallback, PipelineConfig, RunOutcome, ShutdownCoordinator};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let config = PipelineConfig::builder().resume(true).build()?;
//!     let engines = Engines::from_config(&config)?;
//!     let shutdown = Arc::new(ShutdownCoordinator::new());
//!     let listener = shutdown.listen();
//!
//!     let outcome = run("granth.pdf", &config, engines, Arc::new(NoopProgressCallback), &shutdown).await?;
//!     if let RunOutcome::Finished(summary) = outcome {
//!         eprintln!("{}/{} pages, ${:.4}", summary.completed, summary.requested,
//!             summary.usage.estimated_cost_usd);
//!     }
//!     listener.abort();
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `ocr-hindi` binary (clap + indicatif + anyhow + tracing-subscriber) |
//!
//! ## Engines
//!
//! | Mode | Local | Remote | Cost |
//! |------|-------|--------|------|
//! | `hybrid` (default) | every page | escalated pages | low |
//! | `local`  | every page | never | free |
//! | `remote` | never | every page | highest |
//!
//! External requirements: a pdfium shared library (`PDFIUM_LIB_PATH` or a
//! system install) and, for `hybrid`/`local`, `tesseract` with the `hin`,
//! `san` and `eng` language data.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod cache;
pub mod config;
pub mod error;
pub mod merge;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod run;
pub mod scheduler;
pub mod shutdown;
pub mod tracker;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use cache::ResultCache;
pub use config::{
    EngineSelector, ImageResolution, PageSelection, PipelineConfig, PipelineConfigBuilder,
    ReasoningEffort, RemoteOptions,
};
pub use error::{OcrError, PageError};
pub use merge::{MergeReport, OutputMerger};
pub use progress::{NoopProgressCallback, OcrProgressCallback, ProgressCallback};
pub use run::{run, Engines, RunOutcome, RunPlan, RunSummary};
pub use shutdown::ShutdownCoordinator;
pub use tracker::{PageStatus, ProgressTracker};
