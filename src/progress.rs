//! Progress-callback trait for per-page OCR events.
//!
//! Pass an [`Arc<dyn OcrProgressCallback>`] to [`crate::run()`] to receive
//! events as the scheduler works through the document. The CLI uses it to
//! drive its progress bar; library users can forward events anywhere.
//!
//! Pages run concurrently, so `on_page_*` methods may be called from
//! several tasks at once. Implementations must protect shared mutable state
//! (`Mutex`, atomics).
//!
//! # Example
//!
//! ```rust
//! use ocr_hindi::OcrProgressCallback;
//! use ocr_hindi::pipeline::router::Route;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct Escalations(AtomicUsize);
//!
//! impl OcrProgressCallback for Escalations {
//!     fn on_page_complete(&self, _page: usize, _total: usize, route: &Route, _chars: usize) {
//!         if matches!(route, Route::Verified { .. }) {
//!             self.0.fetch_add(1, Ordering::Relaxed);
//!         }
//!     }
//! }
//! ```

use crate::pipeline::router::Route;
use std::sync::Arc;

/// Called by the scheduler as it processes pages. All methods default to
/// no-ops so implementors override only what they need.
pub trait OcrProgressCallback: Send + Sync {
    /// Called once before the first page is dispatched.
    ///
    /// * `pending`: pages that will be processed in this run
    /// * `requested`: pages selected, including those already cached
    fn on_run_start(&self, pending: usize, requested: usize) {
        let _ = (pending, requested);
    }

    /// Called when a worker claims a page.
    fn on_page_start(&self, page: usize, total: usize) {
        let _ = (page, total);
    }

    /// Called after a page's text has been validated and committed.
    ///
    /// `chars` is the length of the committed text in characters.
    fn on_page_complete(&self, page: usize, total: usize, route: &Route, chars: usize) {
        let _ = (page, total, route, chars);
    }

    /// Called when a page is recorded as FAILED.
    fn on_page_error(&self, page: usize, total: usize, error: &str) {
        let _ = (page, total, error);
    }

    /// Called once when a shutdown request stops further dispatch.
    fn on_shutdown(&self, in_flight: usize) {
        let _ = in_flight;
    }

    /// Called once after the scheduler has drained.
    fn on_run_complete(&self, completed: usize, failed: usize) {
        let _ = (completed, failed);
    }
}

/// A no-op implementation; the default when no callback is given.
pub struct NoopProgressCallback;

impl OcrProgressCallback for NoopProgressCallback {}

/// Convenience alias for the shared callback handle.
pub type ProgressCallback = Arc<dyn OcrProgressCallback>;
