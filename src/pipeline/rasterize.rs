//! Page rasterisation and per-page image ownership.
//!
//! ## Why spawn_blocking?
//!
//! `pdfium-render` wraps the pdfium C++ library, which keeps thread-local
//! state and does CPU-heavy work. Every call runs on the blocking pool so the
//! Tokio workers driving the other in-flight pages never stall.
//!
//! ## Image lifetime
//!
//! A rendered page lives in exactly one place: a PNG file inside the run's
//! [`ScratchDir`], owned by a [`PageImage`]. Dropping the `PageImage` deletes
//! the file, so whichever way a page task ends (success, failure, timeout,
//! panic, abandonment) its image is released before the worker slot is.
//! [`ScratchDir::sweep`] removes anything that escaped that rule.

use crate::error::{OcrError, PageError};
use crate::pipeline::encode::encode_png;
use async_trait::async_trait;
use pdfium_render::prelude::*;
use std::collections::HashSet;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tempfile::{NamedTempFile, TempDir};
use tracing::{debug, info, warn};

/// Longest rendered edge in pixels, whatever the page's physical size.
const MAX_EDGE_PX: i32 = 4000;

/// Source of page images for one document.
#[async_trait]
pub trait PageRasterizer: Send + Sync {
    /// Number of pages in `document`.
    async fn page_count(&self, document: &Path) -> Result<usize, OcrError>;

    /// Render 1-based `page` of `document` as PNG bytes.
    async fn rasterize(&self, document: &Path, page: usize) -> Result<Vec<u8>, PageError>;

    /// Release cached rendering resources. Called periodically by the scheduler.
    fn reclaim(&self) {}
}

// ── pdfium ───────────────────────────────────────────────────────────────

/// Renders PDF pages with pdfium at a fixed DPI.
///
/// The document's bytes are read once and shared by every page render until
/// [`PageRasterizer::reclaim`] drops them.
#[derive(Debug, Clone)]
pub struct PdfiumRasterizer {
    dpi: u32,
    document: Arc<DocumentBytes>,
}

impl PdfiumRasterizer {
    pub fn new(dpi: u32) -> Self {
        Self {
            dpi,
            document: Arc::new(DocumentBytes::default()),
        }
    }

    pub fn dpi(&self) -> u32 {
        self.dpi
    }

    /// Check that the pdfium library can be loaded at all.
    pub fn preflight() -> Result<(), OcrError> {
        bind_pdfium().map(|_| ()).map_err(OcrError::PdfiumBindingFailed)
    }
}

#[async_trait]
impl PageRasterizer for PdfiumRasterizer {
    async fn page_count(&self, document: &Path) -> Result<usize, OcrError> {
        let path = document.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let pdfium = bind_pdfium().map_err(OcrError::PdfiumBindingFailed)?;
            let doc = pdfium
                .load_pdf_from_file(&path, None)
                .map_err(|e| OcrError::CorruptPdf {
                    path: path.clone(),
                    detail: format!("{:?}", e),
                })?;
            let total = doc.pages().len() as usize;
            info!("PDF loaded: {} pages", total);
            Ok(total)
        })
        .await
        .map_err(|e| OcrError::Internal(format!("Page-count task panicked: {}", e)))?
    }

    async fn rasterize(&self, document: &Path, page: usize) -> Result<Vec<u8>, PageError> {
        let path = document.to_path_buf();
        let dpi = self.dpi;
        let cache = Arc::clone(&self.document);
        tokio::task::spawn_blocking(move || {
            let bytes = cache.get_or_load(&path).map_err(|e| PageError::RenderFailed {
                page,
                detail: format!("cannot read {}: {e}", path.display()),
            })?;
            render_page_blocking(&bytes, page, dpi)
        })
        .await
        .map_err(|e| PageError::RenderFailed {
            page,
            detail: format!("render task panicked: {}", e),
        })?
    }

    fn reclaim(&self) {
        if let Some(bytes) = self.document.release() {
            debug!("Released {} cached document bytes", bytes);
        }
    }
}

/// The bytes of the last document rendered, keyed by path.
#[derive(Debug, Default)]
struct DocumentBytes {
    slot: Mutex<Option<(PathBuf, Arc<Vec<u8>>)>>,
}

impl DocumentBytes {
    fn get_or_load(&self, path: &Path) -> io::Result<Arc<Vec<u8>>> {
        let mut slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        if let Some((cached, bytes)) = slot.as_ref() {
            if cached == path {
                return Ok(Arc::clone(bytes));
            }
        }
        let bytes = Arc::new(std::fs::read(path)?);
        *slot = Some((path.to_path_buf(), Arc::clone(&bytes)));
        Ok(bytes)
    }

    /// Drop the cached bytes; returns their length when anything was held.
    /// Renders already running keep their own reference.
    fn release(&self) -> Option<usize> {
        let mut slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        slot.take().map(|(_, bytes)| bytes.len())
    }
}

fn render_page_blocking(bytes: &[u8], page: usize, dpi: u32) -> Result<Vec<u8>, PageError> {
    let fail = |detail: String| PageError::RenderFailed { page, detail };

    let pdfium = bind_pdfium().map_err(fail)?;
    let doc = pdfium
        .load_pdf_from_byte_slice(bytes, None)
        .map_err(|e| fail(format!("{:?}", e)))?;
    let pdf_page = doc
        .pages()
        .get((page - 1) as u16)
        .map_err(|e| fail(format!("{:?}", e)))?;

    let scale = dpi as f32 / 72.0;
    let width = ((pdf_page.width().value * scale) as i32).clamp(1, MAX_EDGE_PX);
    let height = ((pdf_page.height().value * scale) as i32).clamp(1, MAX_EDGE_PX);
    let config = PdfRenderConfig::new()
        .set_target_width(width)
        .set_maximum_height(height);

    let bitmap = pdf_page
        .render_with_config(&config)
        .map_err(|e| fail(format!("{:?}", e)))?;
    let image = bitmap.as_image();
    debug!(
        "Rendered page {} → {}x{} px at {} DPI",
        page,
        image.width(),
        image.height(),
        dpi
    );

    encode_png(&image).map_err(|e| fail(format!("PNG encoding failed: {}", e)))
}

/// `PDFIUM_LIB_PATH` first, then the system library search path.
fn bind_pdfium() -> Result<Pdfium, String> {
    if let Ok(path) = std::env::var("PDFIUM_LIB_PATH") {
        if !path.is_empty() {
            let bindings = Pdfium::bind_to_library(&path)
                .map_err(|e| format!("failed to load pdfium from {path}: {e:?}"))?;
            return Ok(Pdfium::new(bindings));
        }
    }
    let bindings = Pdfium::bind_to_system_library().map_err(|e| {
        format!("pdfium library not found; set PDFIUM_LIB_PATH or install libpdfium: {e:?}")
    })?;
    Ok(Pdfium::new(bindings))
}

// ── Scratch storage ──────────────────────────────────────────────────────

type LiveSet = Arc<Mutex<HashSet<PathBuf>>>;

fn lock(live: &LiveSet) -> MutexGuard<'_, HashSet<PathBuf>> {
    live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Run-scoped directory holding the PNG of every in-flight page.
///
/// The directory itself is removed when the `ScratchDir` drops.
pub struct ScratchDir {
    dir: TempDir,
    live: LiveSet,
}

impl ScratchDir {
    /// Create under the system temp directory.
    pub fn new() -> io::Result<Self> {
        Self::from_dir(tempfile::Builder::new().prefix("ocr-hindi-").tempdir()?)
    }

    /// Create inside `parent`.
    pub fn new_in(parent: &Path) -> io::Result<Self> {
        Self::from_dir(tempfile::Builder::new().prefix("ocr-hindi-").tempdir_in(parent)?)
    }

    fn from_dir(dir: TempDir) -> io::Result<Self> {
        debug!("Scratch directory at {}", dir.path().display());
        Ok(Self {
            dir,
            live: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Persist `png` as the image of `page`.
    pub async fn store(&self, page: usize, png: Vec<u8>) -> io::Result<PageImage> {
        let dir = self.dir.path().to_path_buf();
        let live = Arc::clone(&self.live);
        tokio::task::spawn_blocking(move || {
            // Held across creation so a concurrent sweep never sees an
            // unregistered file.
            let mut guard = lock(&live);
            let mut file = tempfile::Builder::new()
                .prefix(&format!("page_{page:04}_"))
                .suffix(".png")
                .tempfile_in(&dir)?;
            file.write_all(&png)?;
            file.flush()?;
            guard.insert(file.path().to_path_buf());
            drop(guard);
            Ok(PageImage {
                page,
                file,
                bytes: png.len(),
                live,
            })
        })
        .await
        .map_err(io::Error::other)?
    }

    /// Number of images currently owned by a live [`PageImage`].
    pub fn live_count(&self) -> usize {
        lock(&self.live).len()
    }

    /// Number of files present in the directory.
    pub fn file_count(&self) -> usize {
        std::fs::read_dir(self.dir.path())
            .map(|it| it.filter_map(Result::ok).count())
            .unwrap_or(0)
    }

    /// Delete every file no longer owned by a [`PageImage`]. Returns the
    /// number removed.
    pub fn sweep(&self) -> usize {
        let guard = lock(&self.live);
        let entries = match std::fs::read_dir(self.dir.path()) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Scratch sweep skipped: {}", e);
                return 0;
            }
        };
        let mut removed = 0;
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            if guard.contains(&path) {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => debug!("Scratch sweep could not remove {}: {}", path.display(), e),
            }
        }
        if removed > 0 {
            debug!("Scratch sweep removed {} orphaned files", removed);
        }
        removed
    }
}

/// One rendered page, owned by exactly one worker.
pub struct PageImage {
    page: usize,
    file: NamedTempFile,
    bytes: usize,
    live: LiveSet,
}

impl PageImage {
    pub fn page(&self) -> usize {
        self.page
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Encoded size in bytes.
    pub fn len(&self) -> usize {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }

    /// Read the PNG back from disk.
    pub async fn read_png(&self) -> io::Result<Vec<u8>> {
        tokio::fs::read(self.file.path()).await
    }
}

impl Drop for PageImage {
    fn drop(&mut self) {
        lock(&self.live).remove(self.file.path());
        // NamedTempFile removes the file when it drops right after this.
    }
}

impl std::fmt::Debug for PageImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageImage")
            .field("page", &self.page)
            .field("path", &self.file.path())
            .field("bytes", &self.bytes)
            .finish()
    }
}
