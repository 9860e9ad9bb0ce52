//! Final artifact assembly.
//!
//! The merged Markdown file is derived entirely from the result cache: every
//! committed entry, in ascending page order. It carries no timestamp, so
//! merging the same cache twice yields byte-identical output, and a resumed
//! run simply rewrites it with the additional pages.
//!
//! ```text
//! # <stem> - OCR Output
//! Engine: hybrid (tesseract → gemini/gemini-2.5-flash)
//! Pages: 3
//!
//! ---
//!
//! ## Page 1
//!
//! <text>
//!
//! ---
//! ```

use crate::cache::{write_then_rename, ResultCache};
use crate::error::OcrError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Outcome of a merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub pages_merged: usize,
    pub path: PathBuf,
    /// False when the cache was empty and no file was written.
    pub written: bool,
}

#[derive(Debug, Clone)]
pub struct OutputMerger {
    cache: ResultCache,
    output: PathBuf,
    title: String,
    engine: String,
}

impl OutputMerger {
    pub fn new(
        cache: ResultCache,
        output: impl Into<PathBuf>,
        title: impl Into<String>,
        engine: impl Into<String>,
    ) -> Self {
        Self {
            cache,
            output: output.into(),
            title: title.into(),
            engine: engine.into(),
        }
    }

    /// Default artifact path: `<stem>_unicode.md` beside the document.
    pub fn default_output(document: &Path) -> PathBuf {
        let stem = document
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string());
        document
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(format!("{stem}_unicode.md"))
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Render the artifact for `pages`.
    pub fn render(title: &str, engine: &str, pages: &BTreeMap<usize, String>) -> String {
        let body_len: usize = pages.values().map(|t| t.len() + 32).sum();
        let mut out = String::with_capacity(body_len + 128);
        out.push_str(&format!("# {title} - OCR Output\n"));
        out.push_str(&format!("Engine: {engine}\n"));
        out.push_str(&format!("Pages: {}\n\n", pages.len()));
        out.push_str("---\n\n");
        for (page, text) in pages {
            out.push_str(&format!("## Page {page}\n\n"));
            out.push_str(text.trim_end());
            out.push_str("\n\n---\n\n");
        }
        out
    }

    /// Merge every cache entry into the artifact, atomically.
    pub async fn finalize(&self) -> Result<MergeReport, OcrError> {
        let pages = self.cache.load_all().await?;
        if pages.is_empty() {
            return Ok(self.nothing_to_write());
        }
        let content = Self::render(&self.title, &self.engine, &pages);
        let tmp = self.tmp_path();
        if let Err(e) = write_then_rename(&tmp, &self.output, content.as_bytes()).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(OcrError::WriteFailed {
                path: self.output.clone(),
                source: e,
            });
        }
        Ok(self.written(pages.len()))
    }

    /// Same as [`OutputMerger::finalize`] without a runtime, for `Drop` paths.
    pub fn finalize_blocking(&self) -> Result<MergeReport, OcrError> {
        let pages = self.cache.load_all_blocking()?;
        if pages.is_empty() {
            return Ok(self.nothing_to_write());
        }
        let content = Self::render(&self.title, &self.engine, &pages);
        let tmp = self.tmp_path();
        let write = || -> std::io::Result<()> {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
            drop(file);
            std::fs::rename(&tmp, &self.output)
        };
        if let Err(e) = write() {
            let _ = std::fs::remove_file(&tmp);
            return Err(OcrError::WriteFailed {
                path: self.output.clone(),
                source: e,
            });
        }
        Ok(self.written(pages.len()))
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.output.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    fn nothing_to_write(&self) -> MergeReport {
        warn!("No completed pages; {} not written", self.output.display());
        MergeReport {
            pages_merged: 0,
            path: self.output.clone(),
            written: false,
        }
    }

    fn written(&self, pages: usize) -> MergeReport {
        info!("Merged {} pages into {}", pages, self.output.display());
        MergeReport {
            pages_merged: pages,
            path: self.output.clone(),
            written: true,
        }
    }
}
