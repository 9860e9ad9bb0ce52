//! Persisted per-page state machine.
//!
//! ```text
//! PENDING ──▶ IN_PROGRESS ──▶ COMPLETED
//!                        └──▶ FAILED(reason)
//! ```
//!
//! No other transition is accepted within a run; retrying a FAILED page
//! takes a fresh run (see [`ProgressTracker::reconcile`]). The record is
//! rewritten atomically after every transition, so an external restart can
//! reconstruct the audit trail from disk alone. The result cache stays
//! authoritative: on resume, cached pages are COMPLETED whatever the record
//! says, and pages caught mid-flight go back to PENDING.

use crate::cache::write_then_rename;
use crate::error::OcrError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// State of one page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PageStatus {
    Pending,
    InProgress,
    Completed,
    Failed { reason: String },
}

impl PageStatus {
    pub fn name(&self) -> &'static str {
        match self {
            PageStatus::Pending => "pending",
            PageStatus::InProgress => "in_progress",
            PageStatus::Completed => "completed",
            PageStatus::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PageStatus::Completed | PageStatus::Failed { .. })
    }

    fn may_become(&self, next: &PageStatus) -> bool {
        matches!(
            (self, next),
            (PageStatus::Pending, PageStatus::InProgress)
                | (PageStatus::InProgress, PageStatus::Completed)
                | (PageStatus::InProgress, PageStatus::Failed { .. })
        )
    }
}

/// On-disk form of the progress file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub document: String,
    pub total_pages: usize,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub pages: BTreeMap<usize, PageStatus>,
}

/// Page counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
}

pub struct ProgressTracker {
    path: PathBuf,
    record: ProgressRecord,
}

impl ProgressTracker {
    /// Default progress file: `.ocr_progress_<stem>.json` beside the document.
    pub fn default_path(document: &Path) -> PathBuf {
        let stem = document
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string());
        document
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(format!(".ocr_progress_{stem}.json"))
    }

    /// Start a fresh record with every page in `pages` PENDING.
    pub fn fresh(path: impl Into<PathBuf>, document: &str, total_pages: usize, pages: &[usize]) -> Self {
        let now = Utc::now();
        Self {
            path: path.into(),
            record: ProgressRecord {
                document: document.to_string(),
                total_pages,
                started_at: now,
                updated_at: now,
                pages: pages.iter().map(|&p| (p, PageStatus::Pending)).collect(),
            },
        }
    }

    /// Load an existing record. Requested pages missing from it are added as
    /// PENDING. A missing file yields a fresh record.
    pub async fn load_or_fresh(
        path: impl Into<PathBuf>,
        document: &str,
        total_pages: usize,
        pages: &[usize],
    ) -> Result<Self, OcrError> {
        let path = path.into();
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No progress record at {}; starting fresh", path.display());
                return Ok(Self::fresh(path, document, total_pages, pages));
            }
            Err(e) => return Err(OcrError::Io(e)),
        };
        let mut record: ProgressRecord =
            serde_json::from_slice(&bytes).map_err(|e| OcrError::StateCorrupt {
                path: path.clone(),
                detail: e.to_string(),
            })?;
        for &p in pages {
            record.pages.entry(p).or_insert(PageStatus::Pending);
        }
        record.total_pages = total_pages;
        debug!("Loaded progress record with {} pages", record.pages.len());
        Ok(Self { path, record })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self) -> &ProgressRecord {
        &self.record
    }

    pub fn status(&self, page: usize) -> Option<&PageStatus> {
        self.record.pages.get(&page)
    }

    /// Bring the record in line with the cache before a run starts.
    ///
    /// * cached pages → COMPLETED
    /// * COMPLETED pages without an entry, IN_PROGRESS pages → PENDING
    /// * FAILED pages → PENDING only when `retry_failed`
    ///
    /// Only the in-memory record changes; call [`Self::persist`] to commit.
    pub fn reconcile(&mut self, cached: &BTreeSet<usize>, retry_failed: bool) {
        for (page, status) in self.record.pages.iter_mut() {
            let next = if cached.contains(page) {
                PageStatus::Completed
            } else {
                match &*status {
                    PageStatus::Completed | PageStatus::InProgress => PageStatus::Pending,
                    PageStatus::Failed { .. } if retry_failed => PageStatus::Pending,
                    other => other.clone(),
                }
            };
            if *status != next {
                debug!("Page {}: {} → {} (reconcile)", page, status.name(), next.name());
                *status = next;
            }
        }
    }

    /// Apply one legal transition and persist the record.
    pub async fn mark(&mut self, page: usize, next: PageStatus) -> Result<(), OcrError> {
        let current = self
            .record
            .pages
            .get(&page)
            .cloned()
            .unwrap_or(PageStatus::Pending);
        if !current.may_become(&next) {
            return Err(OcrError::InvalidTransition {
                page,
                from: current.name(),
                to: next.name(),
            });
        }
        self.record.pages.insert(page, next);
        self.persist().await
    }

    /// PENDING pages among `pages`, ascending.
    pub fn pending_among(&self, pages: &[usize]) -> Vec<usize> {
        pages
            .iter()
            .copied()
            .filter(|p| matches!(self.record.pages.get(p), Some(PageStatus::Pending)))
            .collect()
    }

    pub fn counts(&self) -> StatusCounts {
        self.record
            .pages
            .values()
            .fold(StatusCounts::default(), |mut c, s| {
                match s {
                    PageStatus::Pending => c.pending += 1,
                    PageStatus::InProgress => c.in_progress += 1,
                    PageStatus::Completed => c.completed += 1,
                    PageStatus::Failed { .. } => c.failed += 1,
                }
                c
            })
    }

    /// `(page, reason)` for every FAILED page, ascending.
    pub fn failures(&self) -> Vec<(usize, String)> {
        self.record
            .pages
            .iter()
            .filter_map(|(p, s)| match s {
                PageStatus::Failed { reason } => Some((*p, reason.clone())),
                _ => None,
            })
            .collect()
    }

    /// Write the record atomically.
    pub async fn persist(&mut self) -> Result<(), OcrError> {
        self.record.updated_at = Utc::now();
        let json = serde_json::to_vec_pretty(&self.record)
            .map_err(|e| OcrError::Internal(format!("progress serialisation: {e}")))?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| OcrError::WriteFailed {
                        path: self.path.clone(),
                        source: e,
                    })?;
            }
        }
        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        if let Err(e) = write_then_rename(&tmp, &self.path, &json).await {
            warn!("Progress record not persisted: {}", e);
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(OcrError::WriteFailed {
                path: self.path.clone(),
                source: e,
            });
        }
        Ok(())
    }
}
