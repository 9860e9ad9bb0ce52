//! Crash-safe per-page result store.
//!
//! One directory per document, one text file per page:
//!
//! ```text
//! .ocr_cache_<stem>/
//!   page_0001.txt         ← committed transcription
//!   page_0001.meta.json   ← advisory metadata (route, confidence, tokens)
//!   page_0002.txt.tmp     ← in-flight write, never reported as an entry
//! ```
//!
//! ## Commit protocol
//!
//! `save` writes the text to `page_NNNN.txt.tmp`, fsyncs it, and renames it
//! over `page_NNNN.txt`. Rename within one directory is atomic on POSIX
//! filesystems, so a reader (or a resumed run after `kill -9`) sees either
//! no entry or the complete text, never a truncated one. The metadata
//! sidecar is written before the text and is best effort: a missing or stale
//! sidecar never hides a committed entry.
//!
//! Entries are write-once. The pipeline never deletes them; a run skips
//! every page that already has one.

use crate::pipeline::router::Route;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

const ENTRY_PREFIX: &str = "page_";
const ENTRY_SUFFIX: &str = ".txt";

/// Advisory metadata stored beside each entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMeta {
    pub page: usize,
    /// Path the page took through the engines.
    pub route: Route,
    /// Local confidence, when the local engine ran.
    pub confidence: Option<f32>,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub created_at: DateTime<Utc>,
}

/// Durable, atomic, per-page result store.
#[derive(Debug, Clone)]
pub struct ResultCache {
    dir: PathBuf,
}

impl ResultCache {
    /// Default cache directory for a document: `.ocr_cache_<stem>/` beside it.
    pub fn default_dir(document: &Path) -> PathBuf {
        let stem = document
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string());
        document
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(format!(".ocr_cache_{stem}"))
    }

    /// Open (creating if needed) the cache rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        debug!("Result cache at {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, page: usize) -> PathBuf {
        self.dir.join(format!("{ENTRY_PREFIX}{page:04}{ENTRY_SUFFIX}"))
    }

    fn meta_path(&self, page: usize) -> PathBuf {
        self.dir.join(format!("{ENTRY_PREFIX}{page:04}.meta.json"))
    }

    /// Durably commit `text` as the entry for `page`.
    ///
    /// On error the temporary file is removed and no entry or sidecar is
    /// created; an existing committed entry is left untouched. The sidecar
    /// follows the text, best effort.
    pub async fn save(&self, page: usize, text: &str, meta: &EntryMeta) -> io::Result<()> {
        let final_path = self.entry_path(page);
        let tmp_path = tmp_path_for(&final_path);

        match write_then_rename(&tmp_path, &final_path, text.as_bytes()).await {
            Ok(()) => {
                if let Err(e) = self.write_meta(page, meta).await {
                    warn!("Page {}: metadata sidecar not written: {}", page, e);
                }
                sync_dir(&self.dir).await;
                debug!("Page {}: committed {} bytes", page, text.len());
                Ok(())
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                Err(e)
            }
        }
    }

    async fn write_meta(&self, page: usize, meta: &EntryMeta) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(meta).map_err(io::Error::other)?;
        let path = self.meta_path(page);
        let tmp = tmp_path_for(&path);
        let res = write_then_rename(&tmp, &path, &json).await;
        if res.is_err() {
            let _ = tokio::fs::remove_file(&tmp).await;
        }
        res
    }

    /// Committed text for `page`, if any.
    pub async fn get(&self, page: usize) -> io::Result<Option<String>> {
        match tokio::fs::read_to_string(self.entry_path(page)).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Whether a committed entry exists for `page`.
    pub async fn has(&self, page: usize) -> bool {
        tokio::fs::metadata(self.entry_path(page))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    /// Metadata sidecar for `page`, if present and readable.
    pub async fn meta(&self, page: usize) -> Option<EntryMeta> {
        let bytes = tokio::fs::read(self.meta_path(page)).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Ascending indices of committed entries.
    pub async fn list_indices(&self) -> io::Result<Vec<usize>> {
        let mut indices = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(page) = parse_entry_name(&entry.file_name().to_string_lossy()) {
                indices.push(page);
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }

    /// Every committed entry, keyed by page.
    pub async fn load_all(&self) -> io::Result<BTreeMap<usize, String>> {
        let mut out = BTreeMap::new();
        for page in self.list_indices().await? {
            if let Some(text) = self.get(page).await? {
                out.insert(page, text);
            }
        }
        Ok(out)
    }

    /// Blocking variant of [`ResultCache::load_all`] for `Drop` paths where
    /// no runtime can be awaited.
    pub fn load_all_blocking(&self) -> io::Result<BTreeMap<usize, String>> {
        let mut out = BTreeMap::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(page) = parse_entry_name(&entry.file_name().to_string_lossy()) {
                out.insert(page, std::fs::read_to_string(entry.path())?);
            }
        }
        Ok(out)
    }
}

/// `page_0042.txt` → `Some(42)`. Temporary and sidecar files → `None`.
fn parse_entry_name(name: &str) -> Option<usize> {
    let digits = name.strip_prefix(ENTRY_PREFIX)?.strip_suffix(ENTRY_SUFFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().filter(|&p| p > 0)
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Write `bytes` to `tmp`, fsync, then rename over `dest`.
pub(crate) async fn write_then_rename(tmp: &Path, dest: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = tokio::fs::File::create(tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(tmp, dest).await
}

/// Persist the rename itself. Best effort; not every platform supports it.
async fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    {
        if let Ok(handle) = tokio::fs::File::open(dir).await {
            let _ = handle.sync_all().await;
        }
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
}
