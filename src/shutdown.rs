//! Signal-driven cooperative shutdown.
//!
//! SIGINT / SIGTERM cancel one process-wide [`CancellationToken`]. The
//! scheduler stops dispatching when it sees the token, lets in-flight pages
//! finish within the grace period, and the run's [`FinalizeGuard`] merges
//! the artifact. Nothing is killed mid-write: cache commits are atomic, so
//! the worst case is a page that has to be redone on resume.

use crate::error::OcrError;
use crate::merge::{MergeReport, OutputMerger};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Owns the run's cancellation token and the signal listener.
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    requests: AtomicUsize,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle to the shared token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Number of shutdown requests received so far.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Request shutdown. Returns `true` for the first request only; later
    /// requests are logged and otherwise ignored.
    pub fn request(&self, source: &str) -> bool {
        let n = self.requests.fetch_add(1, Ordering::SeqCst) + 1;
        if n == 1 {
            info!(
                "Received {}, finishing in-flight pages; completed pages are kept",
                source
            );
            self.token.cancel();
            true
        } else {
            warn!("Received {} again (#{}), shutdown already in progress", source, n);
            false
        }
    }

    /// Spawn a task that turns SIGINT / SIGTERM into [`Self::request`].
    ///
    /// The task runs until aborted; abort the handle when the run ends.
    pub fn listen(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            #[cfg(unix)]
            let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!("SIGTERM handler not installed: {}", e);
                    None
                }
            };

            loop {
                #[cfg(unix)]
                let terminate = async {
                    match sigterm.as_mut() {
                        Some(s) => {
                            if s.recv().await.is_none() {
                                std::future::pending::<()>().await;
                            }
                        }
                        None => std::future::pending::<()>().await,
                    }
                };

                #[cfg(not(unix))]
                let terminate = std::future::pending::<()>();

                tokio::select! {
                    res = signal::ctrl_c() => {
                        if let Err(e) = res {
                            warn!("Ctrl+C handler not installed: {}", e);
                            return;
                        }
                        this.request("SIGINT");
                    }
                    _ = terminate => {
                        this.request("SIGTERM");
                    }
                }
            }
        })
    }
}

/// Guarantees the merge step runs exactly once per run.
///
/// Call [`FinalizeGuard::finalize`] on the normal path. If the guard is
/// dropped without it (an early `?`, a panic unwinding through the run) the
/// merge runs synchronously in `Drop` instead.
pub struct FinalizeGuard {
    merger: Option<OutputMerger>,
}

impl FinalizeGuard {
    pub fn new(merger: OutputMerger) -> Self {
        Self {
            merger: Some(merger),
        }
    }

    pub async fn finalize(mut self) -> Result<MergeReport, OcrError> {
        match self.merger.take() {
            Some(merger) => merger.finalize().await,
            None => Err(OcrError::Internal("finalize called twice".into())),
        }
    }
}

impl Drop for FinalizeGuard {
    fn drop(&mut self) {
        if let Some(merger) = self.merger.take() {
            warn!("Run ended early; merging completed pages");
            match merger.finalize_blocking() {
                Ok(report) if report.written => {
                    info!("Saved {} pages to {}", report.pages_merged, report.path.display())
                }
                Ok(_) => {}
                Err(e) => error!("Final merge failed: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{EntryMeta, ResultCache};
    use crate::pipeline::router::Route;
    use chrono::Utc;
    use tempfile::TempDir;

    #[test]
    fn repeated_requests_are_idempotent() {
        let c = ShutdownCoordinator::new();
        let token = c.token();
        assert!(!c.is_requested());

        assert!(c.request("SIGINT"));
        assert!(token.is_cancelled());
        assert!(!c.request("SIGINT"));
        assert!(!c.request("SIGTERM"));
        assert_eq!(c.requests(), 3);
        assert!(c.is_requested());
    }

    #[tokio::test]
    async fn listener_can_be_aborted() {
        let c = Arc::new(ShutdownCoordinator::new());
        let handle = c.listen();
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
        assert!(!c.is_requested());
    }

    async fn merger(tmp: &TempDir) -> OutputMerger {
        let cache = ResultCache::open(tmp.path().join("cache")).await.unwrap();
        let meta = EntryMeta {
            page: 1,
            route: Route::Local,
            confidence: Some(0.9),
            input_tokens: 0,
            output_tokens: 0,
            created_at: Utc::now(),
        };
        cache.save(1, "पहला पृष्ठ का पाठ", &meta).await.unwrap();
        OutputMerger::new(cache, tmp.path().join("out.md"), "doc", "local")
    }

    #[tokio::test]
    async fn dropped_guard_still_merges() {
        let tmp = TempDir::new().unwrap();
        let guard = FinalizeGuard::new(merger(&tmp).await);
        drop(guard);
        let out = std::fs::read_to_string(tmp.path().join("out.md")).unwrap();
        assert!(out.contains("## Page 1"));
    }

    #[tokio::test]
    async fn finalize_merges_once() {
        let tmp = TempDir::new().unwrap();
        let guard = FinalizeGuard::new(merger(&tmp).await);
        let report = guard.finalize().await.unwrap();
        assert_eq!(report.pages_merged, 1);

        // The guard is consumed; removing the file proves Drop did not merge again.
        std::fs::remove_file(tmp.path().join("out.md")).unwrap();
        tokio::task::yield_now().await;
        assert!(!tmp.path().join("out.md").exists());
    }
}
