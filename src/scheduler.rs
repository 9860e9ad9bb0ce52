//! Bounded-concurrency driver of the per-page pipeline.
//!
//! ```text
//! pending pages ──▶ take_while(!cancelled) ──▶ buffer_unordered(N) ──▶ outcomes
//!                                                 │
//!            per page: PENDING → IN_PROGRESS ─────┤
//!                      rasterize → store image → route → validate → cache.save
//!                      → COMPLETED | FAILED(reason)
//! ```
//!
//! `buffer_unordered(N)` is the worker pool: it never polls more than `N`
//! page futures, and pulls the next page only when one finishes, so the
//! cancellation check in `take_while` runs at every dispatch.
//!
//! Every page future is isolated: a panic is caught with `catch_unwind`, an
//! overrun with `tokio::time::timeout`, and either becomes a FAILED page
//! rather than an aborted run. The page image is dropped before the page's
//! slot is released, whichever way the page ends.
//!
//! The timeout covers rasterize, route and validate only. The cache commit
//! runs after it, so a page is never reported as timed out once its entry
//! exists.
//!
//! ## Worker slots
//!
//! Each page also holds a [`WorkerLease`] from a semaphore of `N` permits.
//! Dropping a timed-out page future does not stop blocking work already
//! handed to the blocking pool, so the lease is cloned into that work and
//! the permit returns only when it does. The next page waits for it.
//!
//! ## Shutdown
//!
//! Once the token is cancelled no new page starts. In-flight pages get
//! `shutdown_grace` to finish; after that the stream is dropped, which drops
//! their futures. Abandoned pages stay IN_PROGRESS on disk and go back to
//! PENDING when the next run reconciles.

use crate::cache::{EntryMeta, ResultCache};
use crate::config::PipelineConfig;
use crate::error::PageError;
use crate::pipeline::rasterize::{PageRasterizer, ScratchDir};
use crate::pipeline::router::{Route, Router, Transcript};
use crate::pipeline::validate::ResponseValidator;
use crate::progress::ProgressCallback;
use crate::tracker::{PageStatus, ProgressTracker};
use chrono::Utc;
use futures::future::{self, FutureExt};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Scheduler knobs, taken from [`PipelineConfig`].
#[derive(Debug, Clone, Copy)]
pub struct SchedulerOptions {
    pub concurrency: usize,
    pub page_timeout: Option<Duration>,
    pub shutdown_grace: Option<Duration>,
    pub reclaim_every: usize,
}

impl SchedulerOptions {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            page_timeout: config.page_timeout,
            shutdown_grace: config.shutdown_grace,
            reclaim_every: config.reclaim_every.max(1),
        }
    }
}

/// What happened to the pages handed to [`Scheduler::run`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScheduleReport {
    pub completed: BTreeSet<usize>,
    pub failed: BTreeMap<usize, PageError>,
    /// In flight when the grace period ran out.
    pub abandoned: BTreeSet<usize>,
    /// Never started because shutdown was requested first.
    pub not_started: BTreeSet<usize>,
    pub cancelled: bool,
    /// Highest number of pages observed in flight at once.
    pub peak_in_flight: usize,
}

/// Pages currently between claim and release.
#[derive(Debug, Default)]
struct InFlight {
    pages: StdMutex<BTreeSet<usize>>,
    peak: AtomicUsize,
}

impl InFlight {
    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<usize>> {
        self.pages.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn enter(self: &Arc<Self>, page: usize) -> InFlightSlot {
        let mut pages = self.lock();
        pages.insert(page);
        self.peak.fetch_max(pages.len(), Ordering::SeqCst);
        InFlightSlot {
            page,
            owner: Arc::clone(self),
        }
    }

    fn snapshot(&self) -> BTreeSet<usize> {
        self.lock().clone()
    }
}

/// Releases the page's in-flight slot on drop.
struct InFlightSlot {
    page: usize,
    owner: Arc<InFlight>,
}

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        self.owner.lock().remove(&self.page);
    }
}

/// One worker slot. Clones share it; the slot frees when the last clone
/// drops.
#[derive(Debug, Clone, Default)]
pub struct WorkerLease(Option<Arc<OwnedSemaphorePermit>>);

impl WorkerLease {
    pub fn new(permit: OwnedSemaphorePermit) -> Self {
        Self(Some(Arc::new(permit)))
    }

    /// A lease tied to no pool, for driving a [`Router`] directly.
    pub fn detached() -> Self {
        Self(None)
    }
}

/// Drives pages through rasterize → route → validate → commit.
pub struct Scheduler {
    document: PathBuf,
    rasterizer: Arc<dyn PageRasterizer>,
    router: Arc<Router>,
    validator: ResponseValidator,
    cache: ResultCache,
    tracker: Arc<Mutex<ProgressTracker>>,
    scratch: Arc<ScratchDir>,
    progress: ProgressCallback,
    options: SchedulerOptions,
    in_flight: Arc<InFlight>,
    workers: Arc<Semaphore>,
    finished: AtomicUsize,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        document: impl Into<PathBuf>,
        rasterizer: Arc<dyn PageRasterizer>,
        router: Arc<Router>,
        cache: ResultCache,
        tracker: Arc<Mutex<ProgressTracker>>,
        scratch: Arc<ScratchDir>,
        progress: ProgressCallback,
        options: SchedulerOptions,
    ) -> Self {
        Self {
            document: document.into(),
            rasterizer,
            router,
            validator: ResponseValidator::new(),
            cache,
            tracker,
            scratch,
            progress,
            options,
            in_flight: Arc::new(InFlight::default()),
            workers: Arc::new(Semaphore::new(options.concurrency.max(1))),
            finished: AtomicUsize::new(0),
        }
    }

    /// Process `pages` (ascending, all PENDING) until done or cancelled.
    pub async fn run(self: Arc<Self>, pages: Vec<usize>, token: CancellationToken) -> ScheduleReport {
        let total = pages.len();
        let mut report = ScheduleReport::default();
        let mut remaining: BTreeSet<usize> = pages.iter().copied().collect();

        info!(
            "Scheduling {} pages with {} workers",
            total, self.options.concurrency
        );

        let dispatch_token = token.clone();
        let page_token = token.clone();
        let this = Arc::clone(&self);
        let mut outcomes = stream::iter(pages)
            .take_while(move |_| future::ready(!dispatch_token.is_cancelled()))
            .map(move |page| {
                let this = Arc::clone(&this);
                let token = page_token.clone();
                async move {
                    let outcome = this.run_page(page, total, &token).await;
                    (page, outcome)
                }
            })
            .buffer_unordered(self.options.concurrency);

        let mut deadline: Option<Instant> = None;
        loop {
            let grace_expired = async move {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;

                next = outcomes.next() => match next {
                    Some((page, outcome)) => match outcome {
                        Some(Ok(())) => {
                            remaining.remove(&page);
                            report.completed.insert(page);
                        }
                        Some(Err(e)) => {
                            remaining.remove(&page);
                            report.failed.insert(page, e);
                        }
                        // Shutdown arrived while it waited for a slot.
                        None => {}
                    },
                    None => break,
                },

                _ = token.cancelled(), if !report.cancelled => {
                    report.cancelled = true;
                    let in_flight = self.in_flight.snapshot().len();
                    info!("Shutdown requested: {} pages in flight, no new pages will start", in_flight);
                    self.progress.on_shutdown(in_flight);
                    deadline = self.options.shutdown_grace.map(|g| Instant::now() + g);
                }

                _ = grace_expired => {
                    report.abandoned = self.in_flight.snapshot();
                    warn!(
                        "Grace period expired; abandoning {} in-flight pages: {:?}",
                        report.abandoned.len(),
                        report.abandoned
                    );
                    break;
                }
            }
        }
        drop(outcomes);
        report.cancelled |= token.is_cancelled();

        for page in &report.abandoned {
            remaining.remove(page);
        }
        report.not_started = remaining;
        report.peak_in_flight = self.in_flight.peak.load(Ordering::SeqCst);

        self.reclaim().await;
        self.progress
            .on_run_complete(report.completed.len(), report.failed.len());
        report
    }

    /// Full lifecycle of one page, isolated from its siblings. `None` when
    /// the page never started.
    async fn run_page(
        &self,
        page: usize,
        total: usize,
        token: &CancellationToken,
    ) -> Option<Result<(), PageError>> {
        if self.workers.available_permits() == 0 {
            debug!("Page {}: waiting for a worker slot", page);
        }
        let lease = match Arc::clone(&self.workers).acquire_owned().await {
            Ok(permit) => WorkerLease::new(permit),
            Err(_) => return None,
        };
        if token.is_cancelled() {
            return None;
        }

        let _slot = self.in_flight.enter(page);
        self.progress.on_page_start(page, total);
        self.transition(page, PageStatus::InProgress).await;

        let work = AssertUnwindSafe(self.transcribe(page, &lease)).catch_unwind();
        let transcribed = match self.options.page_timeout {
            Some(limit) => match tokio::time::timeout(limit, work).await {
                Ok(done) => done,
                Err(_) => Ok(Err(PageError::Timeout {
                    page,
                    secs: limit.as_secs_f64().ceil() as u64,
                })),
            },
            None => work.await,
        };
        let result = match transcribed {
            Ok(Ok(transcript)) => self.commit(page, transcript).await,
            Ok(Err(e)) => Err(e),
            Err(panic) => Err(PageError::Panicked {
                page,
                detail: panic_message(panic.as_ref()),
            }),
        };

        match &result {
            Ok((route, chars)) => {
                debug!("Page {}: completed via {}", page, route);
                self.transition(page, PageStatus::Completed).await;
                self.progress.on_page_complete(page, total, route, *chars);
            }
            Err(e) => {
                warn!("Page {}: {}", page, e);
                self.transition(
                    page,
                    PageStatus::Failed {
                        reason: e.to_string(),
                    },
                )
                .await;
                self.progress.on_page_error(page, total, &e.to_string());
            }
        }

        let finished = self.finished.fetch_add(1, Ordering::SeqCst) + 1;
        if finished % self.options.reclaim_every == 0 {
            self.reclaim().await;
        }

        Some(result.map(|_| ()))
    }

    /// rasterize → route → validate. Runs under the page timeout.
    async fn transcribe(&self, page: usize, lease: &WorkerLease) -> Result<Transcript, PageError> {
        let png = self.rasterizer.rasterize(&self.document, page).await?;
        let image = self
            .scratch
            .store(page, png)
            .await
            .map_err(|e| PageError::RenderFailed {
                page,
                detail: format!("scratch write failed: {e}"),
            })?;

        let transcript = self.router.process(&image, lease).await?;
        drop(image);

        let verdict = self.validator.validate(&transcript.text);
        if !verdict.accepted {
            return Err(PageError::ValidationRejected {
                page,
                reason: verdict.reason_text(),
            });
        }
        Ok(transcript)
    }

    /// Write the accepted text to the cache. Returns the route and the
    /// committed length in characters.
    async fn commit(&self, page: usize, transcript: Transcript) -> Result<(Route, usize), PageError> {
        let meta = EntryMeta {
            page,
            route: transcript.route.clone(),
            confidence: transcript.confidence,
            input_tokens: transcript.usage.input_tokens,
            output_tokens: transcript.usage.output_tokens,
            created_at: Utc::now(),
        };
        // A panic here is still isolated to the page.
        let saved = AssertUnwindSafe(self.cache.save(page, &transcript.text, &meta))
            .catch_unwind()
            .await
            .map_err(|panic| PageError::Panicked {
                page,
                detail: panic_message(panic.as_ref()),
            })?;
        saved.map_err(|e| PageError::CacheWriteFailed {
            page,
            detail: e.to_string(),
        })?;

        Ok((transcript.route, transcript.text.chars().count()))
    }

    async fn transition(&self, page: usize, next: PageStatus) {
        let mut tracker = self.tracker.lock().await;
        if let Err(e) = tracker.mark(page, next).await {
            warn!("Page {}: progress record not updated: {}", page, e);
        }
    }

    async fn reclaim(&self) {
        self.rasterizer.reclaim();
        let scratch = Arc::clone(&self.scratch);
        let removed = tokio::task::spawn_blocking(move || scratch.sweep())
            .await
            .unwrap_or_else(|e| {
                warn!("Scratch sweep task failed: {}", e);
                0
            });
        debug!(
            "Reclaim pass after {} pages ({} scratch files removed)",
            self.finished.load(Ordering::SeqCst),
            removed
        );
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
