//! Whole-document entry point.
//!
//! [`run`] wires the stages together for one document:
//!
//! 1. resolve the input (local path or URL)
//! 2. count pages and apply the page selection
//! 3. reconcile the progress record with the result cache
//! 4. stop here for a dry run and return a [`RunPlan`]
//! 5. schedule every PENDING page
//! 6. merge the cache into the artifact, on every exit path
//!
//! The cache is the source of truth for "done": a page with a committed
//! entry is never processed again, whatever the progress record says.

use crate::cache::ResultCache;
use crate::config::{EngineSelector, PipelineConfig};
use crate::error::OcrError;
use crate::merge::{MergeReport, OutputMerger};
use crate::pipeline::input;
use crate::pipeline::local::{LocalEngine, TesseractEngine};
use crate::pipeline::rasterize::{PageRasterizer, PdfiumRasterizer, ScratchDir};
use crate::pipeline::remote::{cost_usd, RemoteEngine, UsageSnapshot, VisionEngine};
use crate::pipeline::router::{Router, RoutingSnapshot};
use crate::progress::ProgressCallback;
use crate::scheduler::{Scheduler, SchedulerOptions};
use crate::shutdown::{FinalizeGuard, ShutdownCoordinator};
use crate::tracker::{PageStatus, ProgressTracker};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Rough prompt + image tokens for one page sent to a vision model.
pub const EST_INPUT_TOKENS_PER_PAGE: usize = 1_800;
/// Rough transcription length of one dense Devanagari page, in tokens.
pub const EST_OUTPUT_TOKENS_PER_PAGE: usize = 900;
/// Pages one worker gets through per minute against a remote model.
const PAGES_PER_WORKER_MINUTE: usize = 12;

// ── Engines ──────────────────────────────────────────────────────────────

/// The concrete engines a run uses. Built once at startup.
pub struct Engines {
    pub rasterizer: Arc<dyn PageRasterizer>,
    pub local: Option<Arc<dyn LocalEngine>>,
    pub remote: Option<Arc<dyn RemoteEngine>>,
}

impl Engines {
    /// Build the production engines for `config.engine`.
    ///
    /// Preflights every engine the mode needs, so a missing Tesseract
    /// language pack or API key fails here rather than on page one. A dry
    /// run builds only the rasterizer.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, OcrError> {
        PdfiumRasterizer::preflight()?;
        let rasterizer: Arc<dyn PageRasterizer> = Arc::new(PdfiumRasterizer::new(config.dpi));

        if config.dry_run {
            return Ok(Self {
                rasterizer,
                local: None,
                remote: None,
            });
        }

        let local: Option<Arc<dyn LocalEngine>> = if config.engine.uses_local() {
            let tesseract = TesseractEngine::new().dpi(config.dpi);
            let version = tesseract.preflight()?;
            info!("Local engine: {}", version);
            Some(Arc::new(tesseract))
        } else {
            None
        };

        let remote: Option<Arc<dyn RemoteEngine>> = if config.engine.uses_remote() {
            let vision = VisionEngine::from_config(config)?;
            info!("Remote engine: {}", vision.name());
            Some(Arc::new(vision))
        } else {
            None
        };

        Ok(Self {
            rasterizer,
            local,
            remote,
        })
    }
}

// ── Outcomes ─────────────────────────────────────────────────────────────

/// What a dry run would do.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunPlan {
    pub document: String,
    pub total_pages: usize,
    pub requested: Vec<usize>,
    /// Requested pages that already have a cache entry.
    pub cached: Vec<usize>,
    /// FAILED pages a resumed run leaves alone (`--retry-failed` to include).
    pub skipped_failed: Vec<usize>,
    pub pending: Vec<usize>,
    pub engine: EngineSelector,
    /// Upper bound: in hybrid mode only escalated pages reach the remote engine.
    pub max_remote_pages: usize,
    pub estimated_cost_usd: f64,
    pub estimated_minutes: f64,
    pub cache_dir: PathBuf,
    pub progress_file: PathBuf,
    pub output: PathBuf,
}

/// What a completed (or interrupted) run did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub document: String,
    pub engine: String,
    pub requested: usize,
    /// Requested pages cached before this run started.
    pub previously_cached: usize,
    /// Requested pages cached now, including `previously_cached`.
    pub completed: usize,
    /// Pages committed by this run.
    pub processed: usize,
    /// Pages that failed in this run, with their reasons.
    pub failed: BTreeMap<usize, String>,
    pub skipped_failed: Vec<usize>,
    pub abandoned: Vec<usize>,
    pub not_started: Vec<usize>,
    pub cancelled: bool,
    pub peak_in_flight: usize,
    pub routing: RoutingSnapshot,
    pub usage: UsageSnapshot,
    pub artifact: MergeReport,
    pub progress_file: PathBuf,
    pub elapsed_ms: u64,
}

impl RunSummary {
    /// Every requested page has a committed entry.
    pub fn is_complete(&self) -> bool {
        self.completed == self.requested
    }

    /// Whether re-running with `--resume` would have anything to do.
    pub fn resumable(&self) -> bool {
        !self.is_complete()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOutcome {
    Planned(RunPlan),
    Finished(RunSummary),
}

// ── Entry point ──────────────────────────────────────────────────────────

/// OCR one document.
///
/// Page-level failures never abort the run; they are recorded and the
/// remaining pages continue.
///
/// # Errors
/// Fatal startup failures (input, PDF, state file, missing engine) and
/// [`OcrError::AllPagesFailed`] when no requested page ends up cached.
pub async fn run(
    input_str: &str,
    config: &PipelineConfig,
    engines: Engines,
    progress: ProgressCallback,
    shutdown: &ShutdownCoordinator,
) -> Result<RunOutcome, OcrError> {
    let started = Instant::now();
    info!("Starting OCR: {}", input_str);

    // ── Step 1: Resolve input ────────────────────────────────────────────
    let resolved = input::open_input(input_str, config.download_timeout_secs).await?;
    let pdf_path = resolved.path().to_path_buf();
    let anchor = resolved.anchor().to_path_buf();
    let document = anchor.display().to_string();

    // ── Step 2: Page selection ───────────────────────────────────────────
    let total_pages = engines.rasterizer.page_count(&pdf_path).await?;
    let requested = config.pages.to_pages(total_pages)?;
    info!(
        "PDF has {} pages, {} selected",
        total_pages,
        requested.len()
    );

    // ── Step 3: Reconcile state with the cache ───────────────────────────
    let cache_dir = config
        .cache_dir
        .clone()
        .unwrap_or_else(|| ResultCache::default_dir(&anchor));
    let cache = ResultCache::open(&cache_dir)
        .await
        .map_err(|e| OcrError::WriteFailed {
            path: cache_dir.clone(),
            source: e,
        })?;
    let cached_all: BTreeSet<usize> = cache.list_indices().await?.into_iter().collect();

    let progress_file = ProgressTracker::default_path(&anchor);
    let mut tracker = if config.resume {
        ProgressTracker::load_or_fresh(&progress_file, &document, total_pages, &requested).await?
    } else {
        ProgressTracker::fresh(&progress_file, &document, total_pages, &requested)
    };
    tracker.reconcile(&cached_all, config.retry_failed);

    let cached: Vec<usize> = requested
        .iter()
        .copied()
        .filter(|p| cached_all.contains(p))
        .collect();
    let skipped_failed: Vec<usize> = requested
        .iter()
        .copied()
        .filter(|p| matches!(tracker.status(*p), Some(PageStatus::Failed { .. })))
        .collect();
    let pending = tracker.pending_among(&requested);
    info!(
        "{} cached, {} pending, {} previously failed and skipped",
        cached.len(),
        pending.len(),
        skipped_failed.len()
    );
    if !skipped_failed.is_empty() {
        warn!(
            "Skipping {} FAILED pages; pass --retry-failed to process them again",
            skipped_failed.len()
        );
    }

    let output = config
        .output
        .clone()
        .unwrap_or_else(|| OutputMerger::default_output(&anchor));

    // ── Step 4: Dry run ──────────────────────────────────────────────────
    if config.dry_run {
        let plan = plan(PlanInputs {
            document,
            total_pages,
            requested,
            cached,
            skipped_failed,
            pending,
            config,
            cache_dir,
            progress_file,
            output,
        });
        info!(
            "Dry run: {} pages would be processed, est. ${:.4}",
            plan.pending.len(),
            plan.estimated_cost_usd
        );
        return Ok(RunOutcome::Planned(plan));
    }

    tracker.persist().await?;

    // ── Step 5: Schedule ─────────────────────────────────────────────────
    let router = Arc::new(Router::new(config, engines.local, engines.remote)?);
    let engine_label = router.label();
    info!("Engine: {}", engine_label);

    let title = anchor
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    let guard = FinalizeGuard::new(OutputMerger::new(
        cache.clone(),
        &output,
        title,
        engine_label.clone(),
    ));

    progress.on_run_start(pending.len(), requested.len());
    let scratch = Arc::new(ScratchDir::new()?);
    debug!("Scratch directory: {}", scratch.path().display());

    let tracker = Arc::new(Mutex::new(tracker));
    let scheduler = Arc::new(Scheduler::new(
        &pdf_path,
        engines.rasterizer,
        Arc::clone(&router),
        cache.clone(),
        Arc::clone(&tracker),
        Arc::clone(&scratch),
        Arc::clone(&progress),
        SchedulerOptions::from_config(config),
    ));
    let report = scheduler.run(pending, shutdown.token()).await;

    // ── Step 6: Merge ────────────────────────────────────────────────────
    let artifact = guard.finalize().await?;

    let cached_now: BTreeSet<usize> = cache.list_indices().await?.into_iter().collect();
    let completed = requested.iter().filter(|p| cached_now.contains(p)).count();

    if completed == 0 && !requested.is_empty() {
        let first_error = report
            .failed
            .values()
            .next()
            .map(|e| e.to_string())
            .or_else(|| tracker_first_failure(&skipped_failed))
            .unwrap_or_else(|| {
                if report.cancelled {
                    "shutdown requested before any page completed".to_string()
                } else {
                    "no page produced output".to_string()
                }
            });
        return Err(OcrError::AllPagesFailed {
            total: requested.len(),
            first_error,
        });
    }

    let summary = RunSummary {
        document,
        engine: engine_label,
        requested: requested.len(),
        previously_cached: cached.len(),
        completed,
        processed: report.completed.len(),
        failed: report
            .failed
            .iter()
            .map(|(p, e)| (*p, e.to_string()))
            .collect(),
        skipped_failed,
        abandoned: report.abandoned.into_iter().collect(),
        not_started: report.not_started.into_iter().collect(),
        cancelled: report.cancelled,
        peak_in_flight: report.peak_in_flight,
        routing: router.stats(),
        usage: router.usage(),
        artifact,
        progress_file,
        elapsed_ms: started.elapsed().as_millis() as u64,
    };

    info!(
        "Done: {}/{} pages in {}ms ({} failed, {} remote calls, ${:.4})",
        summary.completed,
        summary.requested,
        summary.elapsed_ms,
        summary.failed.len(),
        summary.usage.calls,
        summary.usage.estimated_cost_usd
    );
    Ok(RunOutcome::Finished(summary))
}

fn tracker_first_failure(skipped: &[usize]) -> Option<String> {
    skipped
        .first()
        .map(|p| format!("Page {p}: failed in an earlier run (use --retry-failed)"))
}

// ── Dry-run estimate ─────────────────────────────────────────────────────

struct PlanInputs<'a> {
    document: String,
    total_pages: usize,
    requested: Vec<usize>,
    cached: Vec<usize>,
    skipped_failed: Vec<usize>,
    pending: Vec<usize>,
    config: &'a PipelineConfig,
    cache_dir: PathBuf,
    progress_file: PathBuf,
    output: PathBuf,
}

fn plan(inputs: PlanInputs<'_>) -> RunPlan {
    let config = inputs.config;
    let max_remote_pages = if config.engine.uses_remote() {
        inputs.pending.len()
    } else {
        0
    };
    let estimated_cost_usd = cost_usd(
        max_remote_pages * EST_INPUT_TOKENS_PER_PAGE,
        max_remote_pages * EST_OUTPUT_TOKENS_PER_PAGE,
    );
    RunPlan {
        estimated_minutes: estimate_minutes(inputs.pending.len(), config),
        document: inputs.document,
        total_pages: inputs.total_pages,
        requested: inputs.requested,
        cached: inputs.cached,
        skipped_failed: inputs.skipped_failed,
        pending: inputs.pending,
        engine: config.engine,
        max_remote_pages,
        estimated_cost_usd,
        cache_dir: inputs.cache_dir,
        progress_file: inputs.progress_file,
        output: inputs.output,
    }
}

/// Wall-clock estimate: workers × per-worker pace, capped by the rate limit
/// whenever the remote engine is involved.
pub fn estimate_minutes(pages: usize, config: &PipelineConfig) -> f64 {
    if pages == 0 {
        return 0.0;
    }
    let mut per_minute = config.concurrency.max(1) * PAGES_PER_WORKER_MINUTE;
    if config.engine.uses_remote() && config.requests_per_minute > 0 {
        per_minute = per_minute.min(config.requests_per_minute as usize);
    }
    pages as f64 / per_minute as f64
}
