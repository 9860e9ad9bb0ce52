//! Whole-run integration tests with in-process fake engines.
//!
//! No pdfium, no tesseract and no network: the fake rasterizer writes
//! `page-N` as the page "image", and the fake engines read the page number
//! back out of it. Everything else (scheduler, router, cache, progress
//! record, merge) is the real code.

use async_trait::async_trait;
use ocr_hindi::pipeline::decision::EscalationReason;
use ocr_hindi::pipeline::local::{LocalEngine, LocalOutput};
use ocr_hindi::pipeline::rasterize::{PageRasterizer, ScratchDir};
use ocr_hindi::pipeline::remote::{RemoteEngine, RemoteError, RemoteOutput, Usage};
use ocr_hindi::pipeline::router::{Route, Router};
use ocr_hindi::scheduler::{Scheduler, SchedulerOptions};
use ocr_hindi::{
    run, EngineSelector, Engines, NoopProgressCallback, OcrError, OcrProgressCallback,
    PageSelection, PageStatus, PipelineConfig, PipelineConfigBuilder, ProgressCallback,
    ProgressTracker, RemoteOptions, ResultCache, RunOutcome, RunSummary, ShutdownCoordinator,
};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

// ── Fakes ────────────────────────────────────────────────────────────────────

fn page_of(bytes: &[u8]) -> usize {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.strip_prefix("page-"))
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

fn body(source: &str, page: usize) -> String {
    format!("{source} पाठ: पृष्ठ {page} पर सामान्य हिंदी अनुच्छेद लिखा है।")
}

/// Counts concurrent entries and remembers the maximum.
#[derive(Default)]
struct Gauge {
    active: AtomicUsize,
    peak: AtomicUsize,
}

struct GaugeGuard<'a>(&'a Gauge);

impl Gauge {
    fn enter(&self) -> GaugeGuard<'_> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        GaugeGuard(self)
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct FakePdf {
    pages: usize,
    broken: HashSet<usize>,
    panic_on: HashSet<usize>,
    renders: AtomicUsize,
    reclaims: AtomicUsize,
}

impl FakePdf {
    fn new(pages: usize) -> Self {
        Self {
            pages,
            ..Default::default()
        }
    }

    fn renders(&self) -> usize {
        self.renders.load(Ordering::SeqCst)
    }

    fn reclaims(&self) -> usize {
        self.reclaims.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageRasterizer for FakePdf {
    async fn page_count(&self, _document: &Path) -> Result<usize, OcrError> {
        Ok(self.pages)
    }

    async fn rasterize(
        &self,
        _document: &Path,
        page: usize,
    ) -> Result<Vec<u8>, ocr_hindi::PageError> {
        self.renders.fetch_add(1, Ordering::SeqCst);
        if self.panic_on.contains(&page) {
            panic!("renderer crashed on page {page}");
        }
        if self.broken.contains(&page) {
            return Err(ocr_hindi::PageError::RenderFailed {
                page,
                detail: "corrupt page object".into(),
            });
        }
        Ok(format!("page-{page}").into_bytes())
    }

    fn reclaim(&self) {
        self.reclaims.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct FakeLocal {
    low_confidence: HashSet<usize>,
    mantra: HashSet<usize>,
    broken: HashSet<usize>,
    calls: AtomicUsize,
}

impl LocalEngine for FakeLocal {
    fn name(&self) -> &str {
        "fake-tesseract"
    }

    fn process(&self, image: &Path, _cancel: &CancellationToken) -> LocalOutput {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let page = std::fs::read(image).map(|b| page_of(&b)).unwrap_or(0);
        if self.broken.contains(&page) {
            return LocalOutput::failed("tesseract exited with status 1");
        }
        let text = if self.mantra.contains(&page) {
            format!("ॐ नमः शिवाय, पृष्ठ {page} पर जप का विधान लिखा है")
        } else {
            body("स्थानीय", page)
        };
        let confidence = if self.low_confidence.contains(&page) {
            0.42
        } else {
            0.97
        };
        LocalOutput::ok(text, confidence)
    }
}

/// Blocks its thread for `hold` on the listed pages and ignores
/// cancellation, like a wedged OCR binary.
#[derive(Default)]
struct WedgedLocal {
    wedged: HashSet<usize>,
    hold: Duration,
    gauge: Gauge,
}

impl LocalEngine for WedgedLocal {
    fn name(&self) -> &str {
        "wedged-tesseract"
    }

    fn process(&self, image: &Path, _cancel: &CancellationToken) -> LocalOutput {
        let _active = self.gauge.enter();
        let page = std::fs::read(image).map(|b| page_of(&b)).unwrap_or(0);
        if self.wedged.contains(&page) {
            std::thread::sleep(self.hold);
        }
        LocalOutput::ok(body("स्थानीय", page), 0.97)
    }
}

#[derive(Default)]
struct FakeRemote {
    refuse: Mutex<HashSet<usize>>,
    transient_left: AtomicUsize,
    slow: HashSet<usize>,
    delay: Duration,
    calls: AtomicUsize,
    gauge: Gauge,
}

impl FakeRemote {
    fn refusing(pages: &[usize]) -> Self {
        Self {
            refuse: Mutex::new(pages.iter().copied().collect()),
            ..Default::default()
        }
    }

    fn stop_refusing(&self) {
        self.refuse.lock().unwrap().clear();
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteEngine for FakeRemote {
    fn name(&self) -> &str {
        "fake-vision"
    }

    async fn transcribe(
        &self,
        png: &[u8],
        _options: &RemoteOptions,
    ) -> Result<RemoteOutput, RemoteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _active = self.gauge.enter();
        let page = page_of(png);

        let delay = if self.slow.contains(&page) {
            Duration::from_secs(5)
        } else {
            self.delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let throttled = self
            .transient_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if throttled {
            return Err(RemoteError::Transient {
                detail: "503 Service Unavailable".into(),
                quota: false,
            });
        }
        if self.refuse.lock().unwrap().contains(&page) {
            return Ok(RemoteOutput {
                text: "I'm sorry, I cannot read this image clearly.".into(),
                usage: Usage::default(),
            });
        }
        Ok(RemoteOutput {
            text: format!("```text\n{}\n```", body("दूरस्थ", page)),
            usage: Usage {
                input_tokens: 1200,
                output_tokens: 300,
            },
        })
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn write_pdf(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("granth.pdf");
    std::fs::write(&path, b"%PDF-1.4\n% fake\n").unwrap();
    path
}

fn base(engine: EngineSelector) -> PipelineConfigBuilder {
    PipelineConfig::builder()
        .engine(engine)
        .concurrency(3)
        .requests_per_minute(60_000)
        .retry_backoff_ms(5)
        .max_retries(2)
        .page_timeout(Some(Duration::from_secs(10)))
        .shutdown_grace(Some(Duration::from_secs(10)))
}

fn engines(
    pdf: &Arc<FakePdf>,
    local: Option<&Arc<FakeLocal>>,
    remote: Option<&Arc<FakeRemote>>,
) -> Engines {
    Engines {
        rasterizer: Arc::clone(pdf) as Arc<dyn PageRasterizer>,
        local: local.map(|l| Arc::clone(l) as Arc<dyn LocalEngine>),
        remote: remote.map(|r| Arc::clone(r) as Arc<dyn RemoteEngine>),
    }
}

fn finished(outcome: RunOutcome) -> RunSummary {
    match outcome {
        RunOutcome::Finished(summary) => summary,
        other => panic!("expected a finished run, got {other:?}"),
    }
}

async fn run_with(
    path: &Path,
    config: &PipelineConfig,
    engines: Engines,
    progress: ProgressCallback,
    shutdown: &ShutdownCoordinator,
) -> RunSummary {
    let outcome = assert_ok!(run(path.to_str().unwrap(), config, engines, progress, shutdown).await);
    finished(outcome)
}

async fn run_ok(path: &Path, config: &PipelineConfig, engines: Engines) -> RunSummary {
    run_with(
        path,
        config,
        engines,
        Arc::new(NoopProgressCallback),
        &ShutdownCoordinator::new(),
    )
    .await
}

async fn cache_for(path: &Path) -> ResultCache {
    ResultCache::open(ResultCache::default_dir(path)).await.unwrap()
}

async fn progress_for(path: &Path) -> ProgressTracker {
    ProgressTracker::load_or_fresh(ProgressTracker::default_path(path), "granth.pdf", 0, &[])
        .await
        .unwrap()
}

/// COMPLETED in the progress record exactly when a cache entry exists.
async fn assert_record_matches_cache(path: &Path, pages: &[usize]) {
    let cache = cache_for(path).await;
    let tracker = progress_for(path).await;
    for &page in pages {
        let completed = matches!(tracker.status(page), Some(PageStatus::Completed));
        assert_eq!(
            completed,
            cache.has(page).await,
            "page {page}: {:?}",
            tracker.status(page)
        );
    }
}

fn artifact(path: &Path) -> String {
    std::fs::read_to_string(path.with_file_name("granth_unicode.md")).unwrap()
}

// ── Routing ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn hybrid_escalates_for_every_reason_and_only_then() {
    let tmp = TempDir::new().unwrap();
    let path = write_pdf(&tmp);
    let pdf = Arc::new(FakePdf::new(6));
    let local = Arc::new(FakeLocal {
        low_confidence: [2].into(),
        mantra: [3].into(),
        broken: [4].into(),
        ..Default::default()
    });
    let remote = Arc::new(FakeRemote::default());
    let config = base(EngineSelector::Hybrid).build().unwrap();

    let s = run_ok(&path, &config, engines(&pdf, Some(&local), Some(&remote))).await;

    assert_eq!(s.completed, 6);
    assert!(s.failed.is_empty());
    assert_eq!(s.routing.local_accepted, 3);
    assert_eq!(s.routing.escalated_low_confidence, 1);
    assert_eq!(s.routing.escalated_mantra, 1);
    assert_eq!(s.routing.escalated_local_failed, 1);
    assert_eq!(s.routing.escalated_no_confidence, 0);
    assert_eq!(local.calls.load(Ordering::SeqCst), 6);
    assert_eq!(remote.calls(), 3);
    assert_eq!(s.usage.input_tokens, 3 * 1200);

    let cache = cache_for(&path).await;
    assert!(matches!(cache.meta(1).await.unwrap().route, Route::Local));
    assert!(matches!(
        cache.meta(2).await.unwrap().route,
        Route::Verified {
            reason: EscalationReason::LowConfidence { .. }
        }
    ));
    assert!(matches!(
        cache.meta(3).await.unwrap().route,
        Route::Verified {
            reason: EscalationReason::Mantra { .. }
        }
    ));
    assert!(matches!(
        cache.meta(4).await.unwrap().route,
        Route::Verified {
            reason: EscalationReason::LocalFailed
        }
    ));

    // Remote text is cleaned before it is cached.
    let page2 = cache.get(2).await.unwrap().unwrap();
    assert_eq!(page2, body("दूरस्थ", 2));
    assert_eq!(cache.get(1).await.unwrap().unwrap(), body("स्थानीय", 1));

    let out = artifact(&path);
    assert!(out.starts_with("# granth - OCR Output\nEngine: hybrid (fake-tesseract → fake-vision)\nPages: 6\n"));
    let positions: Vec<usize> = (1..=6)
        .map(|p| out.find(&format!("## Page {p}\n")).unwrap())
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn mantra_verification_can_be_disabled() {
    let tmp = TempDir::new().unwrap();
    let path = write_pdf(&tmp);
    let pdf = Arc::new(FakePdf::new(2));
    let local = Arc::new(FakeLocal {
        mantra: [1, 2].into(),
        ..Default::default()
    });
    let remote = Arc::new(FakeRemote::default());
    let config = base(EngineSelector::Hybrid)
        .mantra_verification(false)
        .build()
        .unwrap();

    let s = run_ok(&path, &config, engines(&pdf, Some(&local), Some(&remote))).await;
    assert_eq!(s.routing.local_accepted, 2);
    assert_eq!(remote.calls(), 0);
}

#[tokio::test]
async fn local_only_never_calls_remote() {
    let tmp = TempDir::new().unwrap();
    let path = write_pdf(&tmp);
    let pdf = Arc::new(FakePdf::new(4));
    let local = Arc::new(FakeLocal {
        low_confidence: [1].into(),
        broken: [2].into(),
        ..Default::default()
    });
    let config = base(EngineSelector::LocalOnly).build().unwrap();

    let s = run_ok(&path, &config, engines(&pdf, Some(&local), None)).await;
    assert_eq!(s.completed, 3);
    assert_eq!(s.routing.local_only, 3);
    assert_eq!(s.routing.escalated(), 0);
    assert_eq!(s.usage.calls, 0);
    assert!(s.failed[&2].contains("local engine failed"), "{:?}", s.failed);
    assert_eq!(s.engine, "fake-tesseract");
}

#[tokio::test]
async fn remote_only_sends_every_page() {
    let tmp = TempDir::new().unwrap();
    let path = write_pdf(&tmp);
    let pdf = Arc::new(FakePdf::new(3));
    let remote = Arc::new(FakeRemote::default());
    let config = base(EngineSelector::RemoteOnly).build().unwrap();

    let s = run_ok(&path, &config, engines(&pdf, None, Some(&remote))).await;
    assert_eq!(s.completed, 3);
    assert_eq!(s.routing.remote_only, 3);
    assert_eq!(s.usage.calls, 3);
    assert_eq!(s.usage.output_tokens, 900);
    assert!(s.usage.estimated_cost_usd > 0.0);
}

#[tokio::test]
async fn missing_engine_for_mode_is_fatal() {
    let tmp = TempDir::new().unwrap();
    let path = write_pdf(&tmp);
    let pdf = Arc::new(FakePdf::new(1));
    let local = Arc::new(FakeLocal::default());
    let config = base(EngineSelector::Hybrid).build().unwrap();

    let err = run(
        path.to_str().unwrap(),
        &config,
        engines(&pdf, Some(&local), None),
        Arc::new(NoopProgressCallback),
        &ShutdownCoordinator::new(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, OcrError::EngineUnavailable { .. }), "{err}");
    assert_eq!(pdf.renders(), 0);
}

// ── Page selection and dry run ───────────────────────────────────────────────

#[tokio::test]
async fn page_selection_limits_the_run() {
    let tmp = TempDir::new().unwrap();
    let path = write_pdf(&tmp);
    let pdf = Arc::new(FakePdf::new(10));
    let local = Arc::new(FakeLocal::default());
    let config = base(EngineSelector::LocalOnly)
        .pages(PageSelection::parse("2-4,9").unwrap())
        .build()
        .unwrap();

    let s = run_ok(&path, &config, engines(&pdf, Some(&local), None)).await;
    assert_eq!(s.requested, 4);
    assert_eq!(s.completed, 4);

    let cache = cache_for(&path).await;
    assert_eq!(cache.list_indices().await.unwrap(), vec![2, 3, 4, 9]);
}

#[tokio::test]
async fn dry_run_touches_no_engine() {
    let tmp = TempDir::new().unwrap();
    let path = write_pdf(&tmp);
    let pdf = Arc::new(FakePdf::new(5));
    let local = Arc::new(FakeLocal::default());
    let remote = Arc::new(FakeRemote::default());
    let config = base(EngineSelector::Hybrid).dry_run(true).build().unwrap();

    let outcome = run(
        path.to_str().unwrap(),
        &config,
        engines(&pdf, Some(&local), Some(&remote)),
        Arc::new(NoopProgressCallback),
        &ShutdownCoordinator::new(),
    )
    .await
    .unwrap();

    let plan = match outcome {
        RunOutcome::Planned(plan) => plan,
        other => panic!("expected a plan, got {other:?}"),
    };
    assert_eq!(plan.pending, vec![1, 2, 3, 4, 5]);
    assert_eq!(plan.max_remote_pages, 5);
    assert!(plan.estimated_cost_usd > 0.0);
    assert_eq!(pdf.renders(), 0);
    assert_eq!(local.calls.load(Ordering::SeqCst), 0);
    assert_eq!(remote.calls(), 0);
    assert!(!ProgressTracker::default_path(&path).exists());
    assert!(!path.with_file_name("granth_unicode.md").exists());
}

// ── Concurrency ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn never_more_than_n_pages_in_flight() {
    let tmp = TempDir::new().unwrap();
    let path = write_pdf(&tmp);
    let pdf = Arc::new(FakePdf::new(12));
    let remote = Arc::new(FakeRemote {
        delay: Duration::from_millis(40),
        ..Default::default()
    });
    let config = base(EngineSelector::RemoteOnly)
        .concurrency(3)
        .build()
        .unwrap();

    let s = run_ok(&path, &config, engines(&pdf, None, Some(&remote))).await;
    assert_eq!(s.completed, 12);
    assert!(s.peak_in_flight <= 3, "peak {}", s.peak_in_flight);
    assert!(remote.gauge.peak() <= 3, "remote peak {}", remote.gauge.peak());
    assert!(remote.gauge.peak() >= 2, "workers never overlapped");
}

// ── Failure isolation ────────────────────────────────────────────────────────

#[tokio::test]
async fn transient_errors_are_retried() {
    let tmp = TempDir::new().unwrap();
    let path = write_pdf(&tmp);
    let pdf = Arc::new(FakePdf::new(1));
    let remote = Arc::new(FakeRemote {
        transient_left: AtomicUsize::new(2),
        ..Default::default()
    });
    let config = base(EngineSelector::RemoteOnly).max_retries(2).build().unwrap();

    let s = run_ok(&path, &config, engines(&pdf, None, Some(&remote))).await;
    assert_eq!(s.completed, 1);
    assert_eq!(s.usage.calls, 3);
    assert_eq!(s.usage.failed_calls, 2);
}

#[tokio::test]
async fn exhausted_retries_fail_only_that_page() {
    let tmp = TempDir::new().unwrap();
    let path = write_pdf(&tmp);
    let pdf = Arc::new(FakePdf::new(2));
    let remote = Arc::new(FakeRemote {
        transient_left: AtomicUsize::new(3),
        ..Default::default()
    });
    let config = base(EngineSelector::RemoteOnly)
        .concurrency(1)
        .max_retries(2)
        .build()
        .unwrap();

    let s = run_ok(&path, &config, engines(&pdf, None, Some(&remote))).await;
    assert_eq!(s.completed, 1);
    assert!(s.failed[&1].contains("after 2 retries"), "{:?}", s.failed);
    assert!(cache_for(&path).await.has(2).await);
}

#[tokio::test]
async fn rejected_output_is_failed_not_cached() {
    let tmp = TempDir::new().unwrap();
    let path = write_pdf(&tmp);
    let pdf = Arc::new(FakePdf::new(3));
    let remote = Arc::new(FakeRemote::refusing(&[2]));
    let config = base(EngineSelector::RemoteOnly).build().unwrap();

    let s = run_ok(&path, &config, engines(&pdf, None, Some(&remote))).await;
    assert_eq!(s.completed, 2);
    assert!(s.failed[&2].contains("output rejected"), "{:?}", s.failed);

    assert!(!cache_for(&path).await.has(2).await);
    let tracker = progress_for(&path).await;
    assert!(matches!(tracker.status(2), Some(PageStatus::Failed { .. })));
    assert_eq!(tracker.status(1), Some(&PageStatus::Completed));
    assert!(!artifact(&path).contains("## Page 2"));
}

#[tokio::test]
async fn panics_and_render_failures_are_isolated() {
    let tmp = TempDir::new().unwrap();
    let path = write_pdf(&tmp);
    let pdf = Arc::new(FakePdf {
        pages: 5,
        panic_on: [2].into(),
        broken: [3].into(),
        ..Default::default()
    });
    let local = Arc::new(FakeLocal::default());
    let config = base(EngineSelector::LocalOnly).build().unwrap();

    let s = run_ok(&path, &config, engines(&pdf, Some(&local), None)).await;
    assert_eq!(s.completed, 3);
    assert!(s.failed[&2].contains("panicked"), "{:?}", s.failed);
    assert!(s.failed[&3].contains("rasterisation failed"), "{:?}", s.failed);
}

#[tokio::test]
async fn slow_page_times_out_alone() {
    let tmp = TempDir::new().unwrap();
    let path = write_pdf(&tmp);
    let pdf = Arc::new(FakePdf::new(3));
    let remote = Arc::new(FakeRemote {
        slow: [2].into(),
        ..Default::default()
    });
    let config = base(EngineSelector::RemoteOnly)
        .page_timeout(Some(Duration::from_millis(300)))
        .build()
        .unwrap();

    let started = Instant::now();
    let s = run_ok(&path, &config, engines(&pdf, None, Some(&remote))).await;
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(s.completed, 2);
    assert!(s.failed[&2].contains("timed out"), "{:?}", s.failed);
    assert_record_matches_cache(&path, &[1, 2, 3]).await;
}

#[tokio::test]
async fn timed_out_local_work_keeps_its_worker_slot() {
    let tmp = TempDir::new().unwrap();
    let path = write_pdf(&tmp);
    let pdf = Arc::new(FakePdf::new(4));
    let local = Arc::new(WedgedLocal {
        wedged: [1, 2, 3].into(),
        hold: Duration::from_millis(400),
        ..Default::default()
    });
    let config = base(EngineSelector::LocalOnly)
        .concurrency(1)
        .page_timeout(Some(Duration::from_millis(100)))
        .build()
        .unwrap();

    let engines = Engines {
        rasterizer: Arc::clone(&pdf) as Arc<dyn PageRasterizer>,
        local: Some(Arc::clone(&local) as Arc<dyn LocalEngine>),
        remote: None,
    };
    let s = run_ok(&path, &config, engines).await;

    assert_eq!(local.gauge.peak(), 1, "engine calls overlapped");
    assert_eq!(s.completed, 1);
    for page in [1, 2, 3] {
        assert!(s.failed[&page].contains("timed out"), "{:?}", s.failed);
    }
    assert!(cache_for(&path).await.has(4).await);
    assert_record_matches_cache(&path, &[1, 2, 3, 4]).await;
}

#[tokio::test]
async fn reclaim_runs_on_its_cadence() {
    let tmp = TempDir::new().unwrap();
    let path = write_pdf(&tmp);
    let pdf = Arc::new(FakePdf::new(5));
    let local = Arc::new(FakeLocal::default());
    let config = base(EngineSelector::LocalOnly)
        .reclaim_every(2)
        .build()
        .unwrap();

    let s = run_ok(&path, &config, engines(&pdf, Some(&local), None)).await;
    assert_eq!(s.completed, 5);
    // After pages 2 and 4, then once at the end of the run.
    assert_eq!(pdf.reclaims(), 3);
}

#[tokio::test]
async fn zero_completed_pages_is_an_error() {
    let tmp = TempDir::new().unwrap();
    let path = write_pdf(&tmp);
    let pdf = Arc::new(FakePdf::new(2));
    let remote = Arc::new(FakeRemote::refusing(&[1, 2]));
    let config = base(EngineSelector::RemoteOnly).build().unwrap();

    let err = run(
        path.to_str().unwrap(),
        &config,
        engines(&pdf, None, Some(&remote)),
        Arc::new(NoopProgressCallback),
        &ShutdownCoordinator::new(),
    )
    .await
    .unwrap_err();
    match err {
        OcrError::AllPagesFailed { total, first_error } => {
            assert_eq!(total, 2);
            assert!(first_error.contains("output rejected"), "{first_error}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

// ── Resume ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn resume_skips_cached_and_failed_then_retries_on_request() {
    let tmp = TempDir::new().unwrap();
    let path = write_pdf(&tmp);
    let pdf = Arc::new(FakePdf::new(4));
    let remote = Arc::new(FakeRemote::refusing(&[2]));

    let first = base(EngineSelector::RemoteOnly).build().unwrap();
    let s = run_ok(&path, &first, engines(&pdf, None, Some(&remote))).await;
    assert_eq!(s.completed, 3);
    assert_eq!(pdf.renders(), 4);

    let resume = base(EngineSelector::RemoteOnly).resume(true).build().unwrap();
    let s = run_ok(&path, &resume, engines(&pdf, None, Some(&remote))).await;
    assert_eq!(s.previously_cached, 3);
    assert_eq!(s.processed, 0);
    assert_eq!(s.skipped_failed, vec![2]);
    assert_eq!(pdf.renders(), 4);

    remote.stop_refusing();
    let retry = base(EngineSelector::RemoteOnly)
        .resume(true)
        .retry_failed(true)
        .build()
        .unwrap();
    let s = run_ok(&path, &retry, engines(&pdf, None, Some(&remote))).await;
    assert_eq!(s.processed, 1);
    assert_eq!(s.completed, 4);
    assert!(s.is_complete());
    assert_eq!(pdf.renders(), 5);

    // Same bytes as a clean, uninterrupted run.
    let clean_tmp = TempDir::new().unwrap();
    let clean_path = write_pdf(&clean_tmp);
    let clean_pdf = Arc::new(FakePdf::new(4));
    let clean_remote = Arc::new(FakeRemote::default());
    run_ok(&clean_path, &first, engines(&clean_pdf, None, Some(&clean_remote))).await;
    assert_eq!(artifact(&path), artifact(&clean_path));
}

#[tokio::test]
async fn fresh_run_trusts_cache_and_retries_failures() {
    let tmp = TempDir::new().unwrap();
    let path = write_pdf(&tmp);
    let pdf = Arc::new(FakePdf::new(3));
    let remote = Arc::new(FakeRemote::refusing(&[3]));
    let config = base(EngineSelector::RemoteOnly).build().unwrap();

    run_ok(&path, &config, engines(&pdf, None, Some(&remote))).await;
    remote.stop_refusing();
    let s = run_ok(&path, &config, engines(&pdf, None, Some(&remote))).await;

    assert_eq!(s.previously_cached, 2);
    assert_eq!(s.processed, 1);
    assert_eq!(s.completed, 3);
    assert_eq!(pdf.renders(), 4);
}

#[tokio::test]
async fn corrupt_progress_record_is_fatal_on_resume() {
    let tmp = TempDir::new().unwrap();
    let path = write_pdf(&tmp);
    std::fs::write(ProgressTracker::default_path(&path), "{ truncated").unwrap();
    let pdf = Arc::new(FakePdf::new(2));
    let local = Arc::new(FakeLocal::default());
    let config = base(EngineSelector::LocalOnly).resume(true).build().unwrap();

    let err = run(
        path.to_str().unwrap(),
        &config,
        engines(&pdf, Some(&local), None),
        Arc::new(NoopProgressCallback),
        &ShutdownCoordinator::new(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, OcrError::StateCorrupt { .. }), "{err}");
}

// ── Shutdown ─────────────────────────────────────────────────────────────────

/// Requests shutdown once `after` pages have completed.
struct StopAfter {
    shutdown: Arc<ShutdownCoordinator>,
    after: usize,
    completed: AtomicUsize,
    shutdowns: AtomicUsize,
}

impl StopAfter {
    fn new(shutdown: &Arc<ShutdownCoordinator>, after: usize) -> Arc<Self> {
        Arc::new(Self {
            shutdown: Arc::clone(shutdown),
            after,
            completed: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
        })
    }
}

impl OcrProgressCallback for StopAfter {
    fn on_page_complete(&self, _page: usize, _total: usize, _route: &Route, _chars: usize) {
        if self.completed.fetch_add(1, Ordering::SeqCst) + 1 == self.after {
            self.shutdown.request("test");
        }
    }

    fn on_shutdown(&self, _in_flight: usize) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn shutdown_drains_in_flight_and_still_merges() {
    let tmp = TempDir::new().unwrap();
    let path = write_pdf(&tmp);
    let pdf = Arc::new(FakePdf::new(10));
    let remote = Arc::new(FakeRemote {
        delay: Duration::from_millis(60),
        ..Default::default()
    });
    let config = base(EngineSelector::RemoteOnly)
        .concurrency(2)
        .build()
        .unwrap();

    let shutdown = Arc::new(ShutdownCoordinator::new());
    let callback = StopAfter::new(&shutdown, 1);
    let s = run_with(
        &path,
        &config,
        engines(&pdf, None, Some(&remote)),
        Arc::clone(&callback) as ProgressCallback,
        &shutdown,
    )
    .await;

    assert!(s.cancelled);
    assert_eq!(callback.shutdowns.load(Ordering::SeqCst), 1);
    assert!(s.abandoned.is_empty(), "grace was generous: {:?}", s.abandoned);
    assert!(s.completed >= 1 && s.completed < 10, "completed {}", s.completed);
    assert!(!s.not_started.is_empty());
    assert_eq!(s.completed + s.not_started.len(), 10);
    assert!(s.artifact.written);
    assert_eq!(s.artifact.pages_merged, s.completed);

    let tracker = progress_for(&path).await;
    assert_eq!(tracker.counts().in_progress, 0);

    let resume = base(EngineSelector::RemoteOnly).resume(true).build().unwrap();
    let s = run_ok(&path, &resume, engines(&pdf, None, Some(&remote))).await;
    assert_eq!(s.completed, 10);
    assert!(artifact(&path).contains("Pages: 10\n"));
}

#[tokio::test]
async fn grace_expiry_abandons_stuck_pages() {
    let tmp = TempDir::new().unwrap();
    let path = write_pdf(&tmp);
    let pdf = Arc::new(FakePdf::new(6));
    let remote = Arc::new(FakeRemote {
        slow: [3].into(),
        delay: Duration::from_millis(20),
        ..Default::default()
    });
    let config = base(EngineSelector::RemoteOnly)
        .concurrency(2)
        .shutdown_grace(Some(Duration::from_millis(200)))
        .build()
        .unwrap();

    // Pages 1 and 2 start together; the first to finish frees a slot for
    // the stuck page 3, the second requests shutdown.
    let shutdown = Arc::new(ShutdownCoordinator::new());
    let started = Instant::now();
    let s = run_with(
        &path,
        &config,
        engines(&pdf, None, Some(&remote)),
        StopAfter::new(&shutdown, 2) as ProgressCallback,
        &shutdown,
    )
    .await;

    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(s.cancelled);
    assert_eq!(s.abandoned, vec![3]);
    assert_eq!(s.completed, 2);
    assert_eq!(s.not_started, vec![4, 5, 6]);

    // Left IN_PROGRESS on disk; the next run puts it back to PENDING.
    let tracker = progress_for(&path).await;
    assert_eq!(tracker.status(3), Some(&PageStatus::InProgress));

    let resume = base(EngineSelector::RemoteOnly).resume(true).build().unwrap();
    let quick = Arc::new(FakeRemote::default());
    let s = run_ok(&path, &resume, engines(&pdf, None, Some(&quick))).await;
    assert_eq!(s.completed, 6);
    assert_eq!(quick.calls(), 4);
}

// ── Scratch files ────────────────────────────────────────────────────────────

#[tokio::test]
async fn scheduler_leaves_no_page_images_behind() {
    let tmp = TempDir::new().unwrap();
    let path = write_pdf(&tmp);
    let pdf = Arc::new(FakePdf {
        pages: 6,
        panic_on: [3].into(),
        ..Default::default()
    });
    let local = Arc::new(FakeLocal {
        low_confidence: [4, 5].into(),
        ..Default::default()
    });
    let remote = Arc::new(FakeRemote::refusing(&[5]));
    let config = base(EngineSelector::Hybrid).build().unwrap();

    let router = Arc::new(
        Router::new(
            &config,
            Some(Arc::clone(&local) as Arc<dyn LocalEngine>),
            Some(Arc::clone(&remote) as Arc<dyn RemoteEngine>),
        )
        .unwrap(),
    );
    let cache = ResultCache::open(tmp.path().join("cache")).await.unwrap();
    let pages: Vec<usize> = (1..=6).collect();
    let tracker = Arc::new(tokio::sync::Mutex::new(ProgressTracker::fresh(
        tmp.path().join("progress.json"),
        "granth.pdf",
        6,
        &pages,
    )));
    let scratch = Arc::new(ScratchDir::new_in(tmp.path()).unwrap());

    let scheduler = Arc::new(Scheduler::new(
        &path,
        Arc::clone(&pdf) as Arc<dyn PageRasterizer>,
        router,
        cache,
        tracker,
        Arc::clone(&scratch),
        Arc::new(NoopProgressCallback),
        SchedulerOptions::from_config(&config),
    ));
    let report = scheduler.run(pages, CancellationToken::new()).await;

    assert_eq!(report.completed, BTreeSet::from([1, 2, 4, 6]));
    assert_eq!(report.failed.keys().copied().collect::<Vec<_>>(), vec![3, 5]);
    assert_eq!(scratch.live_count(), 0);
    assert_eq!(scratch.file_count(), 0);
}
