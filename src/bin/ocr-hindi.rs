//! CLI binary for ocr-hindi.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `PipelineConfig`, installs the signal listener and prints results.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use ocr_hindi::config::{MAX_DPI, MIN_DPI};
use ocr_hindi::pipeline::router::Route;
use ocr_hindi::{
    run, EngineSelector, Engines, ImageResolution, OcrError, OcrProgressCallback, PageSelection,
    PipelineConfig, ProgressCallback, ReasoningEffort, RunOutcome, RunPlan, RunSummary,
    ShutdownCoordinator,
};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: a live bar plus one log line per page.
/// Pages complete out of order, so start times are keyed by page.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<usize, Instant>>,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Reconciling cache…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            errors: AtomicUsize::new(0),
        })
    }

    fn activate_bar(&self, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("OCR");
        self.bar.reset_eta();
    }

    fn elapsed_secs(&self, page: usize) -> f64 {
        self.start_times
            .lock()
            .unwrap()
            .remove(&page)
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl OcrProgressCallback for CliProgressCallback {
    fn on_run_start(&self, pending: usize, requested: usize) {
        self.activate_bar(pending);
        let cached = requested.saturating_sub(pending);
        self.bar.println(format!(
            "{} {}  {}",
            cyan("◆"),
            bold(&format!("Processing {pending} pages…")),
            dim(&format!("({cached} of {requested} already cached)")),
        ));
    }

    fn on_page_start(&self, page: usize, _total: usize) {
        self.start_times
            .lock()
            .unwrap()
            .insert(page, Instant::now());
        self.bar.set_message(format!("page {page}"));
    }

    fn on_page_complete(&self, page: usize, _total: usize, route: &Route, chars: usize) {
        let secs = self.elapsed_secs(page);
        let route = match route {
            Route::Verified { .. } => yellow(&route.to_string()),
            _ => dim(&route.to_string()),
        };
        self.bar.println(format!(
            "  {} Page {:>4}  {:<8}  {}  {}",
            green("✓"),
            page,
            dim(&format!("{chars:>5} chars")),
            route,
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_page_error(&self, page: usize, _total: usize, error: &str) {
        let secs = self.elapsed_secs(page);
        self.errors.fetch_add(1, Ordering::SeqCst);

        let msg: String = if error.chars().count() > 80 {
            let head: String = error.chars().take(79).collect();
            format!("{head}\u{2026}")
        } else {
            error.to_string()
        };

        self.bar.println(format!(
            "  {} Page {:>4}  {}  {}",
            red("✗"),
            page,
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_shutdown(&self, in_flight: usize) {
        self.bar.println(format!(
            "{} {}",
            yellow("■"),
            bold(&format!(
                "Shutdown requested: finishing {in_flight} in-flight pages, then merging…"
            )),
        ));
        self.bar.set_prefix("Stopping");
    }

    fn on_run_complete(&self, completed: usize, failed: usize) {
        self.bar.finish_and_clear();
        let errors = self.errors.load(Ordering::SeqCst).max(failed);
        if errors == 0 {
            eprintln!("{} {} pages processed", green("✔"), bold(&completed.to_string()));
        } else {
            eprintln!(
                "{} {} pages processed  ({} failed)",
                cyan("⚠"),
                bold(&completed.to_string()),
                red(&errors.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Hybrid OCR (Tesseract first, vision model for doubtful pages)
  ocr-hindi granth.pdf

  # Free, local-only run
  ocr-hindi --engine local granth.pdf

  # Every page through the vision model, specific pages
  ocr-hindi --engine remote --pages 1-20 granth.pdf -o granth.md

  # Preview what would be processed and what it would cost
  ocr-hindi --dry-run --resume granth.pdf

  # Continue an interrupted run, retrying pages that failed
  ocr-hindi --resume --retry-failed granth.pdf

  # Stricter escalation, no mantra-based escalation
  ocr-hindi --threshold 0.92 --no-mantra-verify granth.pdf

ENGINES:
  hybrid   tesseract on every page; escalate on failure, no confidence,
           confidence < threshold, or mantra content (default)
  local    tesseract only, zero API cost
  remote   vision model on every page

FILES (beside the PDF, or the working directory for URLs):
  <stem>_unicode.md           merged output
  .ocr_cache_<stem>/          one committed entry per page
  .ocr_progress_<stem>.json   per-page state for --resume

  Ctrl+C / SIGTERM stops new pages, lets in-flight pages finish within
  the grace period, and still writes the merged output.

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Path to libpdfium
  RUST_LOG                Log filter (overrides -v / -q)

SETUP:
  1. Install tesseract with hin, san and eng language data
  2. Install pdfium or set PDFIUM_LIB_PATH
  3. For hybrid/remote: export GEMINI_API_KEY=… (or another provider key)
"#;

/// Resilient hybrid OCR for Hindi and Sanskrit PDFs.
#[derive(Parser, Debug)]
#[command(
    name = "ocr-hindi",
    version,
    about = "Resilient hybrid OCR for Hindi and Sanskrit PDFs",
    long_about = "OCR scanned Hindi and Sanskrit PDFs (local files or URLs) into Unicode Markdown. \
Tesseract handles clean pages for free; pages with low confidence or mantra content are \
verified by a vision LLM. Runs are resumable and shut down cleanly on Ctrl+C.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local PDF file path or HTTP/HTTPS URL.
    input: String,

    /// Merged output path (default: <stem>_unicode.md beside the PDF).
    #[arg(short, long, env = "OCR_HINDI_OUTPUT")]
    output: Option<PathBuf>,

    /// Backend mode.
    #[arg(long, env = "OCR_HINDI_ENGINE", value_enum, default_value = "hybrid")]
    engine: EngineArg,

    /// Page selection: all, 5, 3-15, or 1,3,5-7.
    #[arg(long, env = "OCR_HINDI_PAGES", default_value = "all")]
    pages: String,

    /// Concurrent page workers.
    #[arg(short, long, env = "OCR_HINDI_WORKERS", default_value_t = 5)]
    workers: usize,

    /// Local confidence below which hybrid mode escalates (0.0–1.0).
    #[arg(long, env = "OCR_HINDI_THRESHOLD", default_value_t = 0.85)]
    threshold: f32,

    /// Do not escalate pages just because they contain mantra content.
    #[arg(long, env = "OCR_HINDI_NO_MANTRA_VERIFY")]
    no_mantra_verify: bool,

    /// Continue a previous run from its progress record.
    #[arg(long, env = "OCR_HINDI_RESUME")]
    resume: bool,

    /// With --resume, process pages that FAILED last time again.
    #[arg(long, env = "OCR_HINDI_RETRY_FAILED", requires = "resume")]
    retry_failed: bool,

    /// Show what would be processed and the cost estimate; touch no engine.
    #[arg(long)]
    dry_run: bool,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Vision model ID (e.g. gemini-2.5-flash, gpt-4.1-mini).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// Reasoning budget for the remote model.
    #[arg(long, env = "OCR_HINDI_REASONING_EFFORT", value_enum, default_value = "low")]
    reasoning_effort: EffortArg,

    /// Image detail sent to the remote model.
    #[arg(long, env = "OCR_HINDI_IMAGE_RESOLUTION", value_enum, default_value = "high")]
    image_resolution: ResolutionArg,

    /// Sustained remote requests per minute (minimum 1).
    #[arg(long, env = "OCR_HINDI_RPM", default_value_t = 60)]
    rpm: u32,

    /// Rendering DPI (72–400).
    #[arg(long, env = "OCR_HINDI_DPI", default_value_t = 200,
          value_parser = clap::value_parser!(u32).range(MIN_DPI as i64..=MAX_DPI as i64))]
    dpi: u32,

    /// Retries per page for throttled or timed-out remote calls.
    #[arg(long, env = "OCR_HINDI_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Per-page time budget in seconds (0 disables).
    #[arg(long, env = "OCR_HINDI_PAGE_TIMEOUT", default_value_t = 300)]
    page_timeout: u64,

    /// Seconds in-flight pages get to finish after Ctrl+C (0 waits indefinitely).
    #[arg(long, env = "OCR_HINDI_GRACE", default_value_t = 30)]
    grace: u64,

    /// Cache directory (default: .ocr_cache_<stem> beside the PDF).
    #[arg(long, env = "OCR_HINDI_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "OCR_HINDI_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Print the run summary (or dry-run plan) as JSON on stdout.
    #[arg(long, env = "OCR_HINDI_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "OCR_HINDI_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "OCR_HINDI_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "OCR_HINDI_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum EngineArg {
    Hybrid,
    Local,
    Remote,
}

impl From<EngineArg> for EngineSelector {
    fn from(v: EngineArg) -> Self {
        match v {
            EngineArg::Hybrid => EngineSelector::Hybrid,
            EngineArg::Local => EngineSelector::LocalOnly,
            EngineArg::Remote => EngineSelector::RemoteOnly,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum EffortArg {
    Low,
    Medium,
    High,
}

impl From<EffortArg> for ReasoningEffort {
    fn from(v: EffortArg) -> Self {
        match v {
            EffortArg::Low => ReasoningEffort::Low,
            EffortArg::Medium => ReasoningEffort::Medium,
            EffortArg::High => ReasoningEffort::High,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ResolutionArg {
    Low,
    Medium,
    High,
}

impl From<ResolutionArg> for ImageResolution {
    fn from(v: ResolutionArg) -> Self {
        match v {
            ResolutionArg::Low => ImageResolution::Low,
            ResolutionArg::Medium => ImageResolution::Medium,
            ResolutionArg::High => ImageResolution::High,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar carries the per-page feedback, so library INFO logs
    // are muted while it is shown.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json && !cli.dry_run;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match execute(&cli, show_progress).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {:#}", red("error:"), e);
            if matches!(e.downcast_ref::<OcrError>(), Some(OcrError::AllPagesFailed { .. })) {
                eprintln!(
                    "{}",
                    dim("Fix the cause above, then re-run with --resume --retry-failed")
                );
            }
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: &Cli, show_progress: bool) -> Result<()> {
    let config = build_config(cli)?;
    let engines = Engines::from_config(&config).context("Engine preflight failed")?;

    let progress: ProgressCallback = if show_progress {
        CliProgressCallback::new_dynamic() as ProgressCallback
    } else {
        Arc::new(ocr_hindi::NoopProgressCallback) as ProgressCallback
    };

    let shutdown = Arc::new(ShutdownCoordinator::new());
    let listener = shutdown.listen();
    let outcome = run(&cli.input, &config, engines, progress, &shutdown).await;
    listener.abort();

    match outcome? {
        RunOutcome::Planned(plan) => report_plan(cli, &plan),
        RunOutcome::Finished(summary) => report_summary(cli, &summary),
    }
}

/// Map CLI args to `PipelineConfig`.
fn build_config(cli: &Cli) -> Result<PipelineConfig> {
    let pages = PageSelection::parse(&cli.pages).context("Invalid --pages")?;

    let secs = |s: u64| (s > 0).then(|| Duration::from_secs(s));

    let mut builder = PipelineConfig::builder()
        .engine(cli.engine.into())
        .pages(pages)
        .concurrency(cli.workers)
        .confidence_threshold(cli.threshold)
        .mantra_verification(!cli.no_mantra_verify)
        .resume(cli.resume)
        .retry_failed(cli.retry_failed)
        .dry_run(cli.dry_run)
        .reasoning_effort(cli.reasoning_effort.into())
        .image_resolution(cli.image_resolution.into())
        .requests_per_minute(cli.rpm)
        .dpi(cli.dpi)
        .max_retries(cli.max_retries)
        .page_timeout(secs(cli.page_timeout))
        .shutdown_grace(secs(cli.grace))
        .download_timeout_secs(cli.download_timeout);

    if let Some(ref dir) = cli.cache_dir {
        builder = builder.cache_dir(dir);
    }
    if let Some(ref out) = cli.output {
        builder = builder.output(out);
    }
    if let Some(ref model) = cli.model {
        builder = builder.model(model);
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider);
    }

    builder.build().context("Invalid configuration")
}

fn report_plan(cli: &Cli, plan: &RunPlan) -> Result<()> {
    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(plan).context("Failed to serialise plan")?
        );
        return Ok(());
    }
    println!("{}", bold("Dry run, nothing was processed"));
    println!("Document:     {} ({} pages)", plan.document, plan.total_pages);
    println!("Engine:       {}", plan.engine);
    println!("Requested:    {}", plan.requested.len());
    println!("Cached:       {}", plan.cached.len());
    if !plan.skipped_failed.is_empty() {
        println!(
            "Failed:       {} skipped {}",
            plan.skipped_failed.len(),
            dim("(add --retry-failed)")
        );
    }
    println!("To process:   {}", plan.pending.len());
    println!(
        "Est. cost:    ${:.4} {}",
        plan.estimated_cost_usd,
        dim(&format!("(at most {} remote pages)", plan.max_remote_pages))
    );
    println!("Est. time:    {:.1} min", plan.estimated_minutes);
    println!("Cache:        {}", plan.cache_dir.display());
    println!("Progress:     {}", plan.progress_file.display());
    println!("Output:       {}", plan.output.display());
    Ok(())
}

fn report_summary(cli: &Cli, s: &RunSummary) -> Result<()> {
    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(s).context("Failed to serialise summary")?
        );
        return Ok(());
    }
    if cli.quiet {
        return Ok(());
    }

    eprintln!(
        "{}  {}/{} pages  {}ms  →  {}",
        if s.is_complete() { green("✔") } else { cyan("⚠") },
        s.completed,
        s.requested,
        s.elapsed_ms,
        bold(&s.artifact.path.display().to_string()),
    );

    let r = &s.routing;
    if r.local_accepted + r.escalated() > 0 {
        eprintln!(
            "   routing: {} local  /  {} escalated {}",
            r.local_accepted,
            r.escalated(),
            dim(&format!(
                "(failed {}, no confidence {}, low confidence {}, mantra {})",
                r.escalated_local_failed,
                r.escalated_no_confidence,
                r.escalated_low_confidence,
                r.escalated_mantra
            )),
        );
    }
    if s.usage.calls > 0 {
        eprintln!(
            "   {} remote calls  {} tokens in  /  {} tokens out  ≈ ${:.4}",
            s.usage.calls,
            dim(&s.usage.input_tokens.to_string()),
            dim(&s.usage.output_tokens.to_string()),
            s.usage.estimated_cost_usd,
        );
    }
    if !s.failed.is_empty() {
        eprintln!("   {} pages failed:", red(&s.failed.len().to_string()));
        for (page, reason) in s.failed.iter().take(10) {
            eprintln!("     {} {}", dim(&format!("{page:>4}")), reason);
        }
        if s.failed.len() > 10 {
            eprintln!("     {}", dim(&format!("… and {} more", s.failed.len() - 10)));
        }
    }
    if s.cancelled {
        eprintln!(
            "   {} interrupted: {} abandoned, {} not started",
            yellow("■"),
            s.abandoned.len(),
            s.not_started.len()
        );
    }
    if s.resumable() {
        let hint = if s.failed.is_empty() && s.skipped_failed.is_empty() {
            "ocr-hindi --resume …"
        } else {
            "ocr-hindi --resume --retry-failed …"
        };
        eprintln!("   {} {}", dim("continue with:"), hint);
    }
    Ok(())
}
