//! Configuration types for a hybrid OCR run.
//!
//! Every knob lives in one immutable [`PipelineConfig`], built via its
//! [`PipelineConfigBuilder`]. The config is shared by reference into the
//! scheduler and every per-page task; nothing mutates it once a run starts.
//!
//! # Builder over constructor
//! Callers set only what they care about and rely on documented defaults for
//! the rest. Setters clamp into the legal range; [`PipelineConfigBuilder::build`]
//! rejects the few combinations clamping cannot repair.

use crate::error::OcrError;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on simultaneously in-flight pages.
pub const MAX_CONCURRENCY: usize = 20;

/// Accepted render resolution range.
pub const MIN_DPI: u32 = 72;
pub const MAX_DPI: u32 = 400;

/// Configuration for one OCR run over one document.
///
/// # Example
/// ```rust
/// use ocr_hindi::{EngineSelector, PipelineConfig};
///
/// let config = PipelineConfig::builder()
///     .engine(EngineSelector::Hybrid)
///     .confidence_threshold(0.9)
///     .concurrency(8)
///     .resume(true)
///     .build()
///     .unwrap();
/// assert_eq!(config.concurrency, 8);
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Minimum local confidence for a page to skip remote verification.
    /// Range: 0.0–1.0. Default: 0.85.
    ///
    /// 0.0 accepts every successful local page unless it contains a mantra;
    /// 1.0 escalates everything short of a perfect local score.
    pub confidence_threshold: f32,

    /// Escalate pages with bīja syllables or verse markers even when the
    /// local engine is confident. Default: true.
    pub mantra_verification: bool,

    /// Number of pages processed concurrently. Range: 1–20. Default: 5.
    ///
    /// A hard ceiling on in-flight pages. It bounds peak memory (one rendered
    /// page image per slot) and the burst rate against the remote API.
    pub concurrency: usize,

    /// Skip pages already present in the result cache. Default: false.
    pub resume: bool,

    /// On resume, also reprocess pages recorded as FAILED. Default: false.
    pub retry_failed: bool,

    /// Plan only: report what would be processed without calling any engine.
    pub dry_run: bool,

    /// Which backend path pages take. Default: [`EngineSelector::Hybrid`].
    pub engine: EngineSelector,

    /// Pages to process. Default: all pages.
    pub pages: PageSelection,

    /// Rasterisation DPI. Range: 72–600. Default: 200.
    ///
    /// Tesseract's Devanagari models are trained on ~300 DPI scans; 200 keeps
    /// the conjunct strokes legible while holding image sizes well under
    /// provider upload limits.
    pub dpi: u32,

    /// Parameters passed to the remote engine on every call.
    pub remote: RemoteOptions,

    /// Retry attempts on a transient remote failure. Default: 3.
    pub max_retries: u32,

    /// Base backoff delay in milliseconds, doubled per attempt. Default: 1000.
    pub retry_backoff_ms: u64,

    /// Remote requests allowed per minute across all workers. Default: 60.
    pub requests_per_minute: u32,

    /// Time budget for one page's full pipeline. Default: 300 s. `None` disables.
    pub page_timeout: Option<Duration>,

    /// How long in-flight pages may keep running after a shutdown request.
    /// Default: 30 s. `None` waits for them indefinitely.
    pub shutdown_grace: Option<Duration>,

    /// Run a reclamation pass every this many finished pages. Default: 10.
    pub reclaim_every: usize,

    /// Cache directory override. Default: `.ocr_cache_<stem>/` next to the document.
    pub cache_dir: Option<PathBuf>,

    /// Merged artifact override. Default: `<stem>_unicode.md` next to the document.
    pub output: Option<PathBuf>,

    /// LLM model identifier for the remote engine. If None, uses provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "gemini", "openai", "anthropic").
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.85,
            mantra_verification: true,
            concurrency: 5,
            resume: false,
            retry_failed: false,
            dry_run: false,
            engine: EngineSelector::default(),
            pages: PageSelection::default(),
            dpi: 200,
            remote: RemoteOptions::default(),
            max_retries: 3,
            retry_backoff_ms: 1000,
            requests_per_minute: 60,
            page_timeout: Some(Duration::from_secs(300)),
            shutdown_grace: Some(Duration::from_secs(30)),
            reclaim_every: 10,
            cache_dir: None,
            output: None,
            model: None,
            provider_name: None,
            provider: None,
            download_timeout_secs: 120,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("confidence_threshold", &self.confidence_threshold)
            .field("mantra_verification", &self.mantra_verification)
            .field("concurrency", &self.concurrency)
            .field("resume", &self.resume)
            .field("retry_failed", &self.retry_failed)
            .field("dry_run", &self.dry_run)
            .field("engine", &self.engine)
            .field("pages", &self.pages)
            .field("dpi", &self.dpi)
            .field("remote", &self.remote)
            .field("max_retries", &self.max_retries)
            .field("requests_per_minute", &self.requests_per_minute)
            .field("page_timeout", &self.page_timeout)
            .field("shutdown_grace", &self.shutdown_grace)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`PipelineConfig`].
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn confidence_threshold(mut self, t: f32) -> Self {
        self.config.confidence_threshold = if t.is_nan() { 0.85 } else { t.clamp(0.0, 1.0) };
        self
    }

    pub fn mantra_verification(mut self, v: bool) -> Self {
        self.config.mantra_verification = v;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.clamp(1, MAX_CONCURRENCY);
        self
    }

    pub fn resume(mut self, v: bool) -> Self {
        self.config.resume = v;
        self
    }

    pub fn retry_failed(mut self, v: bool) -> Self {
        self.config.retry_failed = v;
        self
    }

    pub fn dry_run(mut self, v: bool) -> Self {
        self.config.dry_run = v;
        self
    }

    pub fn engine(mut self, engine: EngineSelector) -> Self {
        self.config.engine = engine;
        self
    }

    pub fn pages(mut self, selection: PageSelection) -> Self {
        self.config.pages = selection;
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(MIN_DPI, MAX_DPI);
        self
    }

    pub fn reasoning_effort(mut self, effort: ReasoningEffort) -> Self {
        self.config.remote.reasoning_effort = effort;
        self
    }

    pub fn image_resolution(mut self, res: ImageResolution) -> Self {
        self.config.remote.image_resolution = res;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn requests_per_minute(mut self, rpm: u32) -> Self {
        self.config.requests_per_minute = rpm.max(1);
        self
    }

    pub fn page_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.page_timeout = timeout;
        self
    }

    pub fn shutdown_grace(mut self, grace: Option<Duration>) -> Self {
        self.config.shutdown_grace = grace;
        self
    }

    pub fn reclaim_every(mut self, pages: usize) -> Self {
        self.config.reclaim_every = pages.max(1);
        self
    }

    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.cache_dir = Some(dir.into());
        self
    }

    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.output = Some(path.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, OcrError> {
        let c = &self.config;
        if !(0.0..=1.0).contains(&c.confidence_threshold) {
            return Err(OcrError::InvalidConfig(format!(
                "confidence threshold must be 0.0–1.0, got {}",
                c.confidence_threshold
            )));
        }
        if c.concurrency == 0 || c.concurrency > MAX_CONCURRENCY {
            return Err(OcrError::InvalidConfig(format!(
                "concurrency must be 1–{MAX_CONCURRENCY}, got {}",
                c.concurrency
            )));
        }
        if c.retry_failed && !c.resume {
            return Err(OcrError::InvalidConfig(
                "--retry-failed only applies together with --resume".into(),
            ));
        }
        if matches!(c.page_timeout, Some(d) if d.is_zero()) {
            return Err(OcrError::InvalidConfig("page timeout must be > 0".into()));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Which backend path pages take. Chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineSelector {
    /// Local engine first, remote verification when the decision engine escalates. (default)
    #[default]
    Hybrid,
    /// Local engine only; zero monetary cost.
    LocalOnly,
    /// Remote engine for every page.
    RemoteOnly,
}

impl EngineSelector {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineSelector::Hybrid => "hybrid",
            EngineSelector::LocalOnly => "local",
            EngineSelector::RemoteOnly => "remote",
        }
    }

    /// Whether any page may reach the local engine.
    pub fn uses_local(&self) -> bool {
        !matches!(self, EngineSelector::RemoteOnly)
    }

    /// Whether any page may reach the remote engine.
    pub fn uses_remote(&self) -> bool {
        !matches!(self, EngineSelector::LocalOnly)
    }
}

impl fmt::Display for EngineSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much reasoning the remote model may spend per page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningEffort {
    /// Transcription needs little reasoning. (default)
    #[default]
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    /// Completion-token budget granted per call.
    ///
    /// Thinking tokens count against `max_tokens` on reasoning models, so the
    /// budget grows with the effort level.
    pub fn token_budget(&self) -> usize {
        match self {
            ReasoningEffort::Low => 4096,
            ReasoningEffort::Medium => 8192,
            ReasoningEffort::High => 16384,
        }
    }
}

/// Image resolution hint sent with the page image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageResolution {
    Low,
    Medium,
    /// Full tile budget; needed for matras and conjuncts. (default)
    #[default]
    High,
}

impl ImageResolution {
    /// The `detail` value understood by vision providers.
    pub fn detail(&self) -> &'static str {
        match self {
            ImageResolution::Low => "low",
            ImageResolution::Medium => "auto",
            ImageResolution::High => "high",
        }
    }
}

/// Per-call options for the remote engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RemoteOptions {
    pub reasoning_effort: ReasoningEffort,
    pub image_resolution: ImageResolution,
}

/// Specifies which pages of the document to process (1-indexed).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageSelection {
    /// Process all pages (default).
    #[default]
    All,
    /// A single page.
    Single(usize),
    /// A contiguous range, inclusive.
    Range(usize, usize),
    /// Several inclusive spans, sorted with overlaps merged. A lone page is
    /// the span `(p, p)`.
    Set(Vec<(usize, usize)>),
}

impl PageSelection {
    /// Parse the print-dialog style grammar: `all`, `5`, `1-50`, `1,5,10-20`.
    pub fn parse(spec: &str) -> Result<Self, OcrError> {
        let s = spec.trim().to_lowercase();
        let invalid = |reason: String| OcrError::InvalidPageSpec {
            input: spec.to_string(),
            reason,
        };

        if s == "all" {
            return Ok(PageSelection::All);
        }

        let mut spans = Vec::new();
        let mut parts = 0usize;
        let mut only = None;
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            parts += 1;
            if let Some((start, end)) = part.split_once('-') {
                let start: usize = start
                    .trim()
                    .parse()
                    .map_err(|_| invalid(format!("invalid range '{part}'")))?;
                let end: usize = end
                    .trim()
                    .parse()
                    .map_err(|_| invalid(format!("invalid range '{part}'")))?;
                if start < 1 {
                    return Err(invalid(format!("pages are 1-indexed, got {start}")));
                }
                if start > end {
                    return Err(invalid(format!("start ({start}) > end ({end})")));
                }
                only = Some(PageSelection::Range(start, end));
                spans.push((start, end));
            } else {
                let page: usize = part
                    .parse()
                    .map_err(|_| invalid(format!("invalid page number '{part}'")))?;
                if page < 1 {
                    return Err(invalid(format!("pages are 1-indexed, got {page}")));
                }
                only = Some(PageSelection::Single(page));
                spans.push((page, page));
            }
        }

        match (parts, only) {
            (0, _) | (_, None) => Err(invalid("no pages specified".into())),
            (1, Some(sel)) => Ok(sel),
            _ => Ok(PageSelection::Set(merge_spans(spans))),
        }
    }

    /// Expand into a sorted, deduplicated list of 1-based page numbers,
    /// rejecting any page beyond the document length. Bounds are checked
    /// on the spans before anything is expanded.
    pub fn to_pages(&self, total_pages: usize) -> Result<Vec<usize>, OcrError> {
        let spans = match self {
            PageSelection::All => vec![(1, total_pages)],
            PageSelection::Single(p) => vec![(*p, *p)],
            PageSelection::Range(start, end) => vec![(*start, *end)],
            PageSelection::Set(spans) => merge_spans(spans.clone()),
        };
        if let Some(page) = first_out_of_range(&spans, total_pages) {
            return Err(OcrError::PageOutOfRange {
                page,
                total: total_pages,
            });
        }
        Ok(spans
            .into_iter()
            .flat_map(|(start, end)| start..=end)
            .collect())
    }
}

/// Sort spans and merge the ones that overlap or touch.
fn merge_spans(mut spans: Vec<(usize, usize)>) -> Vec<(usize, usize)> {
    spans.sort_unstable();
    let mut merged: Vec<(usize, usize)> = Vec::with_capacity(spans.len());
    for (start, end) in spans {
        match merged.last_mut() {
            Some(last) if start <= last.1.saturating_add(1) => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }
    merged
}

/// The lowest requested page outside `1..=total`, if any. An empty
/// document reports page 0.
fn first_out_of_range(spans: &[(usize, usize)], total: usize) -> Option<usize> {
    if total == 0 {
        return Some(0);
    }
    spans.iter().find_map(|&(start, end)| {
        if start == 0 || start > end {
            Some(start)
        } else if end > total {
            Some(start.max(total + 1))
        } else {
            None
        }
    })
}

impl FromStr for PageSelection {
    type Err = OcrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PageSelection::parse(s)
    }
}
