//! Routing: the one place that decides which engines see a page.
//!
//! The engine selector is resolved once, at startup, into a closed set of
//! backends:
//!
//! ```text
//! Hybrid      local ──▶ decide ──▶ ACCEPT_LOCAL ─────────────────▶ text
//!                              └─▶ ESCALATE ──▶ remote (retried) ─▶ text
//! LocalOnly   local ───────────────────────────────────────────────▶ text
//! RemoteOnly  remote (retried) ────────────────────────────────────▶ text
//! ```
//!
//! The remote engine is given the page image only. In hybrid mode a remote
//! failure fails the page; local text that was judged untrustworthy is never
//! substituted for it.

use crate::config::{EngineSelector, PipelineConfig, RemoteOptions};
use crate::error::{OcrError, PageError};
use crate::pipeline::decision::{Decision, EscalationReason, HybridDecisionEngine};
use crate::pipeline::limiter::RateLimiter;
use crate::pipeline::local::{LocalEngine, LocalOutput};
use crate::pipeline::postprocess::clean_transcription;
use crate::pipeline::rasterize::PageImage;
use crate::pipeline::remote::{
    call_with_retry, RemoteEngine, RetryPolicy, Usage, UsageMeter, UsageSnapshot,
};
use crate::scheduler::WorkerLease;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The backend path a page took.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "route", rename_all = "snake_case")]
pub enum Route {
    /// Local text accepted as is.
    Local,
    /// Local pass ran, then the page was escalated to the remote engine.
    Verified { reason: EscalationReason },
    /// Remote engine only.
    Remote,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Local => f.write_str("local"),
            Route::Verified { reason } => write!(f, "verified ({reason})"),
            Route::Remote => f.write_str("remote"),
        }
    }
}

/// Text for one page plus how it was obtained.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    pub route: Route,
    /// Local confidence, when the local engine ran.
    pub confidence: Option<f32>,
    pub usage: Usage,
}

/// Remote engine plus everything needed to call it politely.
pub struct RemoteStage {
    engine: Arc<dyn RemoteEngine>,
    limiter: RateLimiter,
    policy: RetryPolicy,
    options: RemoteOptions,
}

impl RemoteStage {
    fn new(engine: Arc<dyn RemoteEngine>, config: &PipelineConfig) -> Self {
        let burst = config.concurrency.min(u32::MAX as usize) as u32;
        Self {
            engine,
            limiter: RateLimiter::new(config.requests_per_minute, burst),
            policy: RetryPolicy::from_config(config),
            options: config.remote,
        }
    }

    async fn call(
        &self,
        page: usize,
        image: &PageImage,
        meter: &UsageMeter,
    ) -> Result<(String, Usage), PageError> {
        let png = image.read_png().await.map_err(|e| PageError::RenderFailed {
            page,
            detail: format!("page image unreadable: {e}"),
        })?;
        let out = call_with_retry(
            self.engine.as_ref(),
            page,
            &png,
            &self.options,
            self.policy,
            &self.limiter,
            meter,
        )
        .await?;
        Ok((clean_transcription(&out.text), out.usage))
    }
}

/// Closed set of backend combinations.
pub enum Backends {
    Hybrid {
        local: Arc<dyn LocalEngine>,
        remote: RemoteStage,
        decision: HybridDecisionEngine,
    },
    LocalOnly {
        local: Arc<dyn LocalEngine>,
    },
    RemoteOnly {
        remote: RemoteStage,
    },
}

/// Routes pages through the configured backends and counts what happened.
pub struct Router {
    backends: Backends,
    stats: RoutingStats,
    meter: UsageMeter,
}

impl Router {
    /// Resolve `config.engine` against the engines that were supplied.
    pub fn new(
        config: &PipelineConfig,
        local: Option<Arc<dyn LocalEngine>>,
        remote: Option<Arc<dyn RemoteEngine>>,
    ) -> Result<Self, OcrError> {
        let missing = |engine: &str| OcrError::EngineUnavailable {
            engine: engine.to_string(),
            hint: format!("engine mode '{}' needs a {engine} engine", config.engine),
        };

        let backends = match config.engine {
            EngineSelector::Hybrid => Backends::Hybrid {
                local: local.ok_or_else(|| missing("local"))?,
                remote: RemoteStage::new(remote.ok_or_else(|| missing("remote"))?, config),
                decision: HybridDecisionEngine::new(
                    config.confidence_threshold,
                    config.mantra_verification,
                ),
            },
            EngineSelector::LocalOnly => Backends::LocalOnly {
                local: local.ok_or_else(|| missing("local"))?,
            },
            EngineSelector::RemoteOnly => Backends::RemoteOnly {
                remote: RemoteStage::new(remote.ok_or_else(|| missing("remote"))?, config),
            },
        };

        Ok(Self {
            backends,
            stats: RoutingStats::default(),
            meter: UsageMeter::new(),
        })
    }

    pub fn selector(&self) -> EngineSelector {
        match self.backends {
            Backends::Hybrid { .. } => EngineSelector::Hybrid,
            Backends::LocalOnly { .. } => EngineSelector::LocalOnly,
            Backends::RemoteOnly { .. } => EngineSelector::RemoteOnly,
        }
    }

    /// Human-readable engine description for logs and the output header.
    pub fn label(&self) -> String {
        match &self.backends {
            Backends::Hybrid { local, remote, .. } => {
                format!("hybrid ({} → {})", local.name(), remote.engine.name())
            }
            Backends::LocalOnly { local } => local.name().to_string(),
            Backends::RemoteOnly { remote } => remote.engine.name().to_string(),
        }
    }

    /// Transcribe one page image. `lease` is held by any blocking local work
    /// until that work returns.
    pub async fn process(
        &self,
        image: &PageImage,
        lease: &WorkerLease,
    ) -> Result<Transcript, PageError> {
        let page = image.page();
        match &self.backends {
            Backends::LocalOnly { local } => {
                let out = run_local(local, image, lease).await;
                if !out.success {
                    return Err(PageError::LocalFailed {
                        page,
                        detail: out.error.unwrap_or_else(|| "unknown error".into()),
                    });
                }
                self.stats.local_only.fetch_add(1, Ordering::Relaxed);
                Ok(Transcript {
                    text: out.text,
                    route: Route::Local,
                    confidence: out.confidence,
                    usage: Usage::default(),
                })
            }

            Backends::RemoteOnly { remote } => {
                let (text, usage) = remote.call(page, image, &self.meter).await?;
                self.stats.remote_only.fetch_add(1, Ordering::Relaxed);
                Ok(Transcript {
                    text,
                    route: Route::Remote,
                    confidence: None,
                    usage,
                })
            }

            Backends::Hybrid {
                local,
                remote,
                decision,
            } => {
                let out = run_local(local, image, lease).await;
                match decision.decide(&out) {
                    Decision::AcceptLocal => {
                        debug!("Page {}: local accepted ({:?})", page, out.confidence);
                        self.stats.local_accepted.fetch_add(1, Ordering::Relaxed);
                        Ok(Transcript {
                            text: out.text,
                            route: Route::Local,
                            confidence: out.confidence,
                            usage: Usage::default(),
                        })
                    }
                    Decision::Escalate(reason) => {
                        debug!("Page {}: escalating, {}", page, reason);
                        self.stats.record_escalation(&reason);
                        let (text, usage) = remote.call(page, image, &self.meter).await?;
                        Ok(Transcript {
                            text,
                            route: Route::Verified { reason },
                            confidence: out.confidence,
                            usage,
                        })
                    }
                }
            }
        }
    }

    pub fn stats(&self) -> RoutingSnapshot {
        self.stats.snapshot()
    }

    pub fn usage(&self) -> UsageSnapshot {
        self.meter.snapshot()
    }
}

/// Run the blocking local engine off the async workers and clean its text.
///
/// Dropping this future cancels the engine's token; the blocking closure
/// keeps its clone of `lease` until the engine actually returns.
async fn run_local(
    local: &Arc<dyn LocalEngine>,
    image: &PageImage,
    lease: &WorkerLease,
) -> LocalOutput {
    let engine = Arc::clone(local);
    let path = image.path().to_path_buf();
    let lease = lease.clone();
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();
    let blocking = tokio::task::spawn_blocking(move || {
        let _lease = lease;
        engine.process(&path, &cancel)
    });
    let mut out = match blocking.await {
        Ok(out) => out,
        Err(e) => LocalOutput::failed(format!("local engine panicked: {e}")),
    };
    if out.success {
        out.text = clean_transcription(&out.text);
    }
    out
}

// ── Statistics ───────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct RoutingStats {
    local_accepted: AtomicUsize,
    local_only: AtomicUsize,
    remote_only: AtomicUsize,
    escalated_local_failed: AtomicUsize,
    escalated_no_confidence: AtomicUsize,
    escalated_low_confidence: AtomicUsize,
    escalated_mantra: AtomicUsize,
}

impl RoutingStats {
    fn record_escalation(&self, reason: &EscalationReason) {
        let counter = match reason {
            EscalationReason::LocalFailed => &self.escalated_local_failed,
            EscalationReason::NoConfidence => &self.escalated_no_confidence,
            EscalationReason::LowConfidence { .. } => &self.escalated_low_confidence,
            EscalationReason::Mantra { .. } => &self.escalated_mantra,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> RoutingSnapshot {
        let load = |c: &AtomicUsize| c.load(Ordering::Relaxed);
        RoutingSnapshot {
            local_accepted: load(&self.local_accepted),
            local_only: load(&self.local_only),
            remote_only: load(&self.remote_only),
            escalated_local_failed: load(&self.escalated_local_failed),
            escalated_no_confidence: load(&self.escalated_no_confidence),
            escalated_low_confidence: load(&self.escalated_low_confidence),
            escalated_mantra: load(&self.escalated_mantra),
        }
    }
}

/// Routing counters for one run. Escalations are counted when decided,
/// whether or not the remote call then succeeded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RoutingSnapshot {
    pub local_accepted: usize,
    pub local_only: usize,
    pub remote_only: usize,
    pub escalated_local_failed: usize,
    pub escalated_no_confidence: usize,
    pub escalated_low_confidence: usize,
    pub escalated_mantra: usize,
}

impl RoutingSnapshot {
    pub fn escalated(&self) -> usize {
        self.escalated_local_failed
            + self.escalated_no_confidence
            + self.escalated_low_confidence
            + self.escalated_mantra
    }
}
