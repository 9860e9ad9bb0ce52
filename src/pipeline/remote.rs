//! Remote transcription: a vision LLM reads the page image.
//!
//! [`RemoteEngine::transcribe`] is one attempt. Retrying, rate limiting and
//! usage accounting wrap it in [`call_with_retry`] so every engine, real or
//! fake, gets the same policy.
//!
//! ## Retry Strategy
//!
//! 429 / 5xx / timeouts are transient under concurrent load. The wait before
//! retry `n` is `retry_backoff_ms * 2^(n-1)`; quota errors start from a base
//! four times longer, since the provider is asking us to back off. With the
//! default 1000 ms base and 3 retries a plain transient error waits
//! 1 s → 2 s → 4 s. Anything else (auth, bad request, content policy) fails
//! the page on the first attempt.

use crate::config::{PipelineConfig, RemoteOptions};
use crate::error::{OcrError, PageError};
use crate::pipeline::encode::to_image_data;
use crate::pipeline::limiter::RateLimiter;
use crate::prompts::DEFAULT_OCR_PROMPT;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

/// USD per million input tokens.
pub const INPUT_COST_PER_MTOK: f64 = 0.50;
/// USD per million output tokens.
pub const OUTPUT_COST_PER_MTOK: f64 = 3.00;

/// Model used when a provider is named without one.
const DEFAULT_MODEL: &str = "gpt-4.1-nano";

/// Token usage of one remote call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

/// Successful remote transcription.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteOutput {
    pub text: String,
    pub usage: Usage,
}

/// Failure of one remote attempt.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RemoteError {
    #[error("transient: {detail}")]
    Transient { detail: String, quota: bool },

    #[error("{0}")]
    Permanent(String),
}

impl RemoteError {
    /// Classify a provider error message.
    pub fn classify(message: impl Into<String>) -> Self {
        let detail = message.into();
        let lower = detail.to_lowercase();
        let quota = lower.contains("429")
            || lower.contains("quota")
            || lower.contains("rate limit")
            || lower.contains("rate_limit")
            || lower.contains("resource_exhausted")
            || lower.contains("too many requests");
        let transient = quota
            || ["500", "502", "503", "504"].iter().any(|c| lower.contains(c))
            || lower.contains("timeout")
            || lower.contains("timed out")
            || lower.contains("overloaded")
            || lower.contains("unavailable")
            || lower.contains("connection");
        if transient {
            RemoteError::Transient { detail, quota }
        } else {
            RemoteError::Permanent(detail)
        }
    }
}

/// A paid, remote transcription backend.
#[async_trait]
pub trait RemoteEngine: Send + Sync {
    fn name(&self) -> &str;

    /// One transcription attempt of a PNG page image.
    async fn transcribe(
        &self,
        png: &[u8],
        options: &RemoteOptions,
    ) -> Result<RemoteOutput, RemoteError>;
}

// ── Retry ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff_ms: config.retry_backoff_ms,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32, quota: bool) -> Duration {
        let base = if quota {
            self.backoff_ms.saturating_mul(4)
        } else {
            self.backoff_ms
        };
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(base.saturating_mul(factor))
    }
}

/// Run `engine` on one page with rate limiting, retries and usage accounting.
pub async fn call_with_retry(
    engine: &dyn RemoteEngine,
    page: usize,
    png: &[u8],
    options: &RemoteOptions,
    policy: RetryPolicy,
    limiter: &RateLimiter,
    meter: &UsageMeter,
) -> Result<RemoteOutput, PageError> {
    let mut last_err = String::new();

    for attempt in 0..=policy.max_retries {
        limiter.acquire().await;
        meter.record_call();

        match engine.transcribe(png, options).await {
            Ok(output) => {
                meter.record_usage(output.usage);
                if attempt > 0 {
                    debug!("Page {}: {} succeeded on attempt {}", page, engine.name(), attempt + 1);
                }
                return Ok(output);
            }
            Err(RemoteError::Permanent(detail)) => {
                meter.record_failure();
                warn!("Page {}: {} failed permanently: {}", page, engine.name(), detail);
                return Err(PageError::RemoteFailed { page, detail });
            }
            Err(RemoteError::Transient { detail, quota }) => {
                meter.record_failure();
                last_err = detail;
                if attempt < policy.max_retries {
                    let wait = policy.backoff(attempt + 1, quota);
                    warn!(
                        "Page {}: retry {}/{} after {}ms: {}",
                        page,
                        attempt + 1,
                        policy.max_retries,
                        wait.as_millis(),
                        last_err
                    );
                    sleep(wait).await;
                }
            }
        }
    }

    Err(PageError::TransientExhausted {
        page,
        retries: policy.max_retries,
        detail: last_err,
    })
}

// ── Usage ────────────────────────────────────────────────────────────────

/// Run-wide remote usage counters.
#[derive(Debug, Default)]
pub struct UsageMeter {
    calls: AtomicUsize,
    failures: AtomicUsize,
    input_tokens: AtomicUsize,
    output_tokens: AtomicUsize,
}

/// Point-in-time copy of a [`UsageMeter`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct UsageSnapshot {
    pub calls: usize,
    pub failed_calls: usize,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub estimated_cost_usd: f64,
}

impl UsageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_call(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_usage(&self, usage: Usage) {
        self.input_tokens.fetch_add(usage.input_tokens, Ordering::Relaxed);
        self.output_tokens.fetch_add(usage.output_tokens, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        let input_tokens = self.input_tokens.load(Ordering::Relaxed);
        let output_tokens = self.output_tokens.load(Ordering::Relaxed);
        UsageSnapshot {
            calls: self.calls.load(Ordering::Relaxed),
            failed_calls: self.failures.load(Ordering::Relaxed),
            input_tokens,
            output_tokens,
            estimated_cost_usd: cost_usd(input_tokens, output_tokens),
        }
    }
}

pub fn cost_usd(input_tokens: usize, output_tokens: usize) -> f64 {
    input_tokens as f64 * INPUT_COST_PER_MTOK / 1_000_000.0
        + output_tokens as f64 * OUTPUT_COST_PER_MTOK / 1_000_000.0
}

// ── Vision LLM ───────────────────────────────────────────────────────────

/// Remote engine backed by any vision-capable edgequake-llm provider.
pub struct VisionEngine {
    provider: Arc<dyn LLMProvider>,
    label: String,
    prompt: String,
    temperature: f32,
}

impl VisionEngine {
    pub fn new(provider: Arc<dyn LLMProvider>, label: impl Into<String>) -> Self {
        Self {
            provider,
            label: label.into(),
            prompt: DEFAULT_OCR_PROMPT.to_string(),
            temperature: 0.1,
        }
    }

    /// Resolve the provider from `config` and build the engine.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, OcrError> {
        let (provider, label) = resolve_provider(config)?;
        Ok(Self::new(provider, label))
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.clamp(0.0, 2.0);
        self
    }
}

#[async_trait]
impl RemoteEngine for VisionEngine {
    fn name(&self) -> &str {
        &self.label
    }

    async fn transcribe(
        &self,
        png: &[u8],
        options: &RemoteOptions,
    ) -> Result<RemoteOutput, RemoteError> {
        let start = Instant::now();
        // The image carries all the content; the user turn is intentionally empty.
        let messages = vec![
            ChatMessage::system(self.prompt.as_str()),
            ChatMessage::user_with_images(
                "",
                vec![to_image_data(png, options.image_resolution.detail())],
            ),
        ];
        let completion = CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(options.reasoning_effort.token_budget()),
            ..Default::default()
        };

        let response = self
            .provider
            .chat(&messages, Some(&completion))
            .await
            .map_err(|e| RemoteError::classify(e.to_string()))?;

        debug!(
            "{}: {} input tokens, {} output tokens, {:?}",
            self.label,
            response.prompt_tokens,
            response.completion_tokens,
            start.elapsed()
        );

        Ok(RemoteOutput {
            text: response.content,
            usage: Usage {
                input_tokens: response.prompt_tokens as usize,
                output_tokens: response.completion_tokens as usize,
            },
        })
    }
}

fn create_vision_provider(
    provider_name: &str,
    model: &str,
) -> Result<(Arc<dyn LLMProvider>, String), OcrError> {
    let provider = ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        OcrError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })?;
    Ok((provider, format!("{provider_name}/{model}")))
}

/// Resolve the LLM provider, from most-specific to least-specific:
///
/// 1. **Pre-built provider** (`config.provider`), used as-is.
/// 2. **Named provider + model** (`config.provider_name`); the factory reads
///    the matching API key from the environment.
/// 3. **Environment pair** `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`.
/// 4. **Auto-detection** via [`ProviderFactory::from_env`].
fn resolve_provider(config: &PipelineConfig) -> Result<(Arc<dyn LLMProvider>, String), OcrError> {
    if let Some(ref provider) = config.provider {
        let label = config.model.clone().unwrap_or_else(|| "custom".to_string());
        return Ok((Arc::clone(provider), label));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
        return create_vision_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_vision_provider(&prov, &model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| OcrError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set GEMINI_API_KEY, OPENAI_API_KEY or ANTHROPIC_API_KEY, or pass --provider.\n\
                Error: {}",
                e
            ),
        })?;
    Ok((llm_provider, "auto".to_string()))
}
