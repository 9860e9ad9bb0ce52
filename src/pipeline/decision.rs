//! Hybrid routing: decide whether a local transcription can be trusted.
//!
//! The decision is a pure function of the local result and two config
//! values. It never calls an engine; the scheduler performs the remote call
//! when the answer is [`Decision::Escalate`].
//!
//! ```text
//! ACCEPT_LOCAL  ⇔  local succeeded
//!                ∧ confidence ≥ threshold
//!                ∧ (mantra verification off ∨ MantraDetector = SKIP)
//! ESCALATE      otherwise
//! ```

use crate::pipeline::local::LocalOutput;
use crate::pipeline::mantra::{MantraCategory, MantraDetector};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a page was routed to the remote engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum EscalationReason {
    /// The local engine reported failure.
    LocalFailed,
    /// The local engine produced no usable confidence score.
    NoConfidence,
    /// Confidence fell below the threshold.
    LowConfidence { confidence: f32, threshold: f32 },
    /// Sacred patterns were found; mantras override confidence.
    Mantra { category: MantraCategory },
}

impl fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EscalationReason::LocalFailed => f.write_str("local engine failed"),
            EscalationReason::NoConfidence => f.write_str("no confidence score"),
            EscalationReason::LowConfidence {
                confidence,
                threshold,
            } => write!(f, "low confidence ({confidence:.2} < {threshold:.2})"),
            EscalationReason::Mantra { category } => write!(f, "mantra verification ({category})"),
        }
    }
}

/// Outcome of [`HybridDecisionEngine::decide`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    AcceptLocal,
    Escalate(EscalationReason),
}

impl Decision {
    pub fn is_escalate(&self) -> bool {
        matches!(self, Decision::Escalate(_))
    }
}

/// Combines local confidence and mantra classification into a routing decision.
#[derive(Debug, Clone, Copy)]
pub struct HybridDecisionEngine {
    threshold: f32,
    mantra_verification: bool,
    detector: MantraDetector,
}

impl HybridDecisionEngine {
    /// `threshold` is clamped into `[0, 1]`.
    pub fn new(threshold: f32, mantra_verification: bool) -> Self {
        let threshold = if threshold.is_nan() {
            1.0
        } else {
            threshold.clamp(0.0, 1.0)
        };
        Self {
            threshold,
            mantra_verification,
            detector: MantraDetector::new(),
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Route one local result. Pure: no I/O, no shared state.
    pub fn decide(&self, local: &LocalOutput) -> Decision {
        if !local.success {
            return Decision::Escalate(EscalationReason::LocalFailed);
        }

        if self.mantra_verification {
            let category = self.detector.scan(&local.text);
            if category != MantraCategory::Skip {
                return Decision::Escalate(EscalationReason::Mantra { category });
            }
        }

        match local.confidence {
            Some(c) if c.is_nan() => Decision::Escalate(EscalationReason::NoConfidence),
            None => Decision::Escalate(EscalationReason::NoConfidence),
            Some(c) if c >= self.threshold => Decision::AcceptLocal,
            Some(c) => Decision::Escalate(EscalationReason::LowConfidence {
                confidence: c,
                threshold: self.threshold,
            }),
        }
    }
}
