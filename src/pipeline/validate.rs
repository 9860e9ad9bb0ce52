//! Response validation: never cache text that is not a transcription.
//!
//! Vision models sometimes answer a page with an apology ("I'm sorry, the
//! image is not clear") or a one-word fragment. The local engine can return
//! a page of punctuation. Such output passed to the cache would be served
//! forever on resume, so every text is checked before it is saved.
//!
//! A rejection is not a backend error: the backend answered, the answer is
//! just unusable. The page is marked FAILED and nothing is written.

use serde::{Deserialize, Serialize};

/// Minimum trimmed length, in characters.
pub const MIN_VALID_CHARS: usize = 20;

/// Refusal phrases are only looked for in this many leading characters.
pub const PHRASE_WINDOW_CHARS: usize = 300;

/// Phrases that mark model refusals or error messages. Some contain others;
/// the longest match is the one reported.
const BANNED_PHRASES: &[&str] = &[
    "cannot process",
    "unable to",
    "error:",
    "i'm sorry",
    "i cannot",
    "i can't",
    "cannot extract",
    "unable to extract",
    "no text found",
    "image is not clear",
    "cannot read",
    "cannot see",
    "not able to",
];

/// Why a text was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Rejection {
    Empty,
    TooShort { chars: usize, min: usize },
    BannedPhrase { phrase: String },
    NoAlphanumeric,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::Empty => f.write_str("empty response"),
            Rejection::TooShort { chars, min } => {
                write!(f, "response too short ({chars} < {min} chars)")
            }
            Rejection::BannedPhrase { phrase } => write!(f, "contains error phrase '{phrase}'"),
            Rejection::NoAlphanumeric => f.write_str("no letters or digits"),
        }
    }
}

/// Outcome of [`ResponseValidator::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub accepted: bool,
    pub reason: Option<Rejection>,
}

impl Validation {
    fn accept() -> Self {
        Self {
            accepted: true,
            reason: None,
        }
    }

    fn reject(reason: Rejection) -> Self {
        Self {
            accepted: false,
            reason: Some(reason),
        }
    }

    /// Human-readable reason, or "ok".
    pub fn reason_text(&self) -> String {
        self.reason
            .as_ref()
            .map(|r| r.to_string())
            .unwrap_or_else(|| "ok".to_string())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseValidator;

impl ResponseValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, text: &str) -> Validation {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Validation::reject(Rejection::Empty);
        }

        let chars = trimmed.chars().count();
        if chars < MIN_VALID_CHARS {
            return Validation::reject(Rejection::TooShort {
                chars,
                min: MIN_VALID_CHARS,
            });
        }

        let window: String = trimmed
            .chars()
            .take(PHRASE_WINDOW_CHARS)
            .collect::<String>()
            .to_lowercase();
        if let Some(phrase) = BANNED_PHRASES
            .iter()
            .filter(|p| window.contains(*p))
            .max_by_key(|p| p.len())
        {
            return Validation::reject(Rejection::BannedPhrase {
                phrase: (*phrase).to_string(),
            });
        }

        if !trimmed.chars().any(char::is_alphanumeric) {
            return Validation::reject(Rejection::NoAlphanumeric);
        }

        Validation::accept()
    }
}
