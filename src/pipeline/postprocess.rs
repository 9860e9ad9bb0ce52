//! Post-processing: deterministic cleanup of engine output before validation.
//!
//! Both engines add noise that is not part of the page. Tesseract ends every
//! page with a form feed; vision models wrap answers in code fences or
//! prefix them with "Here is the transcribed text:". These rules remove that
//! noise without touching the transcription itself.
//!
//! ## What is never touched
//!
//! ZERO WIDTH JOINER (U+200D) and ZERO WIDTH NON-JOINER (U+200C) are
//! meaningful in Devanagari: they select between a conjunct and its
//! half-form (`क्ष` vs `क्‍ष`). Generic "invisible character" stripping would
//! silently change the text, so only characters with no orthographic role
//! are removed.
//!
//! ## Rule Order
//!
//! Fences are stripped before the preamble check so a fenced answer with a
//! preamble inside still loses both; NFC runs last over the settled text.

use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

/// Apply all cleanup rules to raw engine output.
///
/// 1. Strip outer Markdown fences
/// 2. Normalise line endings (CRLF → LF) and drop form feeds
/// 3. Remove a leading "here is the text" preamble line
/// 4. Trim trailing whitespace per line
/// 5. Collapse 3+ consecutive blank lines down to 2
/// 6. Strip zero-width spaces, BOM, soft hyphens and word joiners
/// 7. NFC-normalise and trim the whole text
pub fn clean_transcription(input: &str) -> String {
    let s = strip_markdown_fences(input);
    let s = normalise_line_endings(&s);
    let s = strip_preamble(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    let s = remove_invisible_chars(&s);
    s.nfc().collect::<String>().trim().to_string()
}

// ── Rule 1: Strip outer markdown fences ──────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:markdown|text|md)?\n(.*)\n```\s*$").unwrap());

fn strip_markdown_fences(input: &str) -> String {
    if let Some(caps) = RE_OUTER_FENCES.captures(input.trim()) {
        caps[1].to_string()
    } else {
        input.to_string()
    }
}

// ── Rule 2: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .replace('\u{000C}', "")
}

// ── Rule 3: Strip model preamble ─────────────────────────────────────────────

static RE_PREAMBLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*(?:here\s+is|here's|below\s+is)\s+(?:the\s+)?(?:extracted\s+|transcribed\s+|ocr\s+)?(?:text|transcription)[^\n]*:\s*\n",
    )
    .unwrap()
});

fn strip_preamble(input: &str) -> String {
    RE_PREAMBLE.replace(input, "").to_string()
}

// ── Rule 4: Trim trailing whitespace per line ────────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 5: Collapse excessive blank lines ───────────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{4,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n\n").to_string()
}

// ── Rule 6: Remove invisible Unicode characters ──────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(['\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{2060}'], "")
}
