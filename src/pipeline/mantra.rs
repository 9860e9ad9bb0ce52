//! Mantra detection: classify extracted text by sacred-pattern content.
//!
//! Local OCR engines routinely mangle bīja syllables: the anusvāra of `ह्रीं`
//! drops, the virama of `फट्` vanishes, `ॐ` becomes `3`. A page that contains
//! them must be transcribed with maximal fidelity, so the decision engine
//! escalates it regardless of how confident the local engine claims to be.
//!
//! ## Matching rules
//!
//! 1. **Bīja lexicon** → [`MantraCategory::HighPriority`]. Both the text and
//!    the lexicon are NFC-normalised, and a hit only counts when it starts and
//!    ends on an extended grapheme-cluster boundary. `फट` therefore does not
//!    match inside `फटा`, where the vowel sign belongs to the same cluster.
//! 2. **Numbered verse markers** (`॥१॥`, `।। 12 ।।`, `|| 3 ||`) →
//!    [`MantraCategory::Verify`].
//! 3. Otherwise [`MantraCategory::Skip`].
//!
//! Both non-skip categories trigger escalation; the distinction is advisory
//! and only shows up in logs and cache metadata.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use unicode_normalization::UnicodeNormalization;
use unicode_segmentation::UnicodeSegmentation;

/// Classification of a page's text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MantraCategory {
    /// No sacred pattern found.
    Skip,
    /// Verse structure present; worth verifying.
    Verify,
    /// Bīja syllables present; transcription must be exact.
    HighPriority,
}

impl MantraCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            MantraCategory::Skip => "skip",
            MantraCategory::Verify => "verify",
            MantraCategory::HighPriority => "high_priority",
        }
    }
}

impl fmt::Display for MantraCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detailed scan outcome, for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MantraScan {
    pub category: MantraCategory,
    /// Distinct lexicon entries found, in lexicon order.
    pub bija_hits: Vec<&'static str>,
    /// Number of numbered verse markers found.
    pub verse_markers: usize,
}

/// Bīja syllables and mantra endings.
const BIJA_LEXICON: &[&str] = &[
    "ॐ", "ओं", "ह्रीं", "हृीं", "श्रीं", "श्री", "क्लीं", "क्ली", "ऐं", "हुं", "हूं", "फट्", "फट",
    "स्वाहा", "नमः", "नम:", "वौषट्", "वषट्", "हं", "हाँ", "क्षं", "ठः", "क्रों", "क्रौं", "ग्लौं",
    "द्रां", "द्रीं", "द्रूं", "ब्लूं", "स्त्रीं",
];

/// Lexicon paired with its NFC form, so matching is normalisation-insensitive.
static LEXICON_NFC: Lazy<Vec<(&'static str, String)>> = Lazy::new(|| {
    BIJA_LEXICON
        .iter()
        .map(|entry| (*entry, entry.nfc().collect::<String>()))
        .collect()
});

static RE_VERSE_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?:॥|।।|\|\|)\s*[0-9०-९]+(?:\.[0-9०-९]+)?\s*(?:॥|।।|\|\|)",
    )
    .unwrap()
});

/// Pure classifier of extracted text into sacred-pattern categories.
#[derive(Debug, Clone, Copy, Default)]
pub struct MantraDetector;

impl MantraDetector {
    pub fn new() -> Self {
        Self
    }

    /// Classify `text`. Deterministic and side-effect free.
    pub fn scan(&self, text: &str) -> MantraCategory {
        self.inspect(text).category
    }

    /// Classify `text` and report what matched.
    pub fn inspect(&self, text: &str) -> MantraScan {
        if text.trim().is_empty() {
            return MantraScan {
                category: MantraCategory::Skip,
                bija_hits: Vec::new(),
                verse_markers: 0,
            };
        }

        let normalised: String = text.nfc().collect();
        let boundaries = grapheme_boundaries(&normalised);

        let bija_hits: Vec<&'static str> = LEXICON_NFC
            .iter()
            .filter(|(_, nfc)| contains_on_boundaries(&normalised, nfc, &boundaries))
            .map(|(entry, _)| *entry)
            .collect();

        let verse_markers = RE_VERSE_MARKER.find_iter(&normalised).count();

        let category = if !bija_hits.is_empty() {
            MantraCategory::HighPriority
        } else if verse_markers > 0 {
            MantraCategory::Verify
        } else {
            MantraCategory::Skip
        };

        MantraScan {
            category,
            bija_hits,
            verse_markers,
        }
    }
}

/// Byte offsets at which an extended grapheme cluster starts, plus the end.
fn grapheme_boundaries(text: &str) -> HashSet<usize> {
    let mut set: HashSet<usize> = text.grapheme_indices(true).map(|(i, _)| i).collect();
    set.insert(text.len());
    set
}

fn contains_on_boundaries(haystack: &str, needle: &str, boundaries: &HashSet<usize>) -> bool {
    if needle.is_empty() {
        return false;
    }
    haystack.match_indices(needle).any(|(start, m)| {
        boundaries.contains(&start) && boundaries.contains(&(start + m.len()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(text: &str) -> MantraCategory {
        MantraDetector::new().scan(text)
    }

    #[test]
    fn plain_prose_is_skipped() {
        assert_eq!(scan("सामान्य पाठ"), MantraCategory::Skip);
        assert_eq!(scan(""), MantraCategory::Skip);
        assert_eq!(scan("   \n"), MantraCategory::Skip);
    }

    #[test]
    fn bija_syllables_are_high_priority() {
        assert_eq!(scan("ह्रीं"), MantraCategory::HighPriority);
        assert_eq!(scan("ॐ नमः शिवाय"), MantraCategory::HighPriority);
        assert_eq!(scan("... क्लीं कामदेवाय स्वाहा"), MantraCategory::HighPriority);
    }

    #[test]
    fn numbered_verse_markers_need_verification() {
        assert_eq!(scan("धर्मक्षेत्रे कुरुक्षेत्रे ॥१॥"), MantraCategory::Verify);
        assert_eq!(scan("first line || 12 ||"), MantraCategory::Verify);
        assert_eq!(scan("पाठ ।। ३.४ ।।"), MantraCategory::Verify);
    }

    #[test]
    fn bija_outranks_verse_markers() {
        let scan = MantraDetector::new().inspect("ॐ ह्रीं नमः ॥१॥ ॥२॥");
        assert_eq!(scan.category, MantraCategory::HighPriority);
        assert_eq!(scan.verse_markers, 2);
        assert!(scan.bija_hits.contains(&"ह्रीं"));
        assert!(scan.bija_hits.contains(&"ॐ"));
    }

    #[test]
    fn lone_danda_is_not_a_verse_marker() {
        assert_eq!(scan("यह सामान्य वाक्य है। दूसरा वाक्य॥"), MantraCategory::Skip);
    }

    #[test]
    fn matches_respect_grapheme_boundaries() {
        // Byte-level search would find "फट" inside "फटा"; the vowel sign
        // belongs to the same grapheme cluster.
        assert_eq!(scan("फटा हुआ कपड़ा"), MantraCategory::Skip);
        assert_eq!(scan("अस्त्राय फट्"), MantraCategory::HighPriority);
    }

    #[test]
    fn scan_is_deterministic() {
        let text = "श्रीं ह्रीं क्लीं ॥१॥";
        let first = MantraDetector::new().inspect(text);
        for _ in 0..5 {
            assert_eq!(MantraDetector::new().inspect(text), first);
        }
    }
}
