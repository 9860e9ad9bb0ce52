//! System prompts for vision-LLM transcription of Devanagari pages.
//!
//! Every prompt lives here so prompt changes never touch retry or routing
//! code, and tests can inspect the exact text sent to the model.

/// Default system prompt for transcribing one Hindi / Sanskrit page image.
pub const DEFAULT_OCR_PROMPT: &str = r#"You are an expert OCR system for Sanskrit and Hindi manuscripts.

Extract ALL text from this scanned page in proper Unicode Devanagari.

OUTPUT FORMAT:
- Output ONLY the extracted text
- No explanations, no "Here is the text:", no metadata
- Start directly with the first word of the page

PRESERVATION RULES:
1. VERSE NUMBERING: keep the exact format (॥१॥, ॥२॥, ||1||, etc.)
2. SECTION MARKERS: preserve chapter headers and section titles
3. LINE BREAKS: keep the original verse line structure
4. PUNCTUATION: keep every daṇḍa (।) and double daṇḍa (॥)
5. SPECIAL CHARACTERS: preserve anusvāra (ं), visarga (ः), chandrabindu (ँ)

HANDLING UNCLEAR TEXT:
- Make a best effort based on context
- Never leave gaps or [illegible] markers

TEXT TYPE: tantric / spiritual text with mantras and technical terms.
Accuracy of mantras is critical: preserve their exact spelling."#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_asks_for_verse_markers() {
        assert!(DEFAULT_OCR_PROMPT.contains("॥१॥"));
        assert!(DEFAULT_OCR_PROMPT.contains("Devanagari"));
    }
}
