//! Local transcription: the free first pass.
//!
//! [`TesseractEngine`] shells out to the `tesseract` binary with the Hindi,
//! Sanskrit and English models. Each page is read twice: once for plain
//! text, once as TSV to recover per-word confidences. The engine is
//! synchronous; the router runs it on the blocking pool and cancels the
//! token it was handed when the page is dropped, which kills a running
//! `tesseract` child.

use crate::error::OcrError;
use std::path::{Path, PathBuf};
use std::process::Command;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Result of a local transcription attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalOutput {
    pub text: String,
    /// Mean word confidence in `[0, 1]`, when the engine reported any.
    pub confidence: Option<f32>,
    pub success: bool,
    pub error: Option<String>,
}

impl LocalOutput {
    pub fn ok(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence: Some(confidence),
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            text: String::new(),
            confidence: None,
            success: false,
            error: Some(error.into()),
        }
    }
}

/// A free, local transcription backend.
///
/// `process` is blocking and runs on the blocking pool. It never returns
/// `Err`: failures are reported in [`LocalOutput::success`] so the hybrid
/// router can escalate them.
///
/// `cancel` fires when the page is abandoned (timeout, shutdown). The worker
/// slot stays taken until `process` returns, so an engine that ignores it
/// delays the next page rather than running alongside it.
pub trait LocalEngine: Send + Sync {
    fn name(&self) -> &str;

    fn process(&self, image: &Path, cancel: &CancellationToken) -> LocalOutput;
}

// ── Tesseract ────────────────────────────────────────────────────────────

const INSTALL_HINT: &str = "Install Tesseract with Hindi and Sanskrit data:\n  \
     Ubuntu: apt install tesseract-ocr tesseract-ocr-hin tesseract-ocr-san\n  \
     macOS:  brew install tesseract tesseract-lang";

/// Tesseract CLI adapter.
#[derive(Debug, Clone)]
pub struct TesseractEngine {
    binary: PathBuf,
    languages: Vec<String>,
    oem: u8,
    psm: u8,
    dpi: u32,
}

impl Default for TesseractEngine {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("tesseract"),
            languages: vec!["hin".into(), "san".into(), "eng".into()],
            oem: 3,
            psm: 3,
            dpi: 200,
        }
    }
}

impl TesseractEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.binary = path.into();
        self
    }

    pub fn languages<I, S>(mut self, langs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.languages = langs.into_iter().map(Into::into).collect();
        self
    }

    /// DPI of the images it will be given, passed through to Tesseract.
    pub fn dpi(mut self, dpi: u32) -> Self {
        self.dpi = dpi;
        self
    }

    fn lang_arg(&self) -> String {
        self.languages.join("+")
    }

    /// Verify the binary runs and every configured language is installed.
    ///
    /// Returns the version line on success.
    pub fn preflight(&self) -> Result<String, OcrError> {
        let unavailable = |hint: String| OcrError::EngineUnavailable {
            engine: "tesseract".to_string(),
            hint,
        };

        let version = Command::new(&self.binary)
            .arg("--version")
            .output()
            .map_err(|e| unavailable(format!("{e}\n{INSTALL_HINT}")))?;
        // Older builds print the version on stderr.
        let banner = if version.stdout.is_empty() {
            String::from_utf8_lossy(&version.stderr).into_owned()
        } else {
            String::from_utf8_lossy(&version.stdout).into_owned()
        };
        let version_line = banner.lines().next().unwrap_or("tesseract").trim().to_string();

        let langs = Command::new(&self.binary)
            .arg("--list-langs")
            .output()
            .map_err(|e| unavailable(format!("{e}\n{INSTALL_HINT}")))?;
        let listing = format!(
            "{}\n{}",
            String::from_utf8_lossy(&langs.stdout),
            String::from_utf8_lossy(&langs.stderr)
        );
        let missing = missing_languages(&listing, &self.languages);
        if !missing.is_empty() {
            return Err(unavailable(format!(
                "missing language data: {}\n{INSTALL_HINT}",
                missing.join(", ")
            )));
        }

        debug!("{} ready (languages: {})", version_line, self.lang_arg());
        Ok(version_line)
    }

    /// One tesseract invocation, killed if `cancel` fires first.
    fn run(
        &self,
        image: &Path,
        extra: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<String, String> {
        let runtime =
            Handle::try_current().map_err(|e| format!("tesseract needs a tokio runtime: {e}"))?;

        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.arg(image)
            .arg("stdout")
            .arg("-l")
            .arg(self.lang_arg())
            .arg("--oem")
            .arg(self.oem.to_string())
            .arg("--psm")
            .arg(self.psm.to_string())
            .arg("--dpi")
            .arg(self.dpi.to_string())
            .kill_on_drop(true);
        if let Some(config) = extra {
            cmd.arg(config);
        }

        let output = runtime.block_on(async {
            tokio::select! {
                out = cmd.output() => out.map_err(|e| format!("failed to run tesseract: {e}")),
                _ = cancel.cancelled() => Err("tesseract cancelled".to_string()),
            }
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!(
                "tesseract exited with {}: {}",
                output.status,
                stderr.trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl LocalEngine for TesseractEngine {
    fn name(&self) -> &str {
        "tesseract"
    }

    fn process(&self, image: &Path, cancel: &CancellationToken) -> LocalOutput {
        let raw = match self.run(image, None, cancel) {
            Ok(text) => text,
            Err(e) => return LocalOutput::failed(e),
        };
        let text = raw.replace('\u{000C}', "").trim().to_string();

        let confidence = match self.run(image, Some("tsv"), cancel) {
            Ok(tsv) => parse_tsv_confidence(&tsv),
            Err(e) => {
                warn!("Tesseract TSV pass failed: {}", e);
                None
            }
        };

        LocalOutput {
            text,
            confidence,
            success: true,
            error: None,
        }
    }
}

/// Mean of the non-negative word confidences in Tesseract TSV output,
/// scaled to `[0, 1]`. `None` when no word was recognised.
pub fn parse_tsv_confidence(tsv: &str) -> Option<f32> {
    let mut lines = tsv.lines();
    let header = lines.next()?;
    let conf_col = header.split('\t').position(|h| h.trim() == "conf")?;

    let (sum, count) = lines
        .filter_map(|line| line.split('\t').nth(conf_col))
        .filter_map(|c| c.trim().parse::<f32>().ok())
        .filter(|c| *c >= 0.0)
        .fold((0.0f32, 0usize), |(s, n), c| (s + c, n + 1));

    if count == 0 {
        None
    } else {
        Some((sum / count as f32 / 100.0).clamp(0.0, 1.0))
    }
}

fn missing_languages(listing: &str, wanted: &[String]) -> Vec<String> {
    let installed: Vec<&str> = listing.lines().map(str::trim).collect();
    wanted
        .iter()
        .filter(|lang| !installed.contains(&lang.as_str()))
        .cloned()
        .collect()
}
