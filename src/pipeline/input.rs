//! Where the document comes from, and where its run artifacts go.
//!
//! A run needs two paths: the PDF pdfium reads, and the **anchor** that the
//! cache directory, progress record and merged output are named after and
//! placed beside. For a local file they are the same path. A URL is
//! streamed into a private temp directory that disappears with the
//! [`InputDocument`], so its anchor is the bare file name in the working
//! directory; a re-run with `--resume` then finds the same state again.
//!
//! Either way the first bytes must be `%PDF`, so a mistyped argument fails
//! before any page is scheduled.

use crate::error::OcrError;
use reqwest::Url;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

const PDF_MAGIC: &[u8; 4] = b"%PDF";
const FALLBACK_NAME: &str = "downloaded.pdf";

/// What the user pointed the run at.
#[derive(Debug, Clone, PartialEq)]
pub enum InputSource {
    File(PathBuf),
    Url(Url),
}

impl InputSource {
    /// `http(s)://…` is a URL, any other `scheme://` is rejected, and
    /// everything else is a file path.
    pub fn parse(input: &str) -> Result<Self, OcrError> {
        let trimmed = input.trim();
        let invalid = || OcrError::InvalidInput {
            input: input.to_string(),
        };
        if trimmed.is_empty() {
            return Err(invalid());
        }
        if !trimmed.contains("://") {
            return Ok(InputSource::File(PathBuf::from(trimmed)));
        }
        match Url::parse(trimmed) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(InputSource::Url(url)),
            _ => Err(invalid()),
        }
    }
}

/// A PDF ready for rendering.
#[derive(Debug)]
pub struct InputDocument {
    pdf: PathBuf,
    anchor: PathBuf,
    /// Holds a downloaded file alive.
    download: Option<TempDir>,
}

impl InputDocument {
    /// The file to render.
    pub fn path(&self) -> &Path {
        &self.pdf
    }

    /// The path run artifacts are named after and placed beside.
    pub fn anchor(&self) -> &Path {
        &self.anchor
    }

    pub fn is_downloaded(&self) -> bool {
        self.download.is_some()
    }
}

/// Turn the CLI argument into a checked local PDF.
pub async fn open_input(input: &str, download_timeout_secs: u64) -> Result<InputDocument, OcrError> {
    match InputSource::parse(input)? {
        InputSource::File(path) => open_local(path).await,
        InputSource::Url(url) => download(url, download_timeout_secs).await,
    }
}

async fn open_local(path: PathBuf) -> Result<InputDocument, OcrError> {
    let mut file = match File::open(&path).await {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            return Err(OcrError::PermissionDenied { path });
        }
        Err(_) => return Err(OcrError::FileNotFound { path }),
    };
    if file.metadata().await.map(|m| m.is_dir()).unwrap_or(false) {
        return Err(OcrError::FileNotFound { path });
    }

    let mut head = [0u8; 4];
    let read = read_up_to(&mut file, &mut head).await.unwrap_or(0);
    check_magic(&path, &head[..read])?;

    debug!("Input is a local PDF: {}", path.display());
    Ok(InputDocument {
        anchor: path.clone(),
        pdf: path,
        download: None,
    })
}

/// Stream `url` into a temp directory, checking the magic on the first bytes.
async fn download(url: Url, timeout_secs: u64) -> Result<InputDocument, OcrError> {
    let shown = url.to_string();
    let failed = |reason: String| OcrError::DownloadFailed {
        url: shown.clone(),
        reason,
    };
    let from_reqwest = |e: reqwest::Error| {
        if e.is_timeout() {
            OcrError::DownloadTimeout {
                url: shown.clone(),
                secs: timeout_secs,
            }
        } else {
            failed(e.to_string())
        }
    };

    info!("Downloading {}", shown);
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| failed(e.to_string()))?;
    let mut response = client.get(url.clone()).send().await.map_err(from_reqwest)?;
    if !response.status().is_success() {
        return Err(failed(format!("HTTP {}", response.status())));
    }

    let name = file_name_for(&url);
    let dir = TempDir::new().map_err(|e| OcrError::Internal(format!("temp dir: {e}")))?;
    let pdf = dir.path().join(&name);
    let write_err = |e: io::Error| OcrError::Internal(format!("writing download: {e}"));
    let mut out = File::create(&pdf).await.map_err(write_err)?;

    let mut head: Vec<u8> = Vec::with_capacity(PDF_MAGIC.len());
    let mut total = 0usize;
    while let Some(chunk) = response.chunk().await.map_err(from_reqwest)? {
        if head.len() < PDF_MAGIC.len() {
            let take = (PDF_MAGIC.len() - head.len()).min(chunk.len());
            head.extend_from_slice(&chunk[..take]);
            if head.len() == PDF_MAGIC.len() {
                check_magic(&pdf, &head)?;
            }
        }
        out.write_all(&chunk).await.map_err(write_err)?;
        total += chunk.len();
    }
    check_magic(&pdf, &head)?;
    out.flush().await.map_err(write_err)?;

    info!("Downloaded {} bytes as {}", total, name);
    Ok(InputDocument {
        pdf,
        anchor: PathBuf::from(name),
        download: Some(dir),
    })
}

/// Last URL path segment, with `.pdf` appended when it has no extension.
fn file_name_for(url: &Url) -> String {
    let last = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|s| !s.is_empty() && !s.starts_with('.'))
        .map(|s| s.replace(['\\', ':'], "_"));
    match last {
        Some(name) if Path::new(&name).extension().is_some() => name,
        Some(name) => format!("{name}.pdf"),
        None => FALLBACK_NAME.to_string(),
    }
}

fn check_magic(path: &Path, head: &[u8]) -> Result<(), OcrError> {
    if head == PDF_MAGIC {
        return Ok(());
    }
    let mut magic = [0u8; 4];
    magic[..head.len().min(4)].copy_from_slice(&head[..head.len().min(4)]);
    Err(OcrError::NotAPdf {
        path: path.to_path_buf(),
        magic,
    })
}

async fn read_up_to(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]).await? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn sources_are_classified() {
        assert!(matches!(
            InputSource::parse("https://example.com/doc.pdf"),
            Ok(InputSource::Url(_))
        ));
        assert!(matches!(
            InputSource::parse("http://example.com/doc.pdf"),
            Ok(InputSource::Url(_))
        ));
        assert_eq!(
            InputSource::parse(" books/granth.pdf ").unwrap(),
            InputSource::File(PathBuf::from("books/granth.pdf"))
        );
        for bad in ["", "   ", "ftp://example.com/doc.pdf", "https://"] {
            assert!(
                matches!(InputSource::parse(bad), Err(OcrError::InvalidInput { .. })),
                "expected '{bad}' to be rejected"
            );
        }
    }

    #[test]
    fn download_names_come_from_the_url() {
        let name = |u: &str| file_name_for(&Url::parse(u).unwrap());
        assert_eq!(name("https://h/books/stotra.pdf?dl=1"), "stotra.pdf");
        assert_eq!(name("https://h/view/1234"), "1234.pdf");
        assert_eq!(name("https://h/"), FALLBACK_NAME);
        assert_eq!(name("https://h/.hidden"), FALLBACK_NAME);
    }

    #[tokio::test]
    async fn local_pdf_is_its_own_anchor() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("granth.pdf");
        std::fs::write(&path, b"%PDF-1.7\n...").unwrap();

        let doc = open_input(path.to_str().unwrap(), 5).await.unwrap();
        assert_eq!(doc.path(), path);
        assert_eq!(doc.anchor(), path);
        assert!(!doc.is_downloaded());
    }

    #[tokio::test]
    async fn missing_short_and_foreign_files_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("missing.pdf");
        assert!(matches!(
            open_input(missing.to_str().unwrap(), 5).await,
            Err(OcrError::FileNotFound { .. })
        ));
        assert!(matches!(
            open_input(tmp.path().to_str().unwrap(), 5).await,
            Err(OcrError::FileNotFound { .. })
        ));

        let text = tmp.path().join("notes.pdf");
        std::fs::write(&text, b"hello world").unwrap();
        assert!(matches!(
            open_input(text.to_str().unwrap(), 5).await,
            Err(OcrError::NotAPdf { magic, .. }) if &magic == b"hell"
        ));

        let short = tmp.path().join("short.pdf");
        std::fs::write(&short, b"%P").unwrap();
        assert!(matches!(
            open_input(short.to_str().unwrap(), 5).await,
            Err(OcrError::NotAPdf { magic, .. }) if magic == [b'%', b'P', 0, 0]
        ));
    }

    /// Serve one canned HTTP response on a loopback port.
    async fn serve_once(status: &'static str, body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await;
            let head = format!(
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(body).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        format!("http://{addr}/library/granth")
    }

    #[tokio::test]
    async fn url_is_downloaded_and_anchored_in_the_working_directory() {
        let url = serve_once("200 OK", b"%PDF-1.4\n% tiny\n").await;
        let doc = open_input(&url, 5).await.unwrap();

        assert!(doc.is_downloaded());
        assert_eq!(doc.anchor(), Path::new("granth.pdf"));
        assert_eq!(std::fs::read(doc.path()).unwrap(), b"%PDF-1.4\n% tiny\n");

        let temp = doc.path().to_path_buf();
        drop(doc);
        assert!(!temp.exists());
    }

    #[tokio::test]
    async fn failed_or_foreign_downloads_are_rejected() {
        let url = serve_once("404 Not Found", b"gone").await;
        assert!(matches!(
            open_input(&url, 5).await,
            Err(OcrError::DownloadFailed { reason, .. }) if reason.contains("404")
        ));

        let url = serve_once("200 OK", b"<html>login</html>").await;
        assert!(matches!(
            open_input(&url, 5).await,
            Err(OcrError::NotAPdf { magic, .. }) if &magic == b"<htm"
        ));
    }
}
