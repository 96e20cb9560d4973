//! Where PDFs come from.

use std::{fmt, str::FromStr, time::Duration};

use tokio::io::AsyncReadExt as _;

use crate::{async_utils::spawn_blocking_propagating_panics, pdf::LopdfDocument, prelude::*};

/// How long we wait for a remote PDF to download.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(120);

/// The MIME type we require.
const PDF_MIME_TYPE: &str = "application/pdf";

/// A PDF we want to extract text from.
#[derive(Clone)]
pub enum PdfSource {
    /// A local file.
    Path(PathBuf),

    /// A remote file, fetched with a plain HTTP GET.
    Url(String),

    /// Bytes which are already in memory, plus a name to identify them by.
    Bytes { name: String, data: Vec<u8> },
}

impl PdfSource {
    /// A human-readable identifier for this source. This is also used to
    /// label OCR uploads.
    pub fn identifier(&self) -> String {
        match self {
            PdfSource::Path(path) => path.display().to_string(),
            PdfSource::Url(url) => url.clone(),
            PdfSource::Bytes { name, .. } => name.clone(),
        }
    }

    /// If this source is `-`, read all of standard input into memory.
    pub async fn read_stdin_if_requested(self) -> Result<Self> {
        match &self {
            PdfSource::Path(path) if path.as_os_str() == "-" => {
                let mut data = Vec::new();
                tokio::io::stdin()
                    .read_to_end(&mut data)
                    .await
                    .context("failed to read PDF from standard input")?;
                Ok(PdfSource::Bytes {
                    name: "stdin".to_owned(),
                    data,
                })
            }
            _ => Ok(self),
        }
    }

    /// Read the raw bytes of this source.
    #[instrument(level = "debug", skip_all, fields(id = %self.identifier()))]
    pub async fn read_bytes(&self, http: &reqwest::Client) -> Result<Vec<u8>> {
        match self {
            PdfSource::Path(path) => tokio::fs::read(path)
                .await
                .with_context(|| format!("failed to read {:?}", path.display())),
            PdfSource::Url(url) => fetch_url(http, url).await,
            PdfSource::Bytes { data, .. } => Ok(data.clone()),
        }
    }
}

impl FromStr for PdfSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            Err(anyhow!("PDF source must not be empty"))
        } else if s.starts_with("http://") || s.starts_with("https://") {
            Ok(PdfSource::Url(s.to_owned()))
        } else {
            Ok(PdfSource::Path(PathBuf::from(s)))
        }
    }
}

// Don't dump entire PDFs into our logs.
impl fmt::Debug for PdfSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PdfSource::Path(path) => f.debug_tuple("Path").field(path).finish(),
            PdfSource::Url(url) => f.debug_tuple("Url").field(url).finish(),
            PdfSource::Bytes { name, data } => f
                .debug_struct("Bytes")
                .field("name", name)
                .field("len", &data.len())
                .finish(),
        }
    }
}

/// Create the HTTP client we use to download PDFs.
pub fn fetch_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(DEFAULT_FETCH_TIMEOUT)
        .build()
        .context("failed to build HTTP client")
}

/// Download a URL.
async fn fetch_url(http: &reqwest::Client, url: &str) -> Result<Vec<u8>> {
    let response = http
        .get(url)
        .send()
        .await
        .with_context(|| format!("failed to fetch {}", url))?;
    let status = response.status();
    if !status.is_success() {
        return Err(anyhow!("failed to fetch {}: HTTP status {}", url, status));
    }
    let bytes = response
        .bytes()
        .await
        .with_context(|| format!("failed to read response body from {}", url))?;
    debug!(size = bytes.len(), "downloaded PDF");
    Ok(bytes.to_vec())
}

/// Make sure `data` looks like a PDF before we try to parse it.
fn check_is_pdf(id: &str, data: &[u8]) -> Result<()> {
    match infer::get(data) {
        Some(kind) if kind.mime_type() == PDF_MIME_TYPE => Ok(()),
        Some(kind) => Err(anyhow!(
            "{:?} is {}, not a PDF",
            id,
            kind.mime_type()
        )),
        None => Err(anyhow!("{:?} does not look like a PDF", id)),
    }
}

/// Load and parse a PDF.
///
/// Parsing is CPU-bound, so it runs on Tokio's blocking thread pool.
#[instrument(level = "debug", skip_all, fields(id = %source.identifier()))]
pub async fn load_document(
    source: &PdfSource,
    http: &reqwest::Client,
) -> Result<LopdfDocument> {
    let id = source.identifier();
    let data = source.read_bytes(http).await?;
    check_is_pdf(&id, &data)?;
    spawn_blocking_propagating_panics(move || {
        LopdfDocument::from_bytes(&data).with_context(|| format!("failed to load {:?}", id))
    })
    .await
}
