//! OCR using the OCR.space web API.

use std::{env, fmt, time::Duration};

use reqwest::{
    StatusCode,
    multipart::{Form, Part},
};

use crate::prelude::*;

use super::{OcrClient, OcrError, ResponseDiagnostics, fits_upload_limit};

/// The standard OCR.space endpoint.
pub const DEFAULT_OCR_SPACE_URL: &str = "https://api.ocr.space/parse/image";

/// Environment variable holding our API key.
pub const API_KEY_VAR: &str = "OCR_SPACE_API_KEY";

/// Environment variable which may override [`DEFAULT_OCR_SPACE_URL`].
pub const API_URL_VAR: &str = "OCR_SPACE_API_URL";

/// Configuration for [`OcrSpaceClient`].
#[derive(Clone)]
pub struct OcrSpaceConfig {
    /// Our API key. Never logged.
    api_key: String,

    /// The URL we POST pages to.
    pub endpoint: String,

    /// A timeout for each request. If this is `None`, we use the transport
    /// default.
    pub timeout: Option<Duration>,
}

impl OcrSpaceConfig {
    /// Create a new configuration using the default endpoint.
    ///
    /// Fails if `api_key` is blank, because OCR.space would just reject every
    /// request.
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(anyhow!("the OCR.space API key must not be empty"));
        }
        Ok(Self {
            api_key,
            endpoint: DEFAULT_OCR_SPACE_URL.to_owned(),
            timeout: None,
        })
    }

    /// Load configuration from [`API_KEY_VAR`] and [`API_URL_VAR`].
    pub fn from_env() -> Result<Self> {
        let api_key = env::var(API_KEY_VAR).map_err(|_| {
            anyhow!("{} must be set to use OCR (see --help)", API_KEY_VAR)
        })?;
        let mut config = Self::new(api_key)
            .with_context(|| format!("{} is set, but empty", API_KEY_VAR))?;
        if let Ok(endpoint) = env::var(API_URL_VAR)
            && !endpoint.trim().is_empty()
        {
            config = config.with_endpoint(endpoint);
        }
        Ok(config)
    }

    /// Use a different endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Set a request timeout.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

// Hand-written so that we never print the API key.
impl fmt::Debug for OcrSpaceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OcrSpaceConfig")
            .field("api_key", &"<redacted>")
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// OCR client wrapping the OCR.space `parse/image` API.
#[derive(Debug)]
pub struct OcrSpaceClient {
    /// Our HTTP client.
    client: reqwest::Client,

    /// Our configuration.
    config: OcrSpaceConfig,
}

impl OcrSpaceClient {
    /// Create a new client.
    pub fn new(config: OcrSpaceConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().context("failed to build HTTP client")?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl OcrClient for OcrSpaceClient {
    #[instrument(level = "debug", skip(self, buffer), fields(size = buffer.len()))]
    async fn submit(&self, label: &str, buffer: Vec<u8>) -> Result<String, OcrError> {
        // Don't bother sending anything the server will refuse.
        let size = buffer.len();
        if !fits_upload_limit(size) {
            return Err(OcrError::RequestTooLarge { size });
        }

        // The file part uses the label as both field name and file name.
        let part = Part::bytes(buffer)
            .file_name(label.to_owned())
            .mime_str("application/pdf")?;
        let form = Form::new()
            .text("apikey", self.config.api_key.clone())
            .part(label.to_owned(), part);

        let response = self
            .client
            .post(&self.config.endpoint)
            .multipart(form)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        trace!(%status, %body, "OCR.space response");

        let result = parse_ocr_response(status, body);
        match &result {
            Ok(text) => debug!(chars = text.len(), "OCRed page"),
            Err(err) => warn!(
                status = ?err.diagnostics().map(|d| d.status),
                "OCR.space request failed"
            ),
        }
        result
    }
}

/// The parts of an OCR.space response we care about.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct OcrSpaceResponse {
    /// One result per page of the uploaded file. OCR.space sends `null` here
    /// when processing fails.
    #[serde(default)]
    parsed_results: Option<Vec<ParsedResult>>,
}

/// A single page result.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ParsedResult {
    #[serde(default)]
    parsed_text: Option<String>,
}

/// Turn an OCR.space HTTP response into the text of the first result.
pub fn parse_ocr_response(status: StatusCode, body: String) -> Result<String, OcrError> {
    if !status.is_success() {
        return Err(OcrError::Upstream(ResponseDiagnostics { status, body }));
    }

    let text = serde_json::from_str::<OcrSpaceResponse>(&body)
        .ok()
        .and_then(|response| response.parsed_results)
        .and_then(|results| results.into_iter().next())
        .and_then(|result| result.parsed_text);
    match text {
        Some(text) => Ok(text),
        None => Err(OcrError::MalformedResponse(ResponseDiagnostics {
            status,
            body,
        })),
    }
}
