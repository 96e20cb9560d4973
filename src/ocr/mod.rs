//! OCR client interface.
//!
//! The extractor talks to OCR services through the [`OcrClient`] trait, which
//! takes one serialized single-page PDF and returns its text. The only real
//! implementation is [`ocr_space::OcrSpaceClient`], but tests plug in stubs.

use std::{error, fmt};

use reqwest::StatusCode;

use crate::prelude::*;

pub mod ocr_space;

/// The largest upload the OCR service accepts is one byte _less_ than this.
pub const MAX_UPLOAD_BYTES: usize = 1024 * 1024;

/// Is this buffer small enough to upload?
pub fn fits_upload_limit(size: usize) -> bool {
    size < MAX_UPLOAD_BYTES
}

/// Interface to an OCR service.
#[async_trait]
pub trait OcrClient: Send + Sync + 'static {
    /// OCR a serialized single-page PDF, uploaded under `label`.
    ///
    /// Implementations must reject buffers which don't fit in
    /// [`MAX_UPLOAD_BYTES`] without making a request.
    async fn submit(&self, label: &str, buffer: Vec<u8>) -> Result<String, OcrError>;
}

/// Details of an HTTP response we couldn't use.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponseDiagnostics {
    /// The HTTP status.
    pub status: StatusCode,

    /// The raw response body.
    pub body: String,
}

impl fmt::Display for ResponseDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.status.as_u16(), self.body)
    }
}

/// An error returned by an [`OcrClient`].
#[derive(Debug)]
pub enum OcrError {
    /// The buffer was too large to upload.
    RequestTooLarge { size: usize },

    /// The service returned a non-success status.
    Upstream(ResponseDiagnostics),

    /// The service returned success, but we couldn't find any text in the
    /// response.
    MalformedResponse(ResponseDiagnostics),

    /// We couldn't talk to the service at all.
    Transport(reqwest::Error),
}

impl OcrError {
    /// The HTTP response details, if we got a response.
    pub fn diagnostics(&self) -> Option<&ResponseDiagnostics> {
        match self {
            OcrError::Upstream(diagnostics)
            | OcrError::MalformedResponse(diagnostics) => Some(diagnostics),
            OcrError::RequestTooLarge { .. } | OcrError::Transport(_) => None,
        }
    }
}

impl fmt::Display for OcrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OcrError::RequestTooLarge { size } => {
                write!(f, "API request failed: page too large, {size} bytes")
            }
            // Both of these mean "we got an unusable response", so we report
            // them the same way.
            OcrError::Upstream(diagnostics)
            | OcrError::MalformedResponse(diagnostics) => {
                write!(f, "API request failed: {diagnostics}")
            }
            OcrError::Transport(_) => write!(f, "API request failed"),
        }
    }
}

impl error::Error for OcrError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            OcrError::Transport(err) => Some(err),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for OcrError {
    fn from(err: reqwest::Error) -> Self {
        OcrError::Transport(err)
    }
}
