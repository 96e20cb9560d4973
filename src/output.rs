//! Output records, one per document.
//!
//! A failed document still produces a record, so that one bad PDF never
//! aborts a whole batch. Once the batch is done, we compare the failure rate
//! against what the user allowed.

use std::sync::{Arc, Mutex};

use futures::StreamExt as _;
use serde_json::Value;

use crate::{
    async_utils::{BoxedStream, io::write_output},
    extract::{ExtractError, Extraction, ExtractionStrategy},
    prelude::*,
    ui::Ui,
};

/// Output status of a document.
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    // We have the complete text of the document.
    Ok,

    // We have nothing.
    Failed,
}

/// An output record describing one document.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct ExtractOutput {
    /// The path or URL we read.
    pub source: String,

    /// Did it work?
    pub status: WorkStatus,

    /// How many pages the document has.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_count: Option<usize>,

    /// Whether we used native text or OCR.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<ExtractionStrategy>,

    /// Pages which had to be compressed before uploading.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub compressed_pages: Vec<usize>,

    /// The page which stopped us, if the failure was page-specific.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_page: Option<usize>,

    /// The text of the document.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Any errors that occurred during processing.
    pub errors: Vec<String>,
}

impl ExtractOutput {
    /// Build a record from the result of extracting a document.
    pub fn from_result(source: String, result: Result<Extraction>) -> Self {
        match result {
            Ok(extraction) => Self {
                source,
                status: WorkStatus::Ok,
                page_count: Some(extraction.page_count),
                strategy: Some(extraction.strategy),
                compressed_pages: extraction.compressed_pages,
                failed_page: None,
                text: Some(extraction.text),
                errors: vec![],
            },
            Err(err) => {
                let failed_page = err.downcast_ref::<ExtractError>().map(|e| e.page_idx());
                error!(source = %source, ?failed_page, "extraction failed: {err:#}");
                Self {
                    source,
                    status: WorkStatus::Failed,
                    page_count: None,
                    strategy: None,
                    compressed_pages: vec![],
                    failed_page,
                    text: None,
                    errors: vec![format!("{err:#}")],
                }
            }
        }
    }

    /// Convert to a JSON value.
    pub fn to_json(&self) -> Result<Value> {
        serde_json::to_value(self).context("failed to serialize output")
    }

    /// Write a stream of outputs to a [`Path`] or to standard output.
    pub async fn write_stream(
        ui: &Ui,
        path: Option<&Path>,
        stream: BoxedStream<Result<Self>>,
        allowed_failure_rate: f32,
    ) -> Result<()> {
        let (stream, counters) = OutputCounters::wrap_stream(stream);
        let output = stream.map(|output| output?.to_json()).boxed();
        write_output(path, output).await?;
        counters.finish(ui, allowed_failure_rate)
    }
}

/// Counters for a batch of documents.
#[derive(Clone, Debug, Default)]
pub struct OutputCounters {
    /// How many documents did we process?
    pub total_record_count: usize,

    /// How many documents did we fail to process?
    pub failure_count: usize,

    /// How many pages needed compression?
    pub compressed_page_count: usize,
}

impl OutputCounters {
    /// Wrap a stream with counters.
    pub fn wrap_stream(
        stream: BoxedStream<Result<ExtractOutput>>,
    ) -> (BoxedStream<Result<ExtractOutput>>, Arc<Mutex<OutputCounters>>) {
        let counters = Arc::new(Mutex::new(Self::default()));
        let counters_clone = counters.clone();
        let stream = stream
            .map(move |value| {
                let value = value?;
                counters_clone.update(&value);
                Ok(value)
            })
            .boxed();
        (stream, counters)
    }

    /// What fraction of documents failed?
    pub fn failure_rate(&self) -> f32 {
        if self.total_record_count == 0 {
            0.0
        } else {
            self.failure_count as f32 / self.total_record_count as f32
        }
    }
}

/// We actually want to put methods in `Mutex<OutputCounters>`, because that's
/// the type we actually work with. To do that, we need to define an extension
/// trait with the methods we want.
pub trait OutputCounterExt {
    /// Update counters for an output record.
    fn update(&self, item: &ExtractOutput);

    /// Display counter values to the user, and fail if too many documents
    /// failed.
    fn finish(self: Arc<Self>, ui: &Ui, allowed_failure_rate: f32) -> Result<()>;
}

impl OutputCounterExt for Mutex<OutputCounters> {
    fn update(&self, item: &ExtractOutput) {
        // Hold a sync lock, but just for an instant to update counters.
        let mut counters = self.lock().expect("lock poisoned");
        counters.total_record_count += 1;
        if item.status != WorkStatus::Ok {
            counters.failure_count += 1;
        }
        counters.compressed_page_count += item.compressed_pages.len();
    }

    fn finish(self: Arc<Self>, ui: &Ui, allowed_failure_rate: f32) -> Result<()> {
        let counters = self.lock().expect("lock poisoned").to_owned();
        if counters.compressed_page_count > 0 {
            ui.display_message(
                "🗜️",
                &format!(
                    "{} pages were compressed to fit the upload limit",
                    counters.compressed_page_count
                ),
            );
        }
        let failure_rate = counters.failure_rate();
        if failure_rate > allowed_failure_rate {
            Err(anyhow!(
                "{}/{} ({:.2}%) of documents failed, but only {:.2}% were allowed",
                counters.failure_count,
                counters.total_record_count,
                failure_rate * 100.0,
                allowed_failure_rate * 100.0
            ))
        } else {
            if counters.failure_count > 0 {
                ui.display_message(
                    "❌",
                    &format!(
                        "{} documents could not be processed",
                        counters.failure_count
                    ),
                );
            }
            Ok(())
        }
    }
}
