//! The `extract` subcommand.

use std::{sync::Arc, time::Duration};

use clap::Args;
use futures::{FutureExt as _, StreamExt as _, stream};

use crate::{
    extract::{Extractor, TextSufficiency},
    ocr::ocr_space::{OcrSpaceClient, OcrSpaceConfig},
    output::ExtractOutput,
    prelude::*,
    source::{PdfSource, fetch_client},
    ui::{ProgressConfig, Ui},
};

/// Options for the `extract` subcommand.
#[derive(Debug, Args)]
pub struct ExtractOpts {
    /// PDF files or `http(s)://` URLs to extract text from. Use `-` to read a
    /// PDF from standard input.
    #[clap(required = true)]
    pub sources: Vec<PdfSource>,

    /// Output path, in JSONL format. Defaults to standard output.
    #[clap(short = 'o', long = "output")]
    pub output_path: Option<PathBuf>,

    /// Max number of documents to process at a time. Pages within a document
    /// are always processed one at a time.
    #[clap(short = 'j', long = "jobs", default_value = "1")]
    pub job_count: usize,

    /// Skip OCR when the text embedded in a PDF has at least this many
    /// non-whitespace characters. By default, every document is OCRed.
    #[clap(long)]
    pub min_native_chars: Option<usize>,

    /// A timeout, in seconds, for each OCR request.
    #[clap(long)]
    pub timeout: Option<u64>,

    /// What portion of documents should we allow to fail? Specified as a
    /// number between 0.0 and 1.0.
    #[clap(long, default_value = "0.0")]
    pub allowed_failure_rate: f32,
}

impl ExtractOpts {
    /// Build an [`Extractor`] from our options and the environment.
    fn extractor(&self) -> Result<Extractor> {
        let config = OcrSpaceConfig::from_env()?
            .with_timeout(self.timeout.map(Duration::from_secs));
        debug!(?config, "OCR configuration");
        let ocr = OcrSpaceClient::new(config)?;
        let mut extractor = Extractor::new(Arc::new(ocr));
        if let Some(min_chars) = self.min_native_chars {
            extractor =
                extractor.with_text_sufficiency(TextSufficiency::MinChars(min_chars));
        }
        Ok(extractor)
    }
}

/// Run the `extract` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_extract(ui: Ui, opts: &ExtractOpts) -> Result<()> {
    // Check our configuration before we touch any documents.
    let extractor = opts.extractor()?;
    let http = fetch_client()?;

    // Configure our progress bar.
    let pb = ui.new_progress_bar(
        &ProgressConfig {
            emoji: "📄",
            msg: "Extracting PDFs",
            done_msg: "Extracted PDFs",
        },
        u64::try_from(opts.sources.len()).context("too many sources")?,
    );

    // Each document becomes one output record, whether or not it worked.
    let outputs = stream::iter(opts.sources.clone())
        .map(move |source| {
            let extractor = extractor.clone();
            let http = http.clone();
            async move {
                let source = source.read_stdin_if_requested().await?;
                let result = extractor.extract_source(&source, &http).await;
                Ok::<_, anyhow::Error>(ExtractOutput::from_result(
                    source.identifier(),
                    result,
                ))
            }
            .boxed()
        })
        .buffered(opts.job_count.max(1));
    let outputs = pb.wrap_stream(outputs).boxed();

    ExtractOutput::write_stream(
        &ui,
        opts.output_path.as_deref(),
        outputs,
        opts.allowed_failure_rate,
    )
    .await
}
