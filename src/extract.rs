//! Extracting the text of a whole document.
//!
//! For each page, we cut out a single-page PDF, make sure it fits under the
//! OCR upload limit (compressing it once if it doesn't), and send it to an
//! [`OcrClient`]. The page texts are concatenated in page order. The first
//! failing page aborts the whole document, because a document with a silently
//! missing page is worse than no document at all.
//!
//! Optionally, if the text already stored in the PDF is good enough according
//! to a [`TextSufficiency`] policy, we skip OCR entirely.

use std::{error, fmt, sync::Arc};

use crate::{
    ocr::{OcrClient, OcrError, fits_upload_limit},
    pdf::{PageExport, PdfPages},
    prelude::*,
    source::{PdfSource, load_document},
};

/// Decides whether the native text of a document is good enough to use
/// without OCR.
#[derive(Clone, Default)]
pub enum TextSufficiency {
    /// Never trust native text. Every page is OCRed.
    #[default]
    Never,

    /// Trust native text with at least this many non-whitespace characters.
    MinChars(usize),

    /// Use a custom predicate.
    Custom(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl TextSufficiency {
    /// Is `native_text` good enough to skip OCR?
    pub fn is_sufficient(&self, native_text: &str) -> bool {
        match self {
            TextSufficiency::Never => false,
            TextSufficiency::MinChars(min_chars) => {
                let chars = native_text.chars().filter(|c| !c.is_whitespace()).count();
                chars >= *min_chars
            }
            TextSufficiency::Custom(predicate) => predicate(native_text),
        }
    }
}

impl fmt::Debug for TextSufficiency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TextSufficiency::Never => write!(f, "Never"),
            TextSufficiency::MinChars(n) => f.debug_tuple("MinChars").field(n).finish(),
            TextSufficiency::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// How did we get our text?
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStrategy {
    /// Text stored in the PDF itself.
    Native,

    /// Page-by-page OCR.
    Ocr,
}

/// The result of extracting a document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Extraction {
    /// The text of every page, concatenated in page order with no separators.
    pub text: String,

    /// The number of pages in the document.
    pub page_count: usize,

    /// How we got `text`. This applies to every page.
    pub strategy: ExtractionStrategy,

    /// Pages which needed compression before we could upload them.
    pub compressed_pages: Vec<usize>,
}

/// An error which aborted extraction of a document.
#[derive(Debug)]
pub enum ExtractError {
    /// A page was still too large to upload after compression.
    PageTooLarge { page_idx: usize, size: usize },

    /// The OCR client failed for a page.
    Ocr { page_idx: usize, source: OcrError },

    /// We couldn't export or serialize a page.
    Pdf {
        page_idx: usize,
        source: anyhow::Error,
    },
}

impl ExtractError {
    /// The page which caused this error.
    pub fn page_idx(&self) -> usize {
        match self {
            ExtractError::PageTooLarge { page_idx, .. }
            | ExtractError::Ocr { page_idx, .. }
            | ExtractError::Pdf { page_idx, .. } => *page_idx,
        }
    }
}

impl fmt::Display for ExtractError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractError::PageTooLarge { page_idx, size } => write!(
                f,
                "API request failed: page {page_idx} too large, {size} bytes"
            ),
            // The underlying error is available through `source()`.
            ExtractError::Ocr { page_idx, .. } => write!(f, "could not OCR page {page_idx}"),
            ExtractError::Pdf { page_idx, .. } => {
                write!(f, "could not prepare page {page_idx}")
            }
        }
    }
}

impl error::Error for ExtractError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            ExtractError::PageTooLarge { .. } => None,
            ExtractError::Ocr { source, .. } => Some(source),
            ExtractError::Pdf { source, .. } => Some(&**source),
        }
    }
}

/// The label we upload a page under.
pub fn page_label(source_id: &str, page_idx: usize) -> String {
    format!("{source_id}_p{page_idx}.pdf")
}

/// Text for a single OCRed page.
struct PageText {
    text: String,
    compressed: bool,
}

/// Extracts text from documents, using OCR when needed.
#[derive(Clone)]
pub struct Extractor {
    /// The OCR service.
    ocr: Arc<dyn OcrClient>,

    /// When can we skip OCR?
    text_sufficiency: TextSufficiency,
}

impl Extractor {
    /// Create an extractor which always uses OCR.
    pub fn new(ocr: Arc<dyn OcrClient>) -> Self {
        Self {
            ocr,
            text_sufficiency: TextSufficiency::default(),
        }
    }

    /// Allow native text to be used when `text_sufficiency` approves of it.
    pub fn with_text_sufficiency(mut self, text_sufficiency: TextSufficiency) -> Self {
        self.text_sufficiency = text_sufficiency;
        self
    }

    /// Load a document from `source` and extract its text.
    #[instrument(level = "debug", skip_all, fields(id = %source.identifier()))]
    pub async fn extract_source(
        &self,
        source: &PdfSource,
        http: &reqwest::Client,
    ) -> Result<Extraction> {
        let doc = load_document(source, http).await?;
        Ok(self.extract(&doc, &source.identifier()).await?)
    }

    /// Extract the text of `doc`. `source_id` is used to label OCR uploads.
    #[instrument(level = "debug", skip_all, fields(id = %source_id))]
    pub async fn extract<D: PdfPages>(
        &self,
        doc: &D,
        source_id: &str,
    ) -> Result<Extraction, ExtractError> {
        let page_count = doc.page_count();
        info!(id = %source_id, "{} pages", page_count);

        if let Some(text) = self.sufficient_native_text(doc) {
            debug!("native text is sufficient, skipping OCR");
            return Ok(Extraction {
                text,
                page_count,
                strategy: ExtractionStrategy::Native,
                compressed_pages: vec![],
            });
        }

        // Strictly one page at a time, in order.
        let mut text = String::new();
        let mut compressed_pages = vec![];
        for page_idx in 0..page_count {
            let page = self.ocr_page(doc, source_id, page_idx).await?;
            if page.compressed {
                compressed_pages.push(page_idx);
            }
            text.push_str(&page.text);
        }
        Ok(Extraction {
            text,
            page_count,
            strategy: ExtractionStrategy::Ocr,
            compressed_pages,
        })
    }

    /// Return the document's native text if our policy says it's enough.
    fn sufficient_native_text<D: PdfPages>(&self, doc: &D) -> Option<String> {
        if matches!(self.text_sufficiency, TextSufficiency::Never) {
            return None;
        }

        let mut text = String::new();
        for page_idx in 0..doc.page_count() {
            match doc.native_text(page_idx) {
                Ok(page_text) => text.push_str(&page_text),
                // OCR will get another shot at this page.
                Err(err) => warn!(page = page_idx, "native text extraction failed: {err:#}"),
            }
        }
        self.text_sufficiency.is_sufficient(&text).then_some(text)
    }

    /// Prepare and OCR a single page.
    #[instrument(level = "debug", skip(self, doc, source_id))]
    async fn ocr_page<D: PdfPages>(
        &self,
        doc: &D,
        source_id: &str,
        page_idx: usize,
    ) -> Result<PageText, ExtractError> {
        let pdf_err = |source| ExtractError::Pdf { page_idx, source };

        let mut export = doc.export_page(page_idx).map_err(pdf_err)?;
        let mut buffer = export.to_bytes().map_err(pdf_err)?;
        let mut compressed = false;
        if !fits_upload_limit(buffer.len()) {
            debug!(size = buffer.len(), "page too large to upload, compressing");
            export.compress_content_streams().map_err(pdf_err)?;
            buffer = export.to_bytes().map_err(pdf_err)?;
            compressed = true;
            debug!(size = buffer.len(), "compressed page");
            if !fits_upload_limit(buffer.len()) {
                return Err(ExtractError::PageTooLarge {
                    page_idx,
                    size: buffer.len(),
                });
            }
        }
        drop(export);

        // `submit` takes ownership of the buffer, so it's released as soon as
        // the upload is done.
        let label = page_label(source_id, page_idx);
        let text = self
            .ocr
            .submit(&label, buffer)
            .await
            .map_err(|source| ExtractError::Ocr { page_idx, source })?;
        Ok(PageText { text, compressed })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };

    use reqwest::StatusCode;

    use super::*;
    use crate::{
        ocr::{MAX_UPLOAD_BYTES, ResponseDiagnostics},
        pdf::{LopdfDocument, test_pdfs::build_pdf},
    };

    const MIB: usize = 1024 * 1024;

    /// Something that happened to one of our stubs.
    #[derive(Clone, Debug, PartialEq, Eq)]
    enum Event {
        Export(usize),
        Compress(usize),
        Submit { label: String, size: usize },
    }

    /// A shared event log.
    #[derive(Clone, Default)]
    struct Events(Arc<Mutex<Vec<Event>>>);

    impl Events {
        fn push(&self, event: Event) {
            self.0.lock().expect("lock poisoned").push(event);
        }

        fn all(&self) -> Vec<Event> {
            self.0.lock().expect("lock poisoned").clone()
        }

        fn compressions(&self) -> usize {
            self.all()
                .iter()
                .filter(|e| matches!(e, Event::Compress(_)))
                .count()
        }

        fn submissions(&self) -> Vec<(String, usize)> {
            self.all()
                .into_iter()
                .filter_map(|e| match e {
                    Event::Submit { label, size } => Some((label, size)),
                    _ => None,
                })
                .collect()
        }
    }

    /// A fake page with fixed serialized sizes.
    #[derive(Clone)]
    struct StubPage {
        native_text: String,
        raw_size: usize,
        compressed_size: usize,
    }

    impl StubPage {
        fn small() -> Self {
            Self::sized(10 * 1024, 10 * 1024)
        }

        fn sized(raw_size: usize, compressed_size: usize) -> Self {
            Self {
                native_text: String::new(),
                raw_size,
                compressed_size,
            }
        }

        fn with_native_text(mut self, text: &str) -> Self {
            self.native_text = text.to_owned();
            self
        }
    }

    struct StubDocument {
        pages: Vec<StubPage>,
        events: Events,
    }

    impl StubDocument {
        fn new(pages: Vec<StubPage>, events: &Events) -> Self {
            Self {
                pages,
                events: events.clone(),
            }
        }
    }

    impl PdfPages for StubDocument {
        type Export = StubExport;

        fn page_count(&self) -> usize {
            self.pages.len()
        }

        fn native_text(&self, page_idx: usize) -> Result<String> {
            Ok(self.pages[page_idx].native_text.clone())
        }

        fn export_page(&self, page_idx: usize) -> Result<StubExport> {
            self.events.push(Event::Export(page_idx));
            Ok(StubExport {
                page_idx,
                page: self.pages[page_idx].clone(),
                compressed: false,
                events: self.events.clone(),
            })
        }
    }

    struct StubExport {
        page_idx: usize,
        page: StubPage,
        compressed: bool,
        events: Events,
    }

    impl PageExport for StubExport {
        fn to_bytes(&self) -> Result<Vec<u8>> {
            let size = if self.compressed {
                self.page.compressed_size
            } else {
                self.page.raw_size
            };
            Ok(vec![b'%'; size])
        }

        fn compress_content_streams(&mut self) -> Result<()> {
            self.events.push(Event::Compress(self.page_idx));
            self.compressed = true;
            Ok(())
        }
    }

    /// An OCR client which returns canned responses in order.
    struct StubOcr {
        responses: Mutex<VecDeque<Result<String, OcrError>>>,
        events: Events,
    }

    impl StubOcr {
        fn new(
            responses: Vec<Result<String, OcrError>>,
            events: &Events,
        ) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                events: events.clone(),
            })
        }

        fn texts(texts: &[&str], events: &Events) -> Arc<Self> {
            Self::new(texts.iter().map(|t| Ok(t.to_string())).collect(), events)
        }
    }

    #[async_trait]
    impl OcrClient for StubOcr {
        async fn submit(
            &self,
            label: &str,
            buffer: Vec<u8>,
        ) -> Result<String, OcrError> {
            if !fits_upload_limit(buffer.len()) {
                return Err(OcrError::RequestTooLarge { size: buffer.len() });
            }
            self.events.push(Event::Submit {
                label: label.to_owned(),
                size: buffer.len(),
            });
            self.responses
                .lock()
                .expect("lock poisoned")
                .pop_front()
                .expect("stub OCR ran out of responses")
        }
    }

    /// An OCR client which names the page it was given, by parsing the PDF.
    struct EchoPdfOcr;

    #[async_trait]
    impl OcrClient for EchoPdfOcr {
        async fn submit(
            &self,
            label: &str,
            buffer: Vec<u8>,
        ) -> Result<String, OcrError> {
            let doc = LopdfDocument::from_bytes(&buffer).expect("upload should be a PDF");
            assert_eq!(doc.page_count(), 1, "{label} should have one page");
            Ok(format!(
                "[{}]",
                doc.native_text(0).expect("page should have text").trim()
            ))
        }
    }

    #[tokio::test]
    async fn empty_documents_make_no_ocr_calls() -> Result<()> {
        let events = Events::default();
        let doc = StubDocument::new(vec![], &events);
        let extractor = Extractor::new(StubOcr::texts(&[], &events));
        let extraction = extractor.extract(&doc, "empty.pdf").await?;
        assert_eq!(extraction.text, "");
        assert_eq!(extraction.page_count, 0);
        assert!(events.all().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn pages_are_ocred_and_joined_in_order() -> Result<()> {
        let events = Events::default();
        let doc = StubDocument::new(vec![StubPage::small(); 3], &events);
        let extractor = Extractor::new(StubOcr::texts(&["A", "B", "C"], &events));
        let extraction = extractor.extract(&doc, "doc.pdf").await?;
        assert_eq!(extraction.text, "ABC");
        assert_eq!(extraction.strategy, ExtractionStrategy::Ocr);
        assert!(extraction.compressed_pages.is_empty());
        assert_eq!(events.compressions(), 0);
        let labels = events
            .submissions()
            .into_iter()
            .map(|(label, _)| label)
            .collect::<Vec<_>>();
        assert_eq!(labels, ["doc.pdf_p0.pdf", "doc.pdf_p1.pdf", "doc.pdf_p2.pdf"]);
        Ok(())
    }

    #[tokio::test]
    async fn oversize_pages_are_compressed_once() -> Result<()> {
        let events = Events::default();
        let doc = StubDocument::new(vec![StubPage::sized(2 * MIB, MIB / 2)], &events);
        let extractor = Extractor::new(StubOcr::texts(&["X"], &events));
        let extraction = extractor.extract(&doc, "big.pdf").await?;
        assert_eq!(extraction.text, "X");
        assert_eq!(extraction.compressed_pages, [0]);
        assert_eq!(events.compressions(), 1);

        // Only the compressed version was uploaded.
        assert_eq!(
            events.submissions(),
            [("big.pdf_p0.pdf".to_owned(), MIB / 2)]
        );
        Ok(())
    }

    #[tokio::test]
    async fn upload_limit_boundary() -> Result<()> {
        let events = Events::default();
        let doc = StubDocument::new(
            vec![
                StubPage::sized(MAX_UPLOAD_BYTES - 1, 1),
                StubPage::sized(MAX_UPLOAD_BYTES, MAX_UPLOAD_BYTES - 1),
            ],
            &events,
        );
        let extractor = Extractor::new(StubOcr::texts(&["a", "b"], &events));
        let extraction = extractor.extract(&doc, "edge.pdf").await?;
        assert_eq!(extraction.text, "ab");
        assert_eq!(extraction.compressed_pages, [1]);
        assert_eq!(
            events.submissions(),
            [
                ("edge.pdf_p0.pdf".to_owned(), MAX_UPLOAD_BYTES - 1),
                ("edge.pdf_p1.pdf".to_owned(), MAX_UPLOAD_BYTES - 1),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn incompressible_pages_abort_the_document() -> Result<()> {
        let events = Events::default();
        let doc = StubDocument::new(
            vec![
                StubPage::small(),
                StubPage::sized(3 * MIB, MAX_UPLOAD_BYTES),
                StubPage::small(),
            ],
            &events,
        );
        let extractor = Extractor::new(StubOcr::texts(&["A", "B", "C"], &events));
        let err = extractor.extract(&doc, "doc.pdf").await.unwrap_err();
        match err {
            ExtractError::PageTooLarge { page_idx, size } => {
                assert_eq!(page_idx, 1);
                assert_eq!(size, MAX_UPLOAD_BYTES);
            }
            other => panic!("expected PageTooLarge, got {other:?}"),
        }
        assert_eq!(events.submissions().len(), 1);
        assert!(!events.all().contains(&Event::Export(2)));
        Ok(())
    }

    #[tokio::test]
    async fn ocr_failures_abort_the_document() -> Result<()> {
        let events = Events::default();
        let doc = StubDocument::new(vec![StubPage::small(); 3], &events);
        let responses = vec![
            Ok("A".to_owned()),
            Err(OcrError::Upstream(ResponseDiagnostics {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: "boom".to_owned(),
            })),
            Ok("C".to_owned()),
        ];
        let extractor = Extractor::new(StubOcr::new(responses, &events));
        let err = extractor.extract(&doc, "doc.pdf").await.unwrap_err();
        assert_eq!(err.page_idx(), 1);
        match &err {
            ExtractError::Ocr {
                source: OcrError::Upstream(diagnostics),
                ..
            } => {
                assert_eq!(diagnostics.status, StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(diagnostics.body, "boom");
            }
            other => panic!("expected upstream OCR error, got {other:?}"),
        }
        assert_eq!(events.submissions().len(), 2);
        assert!(!events.all().contains(&Event::Export(2)));
        assert_eq!(
            format!("{:#}", anyhow::Error::new(err)),
            "could not OCR page 1: API request failed: 500, boom"
        );
        Ok(())
    }

    #[tokio::test]
    async fn extraction_is_repeatable() -> Result<()> {
        let events = Events::default();
        let doc = StubDocument::new(
            vec![StubPage::small(), StubPage::sized(2 * MIB, MIB / 4)],
            &events,
        );
        let extractor =
            Extractor::new(StubOcr::texts(&["one", "two", "one", "two"], &events));
        let first = extractor.extract(&doc, "doc.pdf").await?;
        let second = extractor.extract(&doc, "doc.pdf").await?;
        assert_eq!(first, second);
        assert_eq!(first.text, "onetwo");
        Ok(())
    }

    #[tokio::test]
    async fn ocr_runs_by_default_even_with_native_text() -> Result<()> {
        let events = Events::default();
        let doc = StubDocument::new(
            vec![StubPage::small().with_native_text("plenty of native text")],
            &events,
        );
        let extractor = Extractor::new(StubOcr::texts(&["ocr text"], &events));
        let extraction = extractor.extract(&doc, "doc.pdf").await?;
        assert_eq!(extraction.text, "ocr text");
        assert_eq!(extraction.strategy, ExtractionStrategy::Ocr);
        Ok(())
    }

    #[tokio::test]
    async fn sufficient_native_text_skips_ocr() -> Result<()> {
        let events = Events::default();
        let doc = StubDocument::new(
            vec![
                StubPage::small().with_native_text("Hello "),
                StubPage::small().with_native_text("world"),
            ],
            &events,
        );
        let extractor = Extractor::new(StubOcr::texts(&[], &events))
            .with_text_sufficiency(TextSufficiency::MinChars(10));
        let extraction = extractor.extract(&doc, "doc.pdf").await?;
        assert_eq!(extraction.text, "Hello world");
        assert_eq!(extraction.strategy, ExtractionStrategy::Native);
        assert!(events.all().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn insufficient_native_text_falls_back_to_ocr() -> Result<()> {
        let events = Events::default();
        let doc = StubDocument::new(
            vec![
                StubPage::small().with_native_text("  "),
                StubPage::small().with_native_text("hi"),
            ],
            &events,
        );
        let extractor = Extractor::new(StubOcr::texts(&["scanned ", "page"], &events))
            .with_text_sufficiency(TextSufficiency::MinChars(10));
        let extraction = extractor.extract(&doc, "doc.pdf").await?;
        assert_eq!(extraction.text, "scanned page");
        assert_eq!(extraction.strategy, ExtractionStrategy::Ocr);
        Ok(())
    }

    #[test]
    fn custom_sufficiency_predicates_are_used() {
        let policy = TextSufficiency::Custom(Arc::new(|text| text.contains("ok")));
        assert!(policy.is_sufficient("this is ok"));
        assert!(!policy.is_sufficient("nope"));
        assert!(!TextSufficiency::Never.is_sufficient("anything at all"));
        assert!(TextSufficiency::MinChars(0).is_sufficient(""));
    }

    #[test]
    fn labels_include_source_and_page() {
        assert_eq!(page_label("scans/a.pdf", 0), "scans/a.pdf_p0.pdf");
        assert_eq!(page_label("https://x/y.pdf", 12), "https://x/y.pdf_p12.pdf");
    }

    #[tokio::test]
    async fn real_pdfs_are_split_into_single_pages() -> Result<()> {
        let doc = LopdfDocument::from_bytes(&build_pdf(&["first", "second"], 0))?;
        let extractor = Extractor::new(Arc::new(EchoPdfOcr));
        let extraction = extractor.extract(&doc, "real.pdf").await?;
        assert_eq!(extraction.page_count, 2);
        assert_eq!(extraction.text, "[first][second]");
        Ok(())
    }
}
