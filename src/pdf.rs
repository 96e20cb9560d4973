//! Navigating PDF documents, one page at a time.
//!
//! The extractor only needs three things from a PDF: how many pages it has,
//! the "native" text of each page, and a way to cut out a single page as a
//! standalone document. We describe those with the [`PdfPages`] and
//! [`PageExport`] traits, and implement them on top of [`lopdf`].

use lopdf::{Document, ObjectId};

use crate::prelude::*;

/// A loaded PDF document which can be traversed page by page.
///
/// Page indices are 0-based and follow document order.
pub trait PdfPages: Send + Sync {
    /// The type of our single-page exports.
    type Export: PageExport;

    /// How many pages does this document have?
    fn page_count(&self) -> usize;

    /// Extract the text stored directly in the PDF for a page, without OCR.
    /// This may be empty for scanned pages.
    fn native_text(&self, page_idx: usize) -> Result<String>;

    /// Build a standalone document containing only the specified page.
    fn export_page(&self, page_idx: usize) -> Result<Self::Export>;
}

/// A standalone, single-page copy of a document.
pub trait PageExport: Send {
    /// Serialize this export to the exact bytes we would upload. Calling this
    /// twice without changing the export returns the same bytes.
    fn to_bytes(&self) -> Result<Vec<u8>>;

    /// Rewrite the content streams of every page to make them smaller. There
    /// is no guarantee about how much smaller.
    fn compress_content_streams(&mut self) -> Result<()>;
}

/// A PDF document parsed by [`lopdf`].
pub struct LopdfDocument {
    /// The parsed document.
    doc: Document,

    /// `lopdf` page numbers, in document order. These are 1-based.
    page_numbers: Vec<u32>,
}

impl LopdfDocument {
    /// Parse a PDF from an in-memory buffer.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let doc = Document::load_mem(data).context("failed to parse PDF")?;
        Ok(Self::from_document(doc))
    }

    /// Wrap an already-parsed [`Document`].
    pub fn from_document(doc: Document) -> Self {
        let page_numbers = doc.get_pages().keys().copied().collect();
        Self { doc, page_numbers }
    }

    /// Map a 0-based page index to a `lopdf` page number.
    fn page_number(&self, page_idx: usize) -> Result<u32> {
        self.page_numbers.get(page_idx).copied().ok_or_else(|| {
            anyhow!(
                "page index {} out of range (document has {} pages)",
                page_idx,
                self.page_numbers.len()
            )
        })
    }
}

impl PdfPages for LopdfDocument {
    type Export = LopdfPageExport;

    fn page_count(&self) -> usize {
        self.page_numbers.len()
    }

    fn native_text(&self, page_idx: usize) -> Result<String> {
        let page_number = self.page_number(page_idx)?;
        self.doc
            .extract_text(&[page_number])
            .with_context(|| format!("failed to extract text from page {}", page_idx))
    }

    #[instrument(level = "trace", skip(self))]
    fn export_page(&self, page_idx: usize) -> Result<LopdfPageExport> {
        let keep = self.page_number(page_idx)?;
        let others = self
            .page_numbers
            .iter()
            .copied()
            .filter(|&page_number| page_number != keep)
            .collect::<Vec<_>>();

        // Copy the whole document, then throw away everything the remaining
        // page does not reference.
        let mut doc = self.doc.clone();
        doc.delete_pages(&others);
        doc.prune_objects();
        Ok(LopdfPageExport { doc })
    }
}

/// A single-page export built by [`LopdfDocument::export_page`].
pub struct LopdfPageExport {
    doc: Document,
}

impl LopdfPageExport {
    /// How many pages does this export contain? Always 1 in practice.
    #[cfg(test)]
    pub fn page_count(&self) -> usize {
        self.doc.get_pages().len()
    }
}

impl PageExport for LopdfPageExport {
    fn to_bytes(&self) -> Result<Vec<u8>> {
        // `save_to` updates the trailer of the document it writes, so save a
        // copy.
        let mut buffer = Vec::new();
        self.doc
            .clone()
            .save_to(&mut buffer)
            .context("failed to serialize single-page PDF")?;
        Ok(buffer)
    }

    fn compress_content_streams(&mut self) -> Result<()> {
        let page_ids = self.doc.get_pages().into_values().collect::<Vec<ObjectId>>();
        for page_id in page_ids {
            for content_id in self.doc.get_page_contents(page_id) {
                let stream = self
                    .doc
                    .get_object_mut(content_id)
                    .and_then(|object| object.as_stream_mut())
                    .with_context(|| {
                        format!("content stream {:?} is not a stream", content_id)
                    })?;

                // Streams which already have a filter are left alone, because
                // we would need to decode them first.
                if stream.allows_compression && stream.dict.get(b"Filter").is_err() {
                    stream.compress().with_context(|| {
                        format!("failed to compress content stream {:?}", content_id)
                    })?;
                }
            }
        }
        Ok(())
    }
}

/// Does this object look like a compressed stream? Used by tests.
#[cfg(test)]
fn is_flate_stream(object: &lopdf::Object) -> bool {
    match object {
        lopdf::Object::Stream(stream) => stream
            .dict
            .get(b"Filter")
            .and_then(|filter| filter.as_name())
            .map(|name| name == b"FlateDecode")
            .unwrap_or(false),
        _ => false,
    }
}
