//! Document loading, splitting, and reassembly.
//!
//! Multi-page TIFFs are decoded and re-encoded with the tiff crate
//! directly (lossless LZW, resolution tags preserved, BigTIFF for large
//! outputs). PDFs are rasterized through poppler's `pdftoppm` and then
//! treated as page images. Decoding is lazy where it matters: the
//! batched pipeline path pulls pages through [`PageReader`] so peak
//! memory stays proportional to the batch size, not the document.

mod pdf;
mod tiff;

use ::tiff::encoder::compression::{Lzw, Uncompressed};
use image::RgbImage;
use thiserror::Error;
use tracing::{debug, info};

use crate::models::{DocumentFormat, DocumentMetadata};

pub use self::tiff::StreamingTiffWriter;

/// A decoded page, always RGB8 in memory.
pub type PageImage = RgbImage;

/// Errors from document decode/encode.
#[derive(Debug, Error)]
pub enum DocumentError {
    /// The input bytes could not be decoded. Terminal; retrying cannot
    /// fix a malformed document.
    #[error("unreadable document: {0}")]
    Format(String),

    #[error("unsupported format: {0}")]
    Unsupported(String),

    #[error("external tool not found: {0}")]
    ToolNotFound(String),

    #[error("document encoding failed: {0}")]
    Encode(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Pages beyond this count are written through the streaming encoder.
pub const DEFAULT_STREAMING_THRESHOLD: usize = 50;

/// Splits rasters into pages and reassembles them.
#[derive(Debug, Clone)]
pub struct DocumentProcessor {
    streaming_threshold: usize,
    /// DPI used when rasterizing PDFs.
    rasterize_dpi: u32,
}

impl Default for DocumentProcessor {
    fn default() -> Self {
        Self {
            streaming_threshold: DEFAULT_STREAMING_THRESHOLD,
            rasterize_dpi: 300,
        }
    }
}

impl DocumentProcessor {
    pub fn new(streaming_threshold: usize) -> Self {
        Self {
            streaming_threshold,
            ..Self::default()
        }
    }

    /// Detect the container format from content, not filename.
    ///
    /// The TIFF magic is checked directly because BigTIFF (version 43,
    /// which the streaming writer emits) is not in infer's tables.
    pub fn detect_format(bytes: &[u8]) -> Result<DocumentFormat, DocumentError> {
        if is_tiff_magic(bytes) {
            return Ok(DocumentFormat::Tiff);
        }
        let mime = infer::get(bytes)
            .map(|t| t.mime_type())
            .ok_or_else(|| DocumentError::Format("unrecognized file content".to_string()))?;
        DocumentFormat::from_mime(mime)
            .ok_or_else(|| DocumentError::Unsupported(mime.to_string()))
    }

    /// Open a document for lazy page iteration.
    pub fn open(&self, bytes: &[u8]) -> Result<PageReader, DocumentError> {
        match Self::detect_format(bytes)? {
            DocumentFormat::Tiff => {
                let reader = tiff::TiffPageReader::open(bytes)?;
                Ok(PageReader::Tiff(reader))
            }
            DocumentFormat::Pdf => {
                let reader = pdf::PdfPageReader::rasterize(bytes, self.rasterize_dpi)?;
                Ok(PageReader::Pdf(reader))
            }
        }
    }

    /// Decode a whole multi-page raster into memory.
    pub fn load(&self, bytes: &[u8]) -> Result<(Vec<PageImage>, DocumentMetadata), DocumentError> {
        let mut reader = self.open(bytes)?;
        let mut pages = Vec::with_capacity(reader.page_count() as usize);
        while let Some(page) = reader.next_page()? {
            pages.push(page);
        }
        let metadata = reader.into_metadata();
        info!(
            pages = pages.len(),
            dpi = ?metadata.dpi,
            "loaded document"
        );
        Ok((pages, metadata))
    }

    /// Re-encode pages as a multi-page TIFF with lossless LZW, keeping
    /// the input DPI. Large documents go through the streaming writer so
    /// peak memory is one encoded page, and come out as BigTIFF.
    pub fn save(
        &self,
        pages: &[PageImage],
        metadata: &DocumentMetadata,
        target_format: Option<DocumentFormat>,
    ) -> Result<Vec<u8>, DocumentError> {
        if let Some(format) = target_format {
            if format != DocumentFormat::Tiff {
                return Err(DocumentError::Unsupported(format!(
                    "output format {:?}; masked documents are reassembled as TIFF",
                    format
                )));
            }
        }
        if pages.is_empty() {
            return Err(DocumentError::Encode("cannot save empty document".to_string()));
        }

        let dpi = metadata.dpi_or_default();
        if pages.len() > self.streaming_threshold {
            debug!(pages = pages.len(), "streaming save (BigTIFF)");
            let mut writer = StreamingTiffWriter::create(dpi)?;
            for page in pages {
                writer.append_page(page)?;
            }
            writer.finish()
        } else {
            tiff::encode_multipage(pages, dpi, Lzw)
        }
    }

    /// Re-encode pages for the OCR call. If the estimated uncompressed
    /// footprint exceeds `max_size_mb`, apply lossless LZW; otherwise
    /// re-encode uncompressed. Either way the output decodes to geometry
    /// identical to the input: lossy compression would invalidate every
    /// OCR coordinate downstream.
    pub fn optimize_for_ocr(
        &self,
        pages: &[PageImage],
        max_size_mb: u64,
        metadata: &DocumentMetadata,
    ) -> Result<Vec<u8>, DocumentError> {
        if pages.is_empty() {
            return Err(DocumentError::Encode("cannot encode empty page set".to_string()));
        }
        let estimated: u64 = pages
            .iter()
            .map(|p| p.width() as u64 * p.height() as u64 * 3)
            .sum();
        let dpi = metadata.dpi_or_default();
        if estimated > max_size_mb * 1024 * 1024 {
            debug!(estimated, "compressing pages for OCR");
            tiff::encode_multipage(pages, dpi, Lzw)
        } else {
            tiff::encode_multipage(pages, dpi, Uncompressed)
        }
    }
}

/// Classic TIFF (version 42) or BigTIFF (version 43), either byte order.
fn is_tiff_magic(bytes: &[u8]) -> bool {
    if bytes.len() < 4 {
        return false;
    }
    matches!(
        &bytes[..4],
        [0x49, 0x49, 0x2A, 0x00]
            | [0x49, 0x49, 0x2B, 0x00]
            | [0x4D, 0x4D, 0x00, 0x2A]
            | [0x4D, 0x4D, 0x00, 0x2B]
    )
}

/// Lazy page source for the batched pipeline path.
pub enum PageReader {
    Tiff(tiff::TiffPageReader),
    Pdf(pdf::PdfPageReader),
}

impl PageReader {
    /// Total pages in the document, known up front.
    pub fn page_count(&self) -> u32 {
        match self {
            Self::Tiff(r) => r.page_count(),
            Self::Pdf(r) => r.page_count(),
        }
    }

    pub fn metadata(&self) -> &DocumentMetadata {
        match self {
            Self::Tiff(r) => r.metadata(),
            Self::Pdf(r) => r.metadata(),
        }
    }

    pub fn into_metadata(self) -> DocumentMetadata {
        match self {
            Self::Tiff(r) => r.into_metadata(),
            Self::Pdf(r) => r.into_metadata(),
        }
    }

    /// Decode the next page, or None past the last page.
    pub fn next_page(&mut self) -> Result<Option<PageImage>, DocumentError> {
        match self {
            Self::Tiff(r) => r.next_page(),
            Self::Pdf(r) => r.next_page(),
        }
    }

    /// Decode up to `n` pages. An empty vec means the document is
    /// exhausted.
    pub fn read_batch(&mut self, n: usize) -> Result<Vec<PageImage>, DocumentError> {
        let mut batch = Vec::with_capacity(n);
        while batch.len() < n {
            match self.next_page()? {
                Some(page) => batch.push(page),
                None => break,
            }
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn solid_page(w: u32, h: u32, value: u8) -> PageImage {
        RgbImage::from_pixel(w, h, Rgb([value, value, value]))
    }

    #[test]
    fn test_detect_format_rejects_garbage() {
        let err = DocumentProcessor::detect_format(b"not a document").unwrap_err();
        assert!(matches!(err, DocumentError::Format(_)));
    }

    #[test]
    fn test_detect_format_recognizes_bigtiff() {
        // BigTIFF little-endian header (version 43).
        let header = [0x49, 0x49, 0x2B, 0x00, 8, 0, 0, 0];
        assert_eq!(
            DocumentProcessor::detect_format(&header).unwrap(),
            DocumentFormat::Tiff
        );
    }

    #[test]
    fn test_detect_format_rejects_png() {
        // PNG magic; recognized content but unsupported container.
        let png = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0, 0, 0, 0];
        let err = DocumentProcessor::detect_format(&png).unwrap_err();
        assert!(matches!(err, DocumentError::Unsupported(_)));
    }

    #[test]
    fn test_save_rejects_empty() {
        let processor = DocumentProcessor::default();
        let meta = DocumentMetadata::new(DocumentFormat::Tiff);
        assert!(processor.save(&[], &meta, None).is_err());
    }

    #[test]
    fn test_save_rejects_pdf_output() {
        let processor = DocumentProcessor::default();
        let meta = DocumentMetadata::new(DocumentFormat::Tiff);
        let pages = vec![solid_page(4, 4, 255)];
        let err = processor
            .save(&pages, &meta, Some(DocumentFormat::Pdf))
            .unwrap_err();
        assert!(matches!(err, DocumentError::Unsupported(_)));
    }

    #[test]
    fn test_round_trip_preserves_pages_and_dpi() {
        let processor = DocumentProcessor::default();
        let mut meta = DocumentMetadata::new(DocumentFormat::Tiff);
        meta.dpi = Some((200, 200));
        let pages = vec![solid_page(8, 6, 10), solid_page(8, 6, 200)];

        let bytes = processor.save(&pages, &meta, None).unwrap();
        let (reloaded, reloaded_meta) = processor.load(&bytes).unwrap();

        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded_meta.page_count, 2);
        assert_eq!(reloaded_meta.dpi, Some((200, 200)));
        assert_eq!(reloaded[0].dimensions(), (8, 6));
        assert_eq!(reloaded[0].get_pixel(0, 0), &Rgb([10, 10, 10]));
        assert_eq!(reloaded[1].get_pixel(0, 0), &Rgb([200, 200, 200]));
    }

    #[test]
    fn test_streaming_save_round_trips() {
        // Threshold of 2 forces the BigTIFF streaming path.
        let processor = DocumentProcessor::new(2);
        let mut meta = DocumentMetadata::new(DocumentFormat::Tiff);
        meta.dpi = Some((300, 300));
        let pages: Vec<_> = (0..5).map(|i| solid_page(6, 4, i * 40)).collect();

        let bytes = processor.save(&pages, &meta, None).unwrap();
        let (reloaded, reloaded_meta) = processor.load(&bytes).unwrap();
        assert_eq!(reloaded.len(), 5);
        assert_eq!(reloaded_meta.dpi, Some((300, 300)));
        for (i, page) in reloaded.iter().enumerate() {
            assert_eq!(page.get_pixel(0, 0), &Rgb([i as u8 * 40; 3]));
        }
    }

    #[test]
    fn test_optimize_for_ocr_is_lossless() {
        let processor = DocumentProcessor::default();
        let meta = DocumentMetadata::new(DocumentFormat::Tiff);
        let pages = vec![solid_page(16, 16, 7)];

        // Force the compressed branch with a tiny cap, then the
        // uncompressed branch with a huge one; both must decode back to
        // identical geometry and pixels.
        for cap in [0, 10_000] {
            let bytes = processor.optimize_for_ocr(&pages, cap, &meta).unwrap();
            let (decoded, _) = processor.load(&bytes).unwrap();
            assert_eq!(decoded.len(), 1);
            assert_eq!(decoded[0].dimensions(), (16, 16));
            assert_eq!(decoded[0].as_raw(), pages[0].as_raw());
        }
    }

    #[test]
    fn test_lazy_reader_batches() {
        let processor = DocumentProcessor::default();
        let meta = DocumentMetadata::new(DocumentFormat::Tiff);
        let pages: Vec<_> = (0..4).map(|i| solid_page(4, 4, i * 30)).collect();
        let bytes = processor.save(&pages, &meta, None).unwrap();

        let mut reader = processor.open(&bytes).unwrap();
        assert_eq!(reader.page_count(), 4);
        let first = reader.read_batch(3).unwrap();
        assert_eq!(first.len(), 3);
        let rest = reader.read_batch(3).unwrap();
        assert_eq!(rest.len(), 1);
        assert!(reader.read_batch(3).unwrap().is_empty());
    }
}
