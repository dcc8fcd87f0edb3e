//! PDF rasterization via poppler's `pdftoppm`.
//!
//! Native-PDF text redaction is out of scope: PDFs are rasterized up
//! front and from then on the pipeline only ever sees page images.

use std::path::PathBuf;
use std::process::Command;

use tempfile::TempDir;
use tracing::debug;

use super::{DocumentError, PageImage};
use crate::models::{DocumentFormat, DocumentMetadata};

/// Lazy reader over rasterized PDF pages.
///
/// Rasterization happens once at construction (poppler writes one PNG
/// per page into a temp dir); decoding those PNGs into pixel buffers is
/// deferred to `next_page` so memory stays bounded by the batch size.
pub struct PdfPageReader {
    // Holds the rasterized pages on disk; released on drop.
    _tmpdir: TempDir,
    page_files: Vec<PathBuf>,
    next_index: usize,
    metadata: DocumentMetadata,
}

impl PdfPageReader {
    pub fn rasterize(bytes: &[u8], dpi: u32) -> Result<Self, DocumentError> {
        let tmpdir = TempDir::with_prefix("deid-pdf")?;
        let input_path = tmpdir.path().join("input.pdf");
        std::fs::write(&input_path, bytes)?;

        let output_prefix = tmpdir.path().join("page");
        let result = Command::new("pdftoppm")
            .arg("-png")
            .arg("-r")
            .arg(dpi.to_string())
            .arg(&input_path)
            .arg(&output_prefix)
            .output();

        let output = match result {
            Ok(output) => output,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DocumentError::ToolNotFound("pdftoppm".to_string()))
            }
            Err(e) => return Err(DocumentError::Io(e)),
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DocumentError::Format(format!(
                "pdftoppm failed: {}",
                stderr.trim()
            )));
        }

        let page_files = collect_page_files(&tmpdir)?;
        if page_files.is_empty() {
            return Err(DocumentError::Format(
                "PDF produced no pages".to_string(),
            ));
        }
        debug!(pages = page_files.len(), dpi, "rasterized PDF");

        let mut metadata = DocumentMetadata::new(DocumentFormat::Pdf);
        metadata.dpi = Some((dpi, dpi));
        metadata.color_mode = Some("rgb8".to_string());
        metadata.page_count = page_files.len() as u32;
        metadata.extras = serde_json::json!({ "rasterized": true });

        Ok(Self {
            _tmpdir: tmpdir,
            page_files,
            next_index: 0,
            metadata,
        })
    }

    pub fn page_count(&self) -> u32 {
        self.page_files.len() as u32
    }

    pub fn metadata(&self) -> &DocumentMetadata {
        &self.metadata
    }

    pub fn into_metadata(self) -> DocumentMetadata {
        self.metadata
    }

    pub fn next_page(&mut self) -> Result<Option<PageImage>, DocumentError> {
        let Some(path) = self.page_files.get(self.next_index) else {
            return Ok(None);
        };
        self.next_index += 1;
        let bytes = std::fs::read(path)?;
        let image = image::load_from_memory(&bytes)
            .map_err(|e| DocumentError::Format(format!("rasterized page decode failed: {e}")))?;
        Ok(Some(image.to_rgb8()))
    }
}

/// List the PNGs poppler produced, ordered by page number.
///
/// `pdftoppm` numbers output files (`page-1.png`, `page-10.png`, with
/// zero padding that varies by page count), so sort on the parsed
/// numeric suffix rather than lexically.
fn collect_page_files(tmpdir: &TempDir) -> Result<Vec<PathBuf>, DocumentError> {
    let mut numbered: Vec<(u32, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(tmpdir.path())? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("png") {
            continue;
        }
        let number = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(page_number_suffix);
        if let Some(number) = number {
            numbered.push((number, path));
        }
    }
    numbered.sort_by_key(|(n, _)| *n);
    Ok(numbered.into_iter().map(|(_, p)| p).collect())
}

/// Trailing digits of a file stem like `page-07`.
fn page_number_suffix(stem: &str) -> Option<u32> {
    let digits: String = stem
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_number_suffix() {
        assert_eq!(page_number_suffix("page-1"), Some(1));
        assert_eq!(page_number_suffix("page-07"), Some(7));
        assert_eq!(page_number_suffix("page-123"), Some(123));
        assert_eq!(page_number_suffix("page"), None);
    }

    #[test]
    fn test_rasterize_rejects_garbage_pdf() {
        // Valid magic is checked upstream; here pdftoppm itself fails.
        // Skip silently when poppler is not installed.
        match PdfPageReader::rasterize(b"%PDF-1.4 truncated", 72) {
            Err(DocumentError::ToolNotFound(_)) => {}
            Err(DocumentError::Format(_)) => {}
            other => panic!("expected failure, got {:?}", other.map(|_| "reader")),
        }
    }
}
