//! The de-identification pipeline.
//!
//! Stage order within a run is fixed: load -> OCR -> detect -> match ->
//! mask -> save. Small documents run as one batch; large documents
//! stream through in page batches with the masked output appended to an
//! on-disk writer, so peak memory is O(batch_size) decoded pages.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::config::Settings;
use crate::document::{
    DocumentError, DocumentProcessor, PageImage, PageReader, StreamingTiffWriter,
};
use crate::masking::{project_regions_to_pixels, ImageMasker};
use crate::matching::EntityMatcher;
use crate::models::{
    DeidentificationResult, DocumentFormat, DocumentMetadata, MaskingLevel, MatchedEntity,
    PipelineStatus,
};
use crate::ocr::{OcrError, OcrProvider};
use crate::phi::{PhiDetectError, PhiDetector};

/// Default OCR payload cap before lossless compression kicks in.
const DEFAULT_OCR_MAX_MB: u64 = 40;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Ocr(#[from] OcrError),

    #[error(transparent)]
    Phi(#[from] PhiDetectError),
}

/// Outcome of one processed batch.
struct BatchOutcome {
    masked_pages: Vec<PageImage>,
    matched: Vec<MatchedEntity>,
    warnings: Vec<String>,
}

/// Coordinates the full pipeline over injected providers.
pub struct DeidentificationPipeline {
    processor: DocumentProcessor,
    ocr: Arc<dyn OcrProvider>,
    phi: Arc<dyn PhiDetector>,
    matcher: EntityMatcher,
    masker: ImageMasker,
    batch_size: usize,
    ocr_max_mb: u64,
    fail_open: bool,
}

impl DeidentificationPipeline {
    pub fn new(
        processor: DocumentProcessor,
        ocr: Arc<dyn OcrProvider>,
        phi: Arc<dyn PhiDetector>,
        matcher: EntityMatcher,
        masker: ImageMasker,
        settings: &Settings,
    ) -> Self {
        Self {
            processor,
            ocr,
            phi,
            matcher,
            masker,
            batch_size: settings.batch_size.max(1),
            ocr_max_mb: DEFAULT_OCR_MAX_MB,
            fail_open: settings.fail_open,
        }
    }

    /// Pipeline with mock providers and default knobs, for local runs
    /// and tests.
    pub fn with_defaults(ocr: Arc<dyn OcrProvider>, phi: Arc<dyn PhiDetector>) -> Self {
        let settings = Settings::default();
        Self::new(
            DocumentProcessor::new(settings.streaming_threshold),
            ocr,
            phi,
            EntityMatcher::default(),
            ImageMasker::new(),
            &settings,
        )
    }

    /// De-identify a document: returns the masked bytes plus everything
    /// that was detected and painted.
    #[instrument(level = "info", skip_all, fields(bytes = bytes.len(), level = level.as_str()))]
    pub async fn deidentify(
        &self,
        bytes: &[u8],
        level: MaskingLevel,
        output_format: Option<DocumentFormat>,
    ) -> Result<DeidentificationResult, PipelineError> {
        let started = Instant::now();

        // Opening the document is blocking work (TIFF directory walk,
        // and for PDFs a pdftoppm exec-and-wait); keep it off the async
        // worker thread.
        let processor = self.processor.clone();
        let document = bytes.to_vec();
        let mut reader = tokio::task::spawn_blocking(move || processor.open(&document))
            .await
            .map_err(|e| {
                DocumentError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
            })??;
        let total_pages = reader.page_count() as usize;
        info!(total_pages, batch_size = self.batch_size, "starting de-identification");

        if total_pages <= self.batch_size {
            self.run_single_batch(&mut reader, level, output_format, started)
                .await
        } else {
            self.run_batched(&mut reader, level, started).await
        }
    }

    /// Convenience wrapper over a file on disk.
    pub async fn deidentify_from_path(
        &self,
        path: &Path,
        level: MaskingLevel,
        output_format: Option<DocumentFormat>,
    ) -> Result<DeidentificationResult, PipelineError> {
        let bytes = std::fs::read(path).map_err(DocumentError::Io)?;
        self.deidentify(&bytes, level, output_format).await
    }

    async fn run_single_batch(
        &self,
        reader: &mut PageReader,
        level: MaskingLevel,
        output_format: Option<DocumentFormat>,
        started: Instant,
    ) -> Result<DeidentificationResult, PipelineError> {
        let metadata = reader.metadata().clone();
        let mut pages = Vec::with_capacity(reader.page_count() as usize);
        while let Some(page) = reader.next_page()? {
            pages.push(page);
        }

        let outcome = self.process_batch(&pages, level, &metadata).await?;
        let masked_bytes = self
            .processor
            .save(&outcome.masked_pages, &metadata, output_format)?;

        let result = DeidentificationResult {
            status: PipelineStatus::Success,
            masked_bytes,
            pages_processed: pages.len() as u32,
            entities: outcome.matched,
            processing_time_ms: started.elapsed().as_millis() as u64,
            errors: outcome.warnings,
        };
        info!(
            pages = result.pages_processed,
            entities = result.phi_entities_count(),
            regions = result.mask_regions().count(),
            ms = result.processing_time_ms,
            "de-identification complete"
        );
        Ok(result)
    }

    /// Large-document path: per-batch OCR/detect/match/mask, appending
    /// masked pages to a streaming writer. Batch failures fail the whole
    /// run unless the operator explicitly enabled fail-open, in which
    /// case the failing batch's pages are written unmasked and the error
    /// recorded; the job runner must then decide whether that output is
    /// allowed to survive.
    async fn run_batched(
        &self,
        reader: &mut PageReader,
        level: MaskingLevel,
        started: Instant,
    ) -> Result<DeidentificationResult, PipelineError> {
        let metadata = reader.metadata().clone();
        let total_pages = reader.page_count();
        let mut writer = StreamingTiffWriter::create(metadata.dpi_or_default())?;
        let mut entities: Vec<MatchedEntity> = Vec::new();
        let mut errors: Vec<String> = Vec::new();
        let mut page_offset = 0u32;
        let mut batch_number = 0u32;

        loop {
            let batch = reader.read_batch(self.batch_size)?;
            if batch.is_empty() {
                break;
            }
            batch_number += 1;
            info!(
                batch = batch_number,
                pages = batch.len(),
                from_page = page_offset + 1,
                "processing batch"
            );

            match self.process_batch(&batch, level, &metadata).await {
                Ok(outcome) => {
                    for page in &outcome.masked_pages {
                        writer.append_page(page)?;
                    }
                    entities.extend(
                        outcome
                            .matched
                            .into_iter()
                            .map(|m| rebase_pages(m, page_offset)),
                    );
                    errors.extend(outcome.warnings);
                }
                Err(e) => {
                    if !self.fail_open {
                        return Err(e);
                    }
                    let message = format!("batch {batch_number} failed: {e}");
                    warn!("{message}; writing batch unmasked (fail-open)");
                    errors.push(message);
                    for page in &batch {
                        writer.append_page(page)?;
                    }
                }
            }
            page_offset += batch.len() as u32;
        }

        let masked_bytes = writer.finish()?;
        let result = DeidentificationResult {
            status: PipelineStatus::Success,
            masked_bytes,
            pages_processed: total_pages,
            entities,
            processing_time_ms: started.elapsed().as_millis() as u64,
            errors,
        };
        info!(
            pages = result.pages_processed,
            entities = result.phi_entities_count(),
            ms = result.processing_time_ms,
            "de-identification complete (batched)"
        );
        Ok(result)
    }

    /// One batch through OCR -> detect -> match -> mask. Pages and
    /// regions inside a batch are numbered batch-relative.
    async fn process_batch(
        &self,
        pages: &[PageImage],
        level: MaskingLevel,
        metadata: &DocumentMetadata,
    ) -> Result<BatchOutcome, PipelineError> {
        let ocr_bytes = self
            .processor
            .optimize_for_ocr(pages, self.ocr_max_mb, metadata)?;
        let ocr_result = self
            .ocr
            .analyze(&ocr_bytes, Some(DocumentFormat::Tiff), None)
            .await?;
        info!(
            words = ocr_result.word_count(),
            chars = ocr_result.full_text.chars().count(),
            "OCR extracted text"
        );

        let entities = self.phi.detect(&ocr_result.full_text, level).await?;
        info!(entities = entities.len(), "PHI detection complete");

        let matched = self.matcher.match_entities(&ocr_result, &entities);

        let mut warnings = Vec::new();
        let unmatched = matched.iter().filter(|m| !m.is_matched()).count();
        if unmatched > 0 {
            warnings.push(format!(
                "could not match {unmatched} PHI entities to bounding boxes; they may not be masked"
            ));
        }

        let regions: Vec<_> = matched
            .iter()
            .flat_map(|m| m.regions.iter().cloned())
            .collect();
        let pixel_regions = project_regions_to_pixels(&regions, &ocr_result.pages, pages);
        let masked_pages = self.masker.apply(pages, &pixel_regions);

        Ok(BatchOutcome {
            masked_pages,
            matched,
            warnings,
        })
    }
}

/// Shift batch-relative region pages to document-absolute numbering.
fn rebase_pages(mut matched: MatchedEntity, page_offset: u32) -> MatchedEntity {
    if page_offset == 0 {
        return matched;
    }
    matched.regions = matched
        .regions
        .iter()
        .map(|r| r.on_page(r.page + page_offset))
        .collect();
    matched
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BoundingBox, MaskRegion, PhiEntity};

    #[test]
    fn test_rebase_pages_shifts_regions() {
        let entity = PhiEntity::new("John", "Person", None, 0, 4, 0.9).unwrap();
        let matched = MatchedEntity {
            entity,
            regions: vec![MaskRegion::for_box(
                BoundingBox::new(2, 1.0, 1.0, 5.0, 5.0),
                "Person".to_string(),
                0.9,
            )],
        };
        let rebased = rebase_pages(matched, 25);
        assert_eq!(rebased.regions[0].page, 27);
        assert_eq!(rebased.regions[0].bounding_box.page, 27);
    }
}
