//! OCR via AWS Textract.

use std::collections::BTreeMap;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_textract::primitives::Blob;
use aws_sdk_textract::types::{Block, BlockType, Document};
use tracing::{debug, instrument};

use super::{OcrError, OcrProvider};
use crate::models::{BoundingBox, DocumentFormat, OcrPage, OcrResult, OcrWord};

/// OCR adapter for AWS Textract's `DetectDocumentText`.
///
/// Textract reports axis-aligned bounding boxes in coordinates
/// normalized to [0, 1]; those are kept as-is (page width/height are
/// reported as 1.0), and percent confidences are scaled down to [0, 1].
pub struct TextractOcrProvider {
    client: aws_sdk_textract::Client,
}

impl TextractOcrProvider {
    pub async fn new() -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        Self {
            client: aws_sdk_textract::Client::new(&config),
        }
    }
}

#[async_trait]
impl OcrProvider for TextractOcrProvider {
    #[instrument(level = "debug", skip_all, fields(bytes = bytes.len()))]
    async fn analyze(
        &self,
        bytes: &[u8],
        _format_hint: Option<DocumentFormat>,
        _language: Option<&str>,
    ) -> Result<OcrResult, OcrError> {
        let document = Document::builder().bytes(Blob::new(bytes)).build();
        let response = self
            .client
            .detect_document_text()
            .document(document)
            .send()
            .await
            .map_err(classify_sdk_error)?;

        let result = convert_blocks(response.blocks());
        debug!(
            pages = result.pages.len(),
            words = result.word_count(),
            "Textract OCR complete"
        );
        Ok(result)
    }

    fn name(&self) -> &str {
        "textract"
    }
}

fn classify_sdk_error<E: std::fmt::Debug>(
    err: aws_sdk_textract::error::SdkError<E>,
) -> OcrError {
    use aws_sdk_textract::error::SdkError;
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
            OcrError::Transport(format!("{err:?}"))
        }
        SdkError::ResponseError(_) => OcrError::Transport(format!("{err:?}")),
        SdkError::ServiceError(_) => {
            let text = format!("{err:?}");
            if text.contains("Throttling") || text.contains("ProvisionedThroughputExceeded") {
                OcrError::Quota(text)
            } else if text.contains("AccessDenied") || text.contains("UnrecognizedClient") {
                OcrError::Auth(text)
            } else if text.contains("UnsupportedDocument") || text.contains("BadDocument") {
                OcrError::Decode(text)
            } else {
                OcrError::Provider(text)
            }
        }
        _ => OcrError::Provider(format!("{err:?}")),
    }
}

/// Build the uniform model from Textract blocks. LINE blocks drive the
/// transcript (one per line), WORD blocks drive the geometry.
fn convert_blocks(blocks: &[Block]) -> OcrResult {
    let mut words_by_page: BTreeMap<u32, Vec<OcrWord>> = BTreeMap::new();
    let mut lines: Vec<String> = Vec::new();

    for block in blocks {
        let page = block.page().unwrap_or(1).max(1) as u32;
        match block.block_type() {
            Some(BlockType::Word) => {
                let Some(text) = block.text() else { continue };
                let bbox = block
                    .geometry()
                    .and_then(|g| g.bounding_box())
                    .map(|b| {
                        BoundingBox::new(
                            page,
                            b.left() as f64,
                            b.top() as f64,
                            b.width() as f64,
                            b.height() as f64,
                        )
                    })
                    .unwrap_or_else(|| BoundingBox::new(page, 0.0, 0.0, 0.0, 0.0));
                let confidence = block.confidence().unwrap_or(0.0) as f64 / 100.0;
                words_by_page.entry(page).or_default().push(OcrWord {
                    text: text.to_string(),
                    confidence: confidence.clamp(0.0, 1.0),
                    bounding_box: bbox,
                });
            }
            Some(BlockType::Line) => {
                if let Some(text) = block.text() {
                    lines.push(text.to_string());
                }
            }
            _ => {}
        }
    }

    // Pages must come out 1..N contiguous even if a middle page had no
    // recognized words.
    let max_page = words_by_page.keys().max().copied().unwrap_or(0);
    let mut pages = Vec::with_capacity(max_page as usize);
    for page_number in 1..=max_page {
        pages.push(OcrPage {
            page_number,
            width: 1.0,
            height: 1.0,
            words: words_by_page.remove(&page_number).unwrap_or_default(),
        });
    }

    let full_text = if lines.is_empty() {
        pages
            .iter()
            .flat_map(|p| p.words.iter().map(|w| w.text.as_str()))
            .collect::<Vec<_>>()
            .join(" ")
    } else {
        lines.join("\n")
    };

    OcrResult { pages, full_text }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_textract::types::{Geometry, BoundingBox as AwsBox};

    fn word_block(text: &str, page: i32, left: f32, top: f32) -> Block {
        Block::builder()
            .block_type(BlockType::Word)
            .text(text)
            .page(page)
            .confidence(95.0)
            .geometry(
                Geometry::builder()
                    .bounding_box(
                        AwsBox::builder()
                            .left(left)
                            .top(top)
                            .width(0.1)
                            .height(0.02)
                            .build(),
                    )
                    .build(),
            )
            .build()
    }

    fn line_block(text: &str, page: i32) -> Block {
        Block::builder()
            .block_type(BlockType::Line)
            .text(text)
            .page(page)
            .build()
    }

    #[test]
    fn test_convert_scales_confidence_and_keeps_normalized_coords() {
        let blocks = vec![
            line_block("John Doe", 1),
            word_block("John", 1, 0.1, 0.2),
            word_block("Doe", 1, 0.25, 0.2),
        ];
        let result = convert_blocks(&blocks);
        assert_eq!(result.full_text, "John Doe");
        assert_eq!(result.pages.len(), 1);
        let word = &result.pages[0].words[0];
        assert!((word.confidence - 0.95).abs() < 1e-6);
        assert!((word.bounding_box.x - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_convert_fills_contiguous_pages() {
        // Words only on pages 1 and 3: page 2 must still exist.
        let blocks = vec![
            word_block("a", 1, 0.0, 0.0),
            word_block("b", 3, 0.0, 0.0),
        ];
        let result = convert_blocks(&blocks);
        let numbers: Vec<u32> = result.pages.iter().map(|p| p.page_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert!(result.pages[1].words.is_empty());
    }
}
