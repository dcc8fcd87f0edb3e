//! PHI detection via AWS Comprehend Medical.

use std::collections::HashSet;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use tracing::{debug, instrument, warn};

use super::{apply_masking_level, chunk_by_chars, sort_by_offset, PhiDetectError, PhiDetector};
use crate::models::{MaskingLevel, PhiEntity};

/// Comprehend Medical caps DetectPHI at 20 000 characters per call.
const MAX_CHARS_PER_CALL: usize = 20_000;

/// Subcategories that identify providers rather than patients, which
/// LimitedDataset retains.
const PROVIDER_CATEGORIES: &[&str] = &["PROFESSION"];

/// PHI detection adapter for AWS Comprehend Medical `DetectPHI`.
pub struct ComprehendPhiDetector {
    client: aws_sdk_comprehendmedical::Client,
    custom_categories: HashSet<String>,
}

impl ComprehendPhiDetector {
    pub async fn new(custom_categories: HashSet<String>) -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        Self {
            client: aws_sdk_comprehendmedical::Client::new(&config),
            custom_categories,
        }
    }

    async fn detect_chunk(
        &self,
        chunk: &str,
        chunk_offset: usize,
    ) -> Result<Vec<PhiEntity>, PhiDetectError> {
        let response = self
            .client
            .detect_phi()
            .text(chunk)
            .send()
            .await
            .map_err(classify_sdk_error)?;

        let mut entities = Vec::new();
        for raw in response.entities() {
            let Some(text) = raw.text() else { continue };
            let begin = raw.begin_offset().unwrap_or(0).max(0) as usize;
            let end = raw.end_offset().unwrap_or(0).max(0) as usize;
            // Comprehend offsets are UTF-8 bytes into the chunk; convert
            // into the char domain the matcher uses.
            let Some(span) = chunk.get(begin..end) else {
                warn!(begin, end, "Comprehend entity span out of bounds; dropping");
                continue;
            };
            let char_offset = chunk[..begin].chars().count();
            let char_length = span.chars().count();

            let category = raw
                .category()
                .map(|c| c.as_str().to_string())
                .unwrap_or_else(|| "PROTECTED_HEALTH_INFORMATION".to_string());
            let subcategory = raw.r#type().map(|t| t.as_str().to_string());
            let confidence = raw.score().unwrap_or(0.0) as f64;

            match PhiEntity::new(
                text,
                category,
                subcategory,
                chunk_offset + char_offset,
                char_length,
                confidence.clamp(0.0, 1.0),
            ) {
                Ok(entity) => entities.push(entity),
                Err(e) => warn!("dropping invalid Comprehend entity: {e}"),
            }
        }
        Ok(entities)
    }
}

#[async_trait]
impl PhiDetector for ComprehendPhiDetector {
    #[instrument(level = "debug", skip_all, fields(chars = full_text.chars().count()))]
    async fn detect(
        &self,
        full_text: &str,
        level: MaskingLevel,
    ) -> Result<Vec<PhiEntity>, PhiDetectError> {
        let mut entities = Vec::new();
        for (chunk_offset, chunk) in chunk_by_chars(full_text, MAX_CHARS_PER_CALL) {
            if chunk.is_empty() {
                continue;
            }
            entities.extend(self.detect_chunk(chunk, chunk_offset).await?);
        }

        let entities =
            apply_masking_level(entities, level, PROVIDER_CATEGORIES, &self.custom_categories);
        let entities = sort_by_offset(entities);
        debug!(entities = entities.len(), "Comprehend PHI detection complete");
        Ok(entities)
    }

    fn name(&self) -> &str {
        "comprehend"
    }
}

fn classify_sdk_error<E: std::fmt::Debug>(
    err: aws_sdk_comprehendmedical::error::SdkError<E>,
) -> PhiDetectError {
    use aws_sdk_comprehendmedical::error::SdkError;
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            PhiDetectError::Transport(format!("{err:?}"))
        }
        SdkError::ServiceError(_) => {
            let text = format!("{err:?}");
            if text.contains("TooManyRequests") || text.contains("Throttling") {
                PhiDetectError::Quota(text)
            } else if text.contains("AccessDenied") || text.contains("UnrecognizedClient") {
                PhiDetectError::Auth(text)
            } else {
                PhiDetectError::Provider(text)
            }
        }
        _ => PhiDetectError::Provider(format!("{err:?}")),
    }
}
