//! PHI detector adapters.
//!
//! Detectors consume the OCR transcript and return entity spans sorted
//! by offset, with confidences normalized to [0, 1]. Offsets index the
//! characters of the transcript they were given. Providers with
//! per-call character caps are chunked here, with offsets re-based into
//! the global text.

mod azure;
mod comprehend;
mod mock;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use crate::config::Settings;
use crate::models::{MaskingLevel, PhiEntity};

pub use azure::AzurePhiDetector;
pub use comprehend::ComprehendPhiDetector;
pub use mock::MockPhiDetector;

/// Errors from PHI detection. Classification into retryable/terminal
/// happens in the job runner.
#[derive(Debug, Error)]
pub enum PhiDetectError {
    #[error("PHI detector transport error: {0}")]
    Transport(String),

    #[error("PHI detector authorization error: {0}")]
    Auth(String),

    #[error("PHI detector quota exceeded: {0}")]
    Quota(String),

    #[error("PHI detector response decode error: {0}")]
    Decode(String),

    #[error("PHI detector error: {0}")]
    Provider(String),

    #[error("unknown PHI provider: {0}")]
    UnknownProvider(String),
}

/// Interface to a PHI detection engine.
#[async_trait]
pub trait PhiDetector: Send + Sync {
    /// Detect PHI spans in `full_text`, already filtered for the
    /// requested masking level and sorted by offset ascending.
    async fn detect(
        &self,
        full_text: &str,
        level: MaskingLevel,
    ) -> Result<Vec<PhiEntity>, PhiDetectError>;

    fn name(&self) -> &str;
}

/// Get the PHI detector selected by configuration.
pub async fn detector_for(
    name: &str,
    settings: &Settings,
) -> Result<Arc<dyn PhiDetector>, PhiDetectError> {
    let custom: HashSet<String> = settings.custom_phi_categories.iter().cloned().collect();
    match name {
        "mock" => Ok(Arc::new(MockPhiDetector::new(custom))),
        "azure" => Ok(Arc::new(AzurePhiDetector::new(settings, custom)?)),
        "comprehend" => Ok(Arc::new(ComprehendPhiDetector::new(custom).await)),
        other => Err(PhiDetectError::UnknownProvider(other.to_string())),
    }
}

/// Apply a masking level to detected entities.
///
/// SafeHarbor keeps everything. LimitedDataset drops entities whose
/// category or subcategory is one the adapter declared as a
/// provider/organisation identifier (those may be retained in a limited
/// dataset). Custom keeps only the configured allowlist; an empty
/// allowlist degrades to SafeHarbor because masking too much is the
/// safe failure mode for PHI.
pub(crate) fn apply_masking_level(
    entities: Vec<PhiEntity>,
    level: MaskingLevel,
    provider_categories: &[&str],
    custom: &HashSet<String>,
) -> Vec<PhiEntity> {
    match level {
        MaskingLevel::SafeHarbor => entities,
        MaskingLevel::LimitedDataset => entities
            .into_iter()
            .filter(|e| {
                !provider_categories.contains(&e.category.as_str())
                    && !e
                        .subcategory
                        .as_deref()
                        .is_some_and(|s| provider_categories.contains(&s))
            })
            .collect(),
        MaskingLevel::Custom => {
            if custom.is_empty() {
                warn!("custom masking level with no categories configured; defaulting to safe harbor");
                return entities;
            }
            entities
                .into_iter()
                .filter(|e| custom.contains(&e.category))
                .collect()
        }
    }
}

/// Split `text` into chunks of at most `max_chars` characters, tagged
/// with the char offset where each chunk starts.
pub(crate) fn chunk_by_chars(text: &str, max_chars: usize) -> Vec<(usize, &str)> {
    debug_assert!(max_chars > 0);
    let mut chunks = Vec::new();
    let mut chunk_start_byte = 0;
    let mut chunk_start_char = 0;
    let mut chars_in_chunk = 0;

    for (byte_index, _) in text.char_indices() {
        if chars_in_chunk == max_chars {
            chunks.push((chunk_start_char, &text[chunk_start_byte..byte_index]));
            chunk_start_byte = byte_index;
            chunk_start_char += chars_in_chunk;
            chars_in_chunk = 0;
        }
        chars_in_chunk += 1;
    }
    if chars_in_chunk > 0 || chunks.is_empty() {
        chunks.push((chunk_start_char, &text[chunk_start_byte..]));
    }
    chunks
}

/// Sort entities into the order the contract requires.
pub(crate) fn sort_by_offset(mut entities: Vec<PhiEntity>) -> Vec<PhiEntity> {
    entities.sort_by_key(|e| e.offset);
    entities
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(category: &str, subcategory: Option<&str>, offset: usize) -> PhiEntity {
        PhiEntity::new(
            "text",
            category,
            subcategory.map(|s| s.to_string()),
            offset,
            4,
            0.9,
        )
        .unwrap()
    }

    #[test]
    fn test_safe_harbor_keeps_everything() {
        let entities = vec![entity("Person", None, 0), entity("Organization", None, 10)];
        let out = apply_masking_level(
            entities.clone(),
            MaskingLevel::SafeHarbor,
            &["Organization"],
            &HashSet::new(),
        );
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_limited_dataset_drops_provider_categories() {
        let entities = vec![
            entity("Person", None, 0),
            entity("Organization", None, 10),
            entity("PHI", Some("PROFESSION"), 20),
        ];
        let out = apply_masking_level(
            entities,
            MaskingLevel::LimitedDataset,
            &["Organization", "PROFESSION"],
            &HashSet::new(),
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].category, "Person");
    }

    #[test]
    fn test_custom_filters_to_allowlist() {
        let entities = vec![entity("Person", None, 0), entity("Date", None, 10)];
        let custom: HashSet<String> = ["Date".to_string()].into_iter().collect();
        let out = apply_masking_level(entities, MaskingLevel::Custom, &[], &custom);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].category, "Date");
    }

    #[test]
    fn test_custom_empty_degrades_to_safe_harbor() {
        let entities = vec![entity("Person", None, 0), entity("Date", None, 10)];
        let out = apply_masking_level(entities, MaskingLevel::Custom, &[], &HashSet::new());
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_chunk_by_chars_re_basing() {
        let text = "abcdefghij";
        let chunks = chunk_by_chars(text, 4);
        assert_eq!(chunks, vec![(0, "abcd"), (4, "efgh"), (8, "ij")]);
    }

    #[test]
    fn test_chunk_by_chars_multibyte() {
        let text = "aéb日c";
        let chunks = chunk_by_chars(text, 2);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], (0, "aé"));
        assert_eq!(chunks[1], (2, "b日"));
        assert_eq!(chunks[2], (4, "c"));
    }

    #[test]
    fn test_chunk_empty_text() {
        assert_eq!(chunk_by_chars("", 10), vec![(0, "")]);
    }

    #[tokio::test]
    async fn test_unknown_detector() {
        let settings = Settings::default();
        let err = detector_for("presidio", &settings).await.err().unwrap();
        assert!(matches!(err, PhiDetectError::UnknownProvider(_)));
    }
}
