//! Regex-based mock PHI detection for tests and local development.

use std::collections::HashSet;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, warn};

use super::{apply_masking_level, sort_by_offset, PhiDetectError, PhiDetector};
use crate::models::{MaskingLevel, PhiEntity};

/// Categories the mock declares as provider/organisation identifiers.
const PROVIDER_CATEGORIES: &[&str] = &["Physician", "Organization"];

const MOCK_CONFIDENCE: f64 = 0.95;

/// Pattern set detecting the common PHI categories without any
/// external service.
fn patterns() -> &'static Vec<(&'static str, Regex)> {
    static PATTERNS: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            ("Date", r"\b\d{1,2}/\d{1,2}/\d{4}\b"),
            ("Date", r"\b\d{1,2}-\d{1,2}-\d{4}\b"),
            ("PhoneNumber", r"\(\d{3}\)\s*\d{3}-\d{4}"),
            ("PhoneNumber", r"\b\d{3}-\d{3}-\d{4}\b"),
            ("Email", r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b"),
            ("SSN", r"\b\d{3}-\d{2}-\d{4}\b"),
            ("MedicalRecordNumber", r"\bMRN:\s*\d+\b"),
            ("InsuranceID", r"\bMember ID:\s*[A-Z0-9]+\b"),
            (
                "Address",
                r"\b\d+\s+[A-Z][a-z]+\s+(?:Street|St|Avenue|Ave|Road|Rd|Boulevard|Blvd)[,\s]+[A-Z][a-z]+,\s+[A-Z]{2}\s+\d{5}\b",
            ),
            ("Organization", r"\b[A-Z][A-Za-z]+\s+(?:Inc|Corp|LLC|Ltd)\.?"),
        ]
        .into_iter()
        .map(|(category, pattern)| (category, Regex::new(pattern).expect("static pattern")))
        .collect()
    })
}

/// Name patterns capture the name itself in group 1; the prefix decides
/// whether it is a patient-side person or a physician.
fn name_patterns() -> &'static Vec<(&'static str, Regex)> {
    static PATTERNS: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            ("Person", r"(?:Patient:|Mr\.|Mrs\.|Ms\.|spouse,)\s+([A-Z][a-z]+(?:\s+[A-Z][a-z]+)+)"),
            ("Physician", r"Dr\.\s+([A-Z][a-z]+(?:\s+[A-Z][a-z]+)+)"),
        ]
        .into_iter()
        .map(|(category, pattern)| (category, Regex::new(pattern).expect("static pattern")))
        .collect()
    })
}

/// Mock PHI detector backed by regex patterns.
pub struct MockPhiDetector {
    custom_categories: HashSet<String>,
}

impl MockPhiDetector {
    pub fn new(custom_categories: HashSet<String>) -> Self {
        Self { custom_categories }
    }

    fn detect_sync(&self, text: &str, level: MaskingLevel) -> Vec<PhiEntity> {
        let mut entities = Vec::new();

        for (category, pattern) in patterns() {
            for m in pattern.find_iter(text) {
                push_entity(&mut entities, text, category, m.start(), m.as_str());
            }
        }
        for (category, pattern) in name_patterns() {
            for caps in pattern.captures_iter(text) {
                if let Some(name) = caps.get(1) {
                    push_entity(&mut entities, text, category, name.start(), name.as_str());
                }
            }
        }

        // Patterns can double-report the same span (e.g. phone vs SSN
        // shapes); keep the first occurrence of each span.
        entities.sort_by_key(|e| (e.offset, e.length));
        entities.dedup_by_key(|e| (e.offset, e.length));

        let entities =
            apply_masking_level(entities, level, PROVIDER_CATEGORIES, &self.custom_categories);
        sort_by_offset(entities)
    }
}

impl Default for MockPhiDetector {
    fn default() -> Self {
        Self::new(HashSet::new())
    }
}

fn push_entity(
    entities: &mut Vec<PhiEntity>,
    text: &str,
    category: &str,
    byte_start: usize,
    matched: &str,
) {
    // Regex reports byte offsets; entities live in the char domain.
    let offset = text[..byte_start].chars().count();
    let length = matched.chars().count();
    match PhiEntity::new(matched, category, None, offset, length, MOCK_CONFIDENCE) {
        Ok(entity) => entities.push(entity),
        Err(e) => warn!("dropping invalid mock entity: {e}"),
    }
}

#[async_trait]
impl PhiDetector for MockPhiDetector {
    async fn detect(
        &self,
        full_text: &str,
        level: MaskingLevel,
    ) -> Result<Vec<PhiEntity>, PhiDetectError> {
        let entities = self.detect_sync(full_text, level);
        debug!(entities = entities.len(), "mock PHI detection complete");
        Ok(entities)
    }

    fn name(&self) -> &str {
        "mock"
    }
}
