//! Pipeline output.

use serde::{Deserialize, Serialize};

use super::{MaskRegion, PhiEntity};

/// Outcome of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Success,
    Failure,
}

/// A detected entity together with the mask regions it resolved to.
///
/// An entity that could not be located on any page keeps an empty
/// region list; the pipeline reports it as a warning and never guesses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchedEntity {
    pub entity: PhiEntity,
    pub regions: Vec<MaskRegion>,
}

impl MatchedEntity {
    pub fn is_matched(&self) -> bool {
        !self.regions.is_empty()
    }
}

/// Result of de-identifying one document.
#[derive(Debug, Clone)]
pub struct DeidentificationResult {
    pub status: PipelineStatus,
    /// The reassembled masked document. Empty on failure.
    pub masked_bytes: Vec<u8>,
    pub pages_processed: u32,
    pub entities: Vec<MatchedEntity>,
    pub processing_time_ms: u64,
    /// Non-fatal warnings (unmatched entities, degraded levels, batch
    /// notes). Fatal errors surface as `Err` from the pipeline instead.
    pub errors: Vec<String>,
}

impl DeidentificationResult {
    /// Number of detected entities (matched or not).
    pub fn phi_entities_count(&self) -> usize {
        self.entities.len()
    }

    /// Number of entities that resolved to at least one region.
    pub fn entities_masked(&self) -> usize {
        self.entities.iter().filter(|e| e.is_matched()).count()
    }

    /// All detected entities.
    pub fn phi_entities(&self) -> impl Iterator<Item = &PhiEntity> {
        self.entities.iter().map(|m| &m.entity)
    }

    /// All mask regions across all entities.
    pub fn mask_regions(&self) -> impl Iterator<Item = &MaskRegion> {
        self.entities.iter().flat_map(|m| m.regions.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BoundingBox;

    fn entity(text: &str) -> PhiEntity {
        PhiEntity::new(text, "Name", None, 0, text.len(), 0.9).unwrap()
    }

    #[test]
    fn test_counts() {
        let matched = MatchedEntity {
            entity: entity("John"),
            regions: vec![MaskRegion::for_box(
                BoundingBox::new(1, 0.0, 0.0, 10.0, 10.0),
                "Name".to_string(),
                0.9,
            )],
        };
        let unmatched = MatchedEntity {
            entity: entity("Jane"),
            regions: vec![],
        };
        let result = DeidentificationResult {
            status: PipelineStatus::Success,
            masked_bytes: vec![],
            pages_processed: 1,
            entities: vec![matched, unmatched],
            processing_time_ms: 0,
            errors: vec![],
        };
        assert_eq!(result.phi_entities_count(), 2);
        assert_eq!(result.entities_masked(), 1);
        assert_eq!(result.mask_regions().count(), 1);
        // Entity list length always equals the reported count.
        assert_eq!(result.phi_entities().count(), result.phi_entities_count());
    }
}
