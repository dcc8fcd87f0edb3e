//! PHI entities and masking levels.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// HIPAA de-identification level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskingLevel {
    /// Mask every detected category.
    SafeHarbor,
    /// Mask everything except provider/organisation categories.
    LimitedDataset,
    /// Mask only an explicitly configured category set.
    Custom,
}

impl MaskingLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SafeHarbor => "safe_harbor",
            Self::LimitedDataset => "limited_dataset",
            Self::Custom => "custom",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "safe_harbor" => Some(Self::SafeHarbor),
            "limited_dataset" => Some(Self::LimitedDataset),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

/// Invalid entity rejected at ingress.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EntityValidationError {
    #[error("entity text is empty")]
    EmptyText,
    #[error("entity length must be positive")]
    ZeroLength,
    #[error("entity confidence {0} outside [0, 1]")]
    Confidence(String),
}

/// A span of characters the PHI detector asserts is an identifier.
///
/// `offset`/`length` index into the characters of the `OcrResult`
/// `full_text` the detector was given.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhiEntity {
    pub text: String,
    pub category: String,
    pub subcategory: Option<String>,
    pub offset: usize,
    pub length: usize,
    /// Detector confidence, normalized to [0, 1].
    pub confidence: f64,
}

impl PhiEntity {
    /// Validating constructor. Empty text and non-positive lengths are
    /// rejected here so the matcher never sees them.
    pub fn new(
        text: impl Into<String>,
        category: impl Into<String>,
        subcategory: Option<String>,
        offset: usize,
        length: usize,
        confidence: f64,
    ) -> Result<Self, EntityValidationError> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(EntityValidationError::EmptyText);
        }
        if length == 0 {
            return Err(EntityValidationError::ZeroLength);
        }
        if !(0.0..=1.0).contains(&confidence) {
            return Err(EntityValidationError::Confidence(format!("{confidence}")));
        }
        Ok(Self {
            text,
            category: category.into(),
            subcategory,
            offset,
            length,
            confidence,
        })
    }

    /// Exclusive end of the character span.
    pub fn end_offset(&self) -> usize {
        self.offset + self.length
    }

    /// Two entities overlap iff their half-open spans intersect.
    pub fn overlaps(&self, other: &PhiEntity) -> bool {
        self.offset < other.end_offset() && other.offset < self.end_offset()
    }
}
