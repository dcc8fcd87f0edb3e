//! OCR provider adapters.
//!
//! Every provider is normalized into the same word-level geometry model:
//! confidences in [0, 1], polygons collapsed to axis-aligned boxes, and
//! a `full_text` transcript that is exactly what the PHI detector will
//! be given. Coordinate units vary by provider (Azure reports inches or
//! pixels, Textract normalized 0-1); the matcher only compares boxes
//! within one result, so units just have to be internally consistent.

mod azure;
mod mock;
mod textract;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::Settings;
use crate::models::{BoundingBox, DocumentFormat, OcrResult};

pub use azure::AzureOcrProvider;
pub use mock::MockOcrProvider;
pub use textract::TextractOcrProvider;

/// Errors from OCR providers. Whether a kind is retryable is the job
/// runner's decision, not the adapter's.
#[derive(Debug, Error)]
pub enum OcrError {
    #[error("OCR transport error: {0}")]
    Transport(String),

    #[error("OCR authorization error: {0}")]
    Auth(String),

    #[error("OCR quota exceeded: {0}")]
    Quota(String),

    #[error("OCR response decode error: {0}")]
    Decode(String),

    #[error("OCR provider error: {0}")]
    Provider(String),

    #[error("unknown OCR provider: {0}")]
    UnknownProvider(String),
}

/// Interface to an OCR engine.
#[async_trait]
pub trait OcrProvider: Send + Sync {
    /// Run OCR over a document (or a batch of its pages) and return the
    /// uniform geometry model.
    async fn analyze(
        &self,
        bytes: &[u8],
        format_hint: Option<DocumentFormat>,
        language: Option<&str>,
    ) -> Result<OcrResult, OcrError>;

    fn name(&self) -> &str;
}

/// Get the OCR provider selected by configuration.
pub async fn provider_for(
    name: &str,
    settings: &Settings,
) -> Result<Arc<dyn OcrProvider>, OcrError> {
    match name {
        "mock" => Ok(Arc::new(MockOcrProvider::new())),
        "azure" => Ok(Arc::new(AzureOcrProvider::new(settings)?)),
        "textract" => Ok(Arc::new(TextractOcrProvider::new().await)),
        other => Err(OcrError::UnknownProvider(other.to_string())),
    }
}

/// Collapse a provider polygon (possibly rotated) into an axis-aligned
/// box: (min x, min y, max x - min x, max y - min y).
pub(crate) fn polygon_to_bbox(
    polygon: &[f64],
    page: u32,
) -> Result<BoundingBox, OcrError> {
    if polygon.len() < 4 || polygon.len() % 2 != 0 {
        return Err(OcrError::Decode(format!(
            "polygon with {} coordinates",
            polygon.len()
        )));
    }
    let xs = polygon.iter().step_by(2);
    let ys = polygon.iter().skip(1).step_by(2);
    let min_x = xs.clone().fold(f64::INFINITY, |a, &b| a.min(b));
    let max_x = xs.fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    let min_y = ys.clone().fold(f64::INFINITY, |a, &b| a.min(b));
    let max_y = ys.fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    Ok(BoundingBox::new(page, min_x, min_y, max_x - min_x, max_y - min_y))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_polygon_collapse_rotated() {
        // A rotated quad: the box must cover the extremes.
        let polygon = [10.0, 5.0, 30.0, 10.0, 25.0, 30.0, 5.0, 25.0];
        let bbox = polygon_to_bbox(&polygon, 1).unwrap();
        assert_eq!(bbox.x, 5.0);
        assert_eq!(bbox.y, 5.0);
        assert_eq!(bbox.width, 25.0);
        assert_eq!(bbox.height, 25.0);
        assert_eq!(bbox.page, 1);
    }

    #[test]
    fn test_polygon_rejects_odd_coordinates() {
        assert!(polygon_to_bbox(&[1.0, 2.0, 3.0], 1).is_err());
        assert!(polygon_to_bbox(&[], 1).is_err());
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let settings = Settings::default();
        let err = provider_for("tesseract9000", &settings).await.err().unwrap();
        assert!(matches!(err, OcrError::UnknownProvider(_)));
    }
}
