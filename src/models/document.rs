//! Document formats and load/save metadata.

use serde::{Deserialize, Serialize};

/// Raster document container formats the processor understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentFormat {
    Tiff,
    Pdf,
}

impl DocumentFormat {
    /// Map a MIME type to a format. `image/tif` is a common alias.
    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime {
            "image/tiff" | "image/tif" => Some(Self::Tiff),
            "application/pdf" => Some(Self::Pdf),
            _ => None,
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Tiff => "image/tiff",
            Self::Pdf => "application/pdf",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Tiff => "tiff",
            Self::Pdf => "pdf",
        }
    }
}

/// Metadata carried across load -> save so the output document keeps the
/// input's resolution and color characteristics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub format: DocumentFormat,
    /// Dots per inch as (x, y); None when the input carried no
    /// resolution tags.
    pub dpi: Option<(u32, u32)>,
    /// Source color mode, e.g. "gray8", "rgb8".
    pub color_mode: Option<String>,
    /// Source compression scheme name, if known.
    pub compression: Option<String>,
    pub page_count: u32,
    /// Provider- or format-specific leftovers that have no dedicated field.
    pub extras: serde_json::Value,
}

impl DocumentMetadata {
    pub fn new(format: DocumentFormat) -> Self {
        Self {
            format,
            dpi: None,
            color_mode: None,
            compression: None,
            page_count: 0,
            extras: serde_json::Value::Null,
        }
    }

    /// DPI with the (300, 300) default applied.
    pub fn dpi_or_default(&self) -> (u32, u32) {
        self.dpi.unwrap_or((300, 300))
    }
}
