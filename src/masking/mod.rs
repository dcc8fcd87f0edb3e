//! Opaque mask painting.

use image::Rgb;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::DeploymentEnv;
use crate::document::PageImage;
use crate::models::{MaskRegion, OcrPage};

#[derive(Debug, Error)]
pub enum MaskingError {
    #[error("debug masking is disabled in production deployments")]
    DebugInProduction,
}

/// How regions are painted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MaskMode {
    /// Solid rectangles. Overlaps compose trivially and repainting is
    /// idempotent.
    Opaque,
    /// Semi-transparent category-keyed fills. Exposes region extent as
    /// a side channel, so production deployments refuse it.
    Debug,
}

/// Paints mask regions onto page copies.
pub struct ImageMasker {
    color: Rgb<u8>,
    mode: MaskMode,
}

impl Default for ImageMasker {
    fn default() -> Self {
        Self {
            color: Rgb([0, 0, 0]),
            mode: MaskMode::Opaque,
        }
    }
}

impl ImageMasker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_color(color: [u8; 3]) -> Self {
        Self {
            color: Rgb(color),
            mode: MaskMode::Opaque,
        }
    }

    /// Debug masker with semi-transparent fills keyed by category.
    pub fn debug_mode(env: DeploymentEnv) -> Result<Self, MaskingError> {
        if env == DeploymentEnv::Production {
            return Err(MaskingError::DebugInProduction);
        }
        warn!("image masker running in debug mode; output is NOT de-identified");
        Ok(Self {
            color: Rgb([0, 0, 0]),
            mode: MaskMode::Debug,
        })
    }

    /// Paint each region onto a copy of its page. Inputs are never
    /// mutated; pages without regions are copied unchanged. Work is
    /// sequential to bound memory on large documents.
    pub fn apply(&self, pages: &[PageImage], regions: &[MaskRegion]) -> Vec<PageImage> {
        if regions.is_empty() {
            return pages.to_vec();
        }
        debug!(pages = pages.len(), regions = regions.len(), "applying masks");

        let mut masked = Vec::with_capacity(pages.len());
        for (index, page) in pages.iter().enumerate() {
            let page_number = index as u32 + 1;
            let mut copy = page.clone();
            for region in regions.iter().filter(|r| r.page == page_number) {
                self.paint(&mut copy, region);
            }
            masked.push(copy);
        }
        masked
    }

    fn paint(&self, page: &mut PageImage, region: &MaskRegion) {
        let (width, height) = page.dimensions();
        let bbox = &region.bounding_box;
        let x0 = bbox.x.max(0.0).floor() as u32;
        let y0 = bbox.y.max(0.0).floor() as u32;
        let x1 = (bbox.right().ceil() as u32).min(width);
        let y1 = (bbox.bottom().ceil() as u32).min(height);

        let color = match self.mode {
            MaskMode::Opaque => self.color,
            MaskMode::Debug => category_color(&region.entity_category),
        };
        for y in y0..y1 {
            for x in x0..x1 {
                match self.mode {
                    MaskMode::Opaque => page.put_pixel(x, y, color),
                    MaskMode::Debug => {
                        let old = page.get_pixel(x, y);
                        let blended = Rgb([
                            ((old[0] as u16 + color[0] as u16) / 2) as u8,
                            ((old[1] as u16 + color[1] as u16) / 2) as u8,
                            ((old[2] as u16 + color[2] as u16) / 2) as u8,
                        ]);
                        page.put_pixel(x, y, blended);
                    }
                }
            }
        }
    }
}

/// Stable color per category for debug fills.
fn category_color(category: &str) -> Rgb<u8> {
    let hash = category
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
    Rgb([
        160 + (hash % 96) as u8,
        40 + ((hash >> 8) % 160) as u8,
        40 + ((hash >> 16) % 160) as u8,
    ])
}

/// Project mask regions from OCR coordinate space into pixel space.
///
/// Providers disagree about units: Azure reports pixels (or inches for
/// PDF sources), Textract normalizes everything to [0, 1]. The masker
/// paints pixels, so each region is scaled by the ratio between its
/// page's pixel dimensions and the OCR-reported page dimensions. When
/// the spaces already agree the scale factor is 1 and coordinates pass
/// through untouched.
pub fn project_regions_to_pixels(
    regions: &[MaskRegion],
    ocr_pages: &[OcrPage],
    page_images: &[PageImage],
) -> Vec<MaskRegion> {
    regions
        .iter()
        .map(|region| {
            let ocr_page = ocr_pages.iter().find(|p| p.page_number == region.page);
            let image = page_images.get(region.page as usize - 1);
            let (Some(ocr_page), Some(image)) = (ocr_page, image) else {
                return region.clone();
            };
            if ocr_page.width <= 0.0 || ocr_page.height <= 0.0 {
                return region.clone();
            }
            let scale_x = image.width() as f64 / ocr_page.width;
            let scale_y = image.height() as f64 / ocr_page.height;
            if (scale_x - 1.0).abs() < 1e-9 && (scale_y - 1.0).abs() < 1e-9 {
                return region.clone();
            }
            let bbox = region.bounding_box;
            let scaled = crate::models::BoundingBox::new(
                bbox.page,
                bbox.x * scale_x,
                bbox.y * scale_y,
                bbox.width * scale_x,
                bbox.height * scale_y,
            );
            MaskRegion::for_box(scaled, region.entity_category.clone(), region.confidence)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BoundingBox;
    use image::RgbImage;

    fn white_page(w: u32, h: u32) -> PageImage {
        RgbImage::from_pixel(w, h, Rgb([255, 255, 255]))
    }

    fn region(page: u32, x: f64, y: f64, w: f64, h: f64) -> MaskRegion {
        MaskRegion::for_box(BoundingBox::new(page, x, y, w, h), "Name".to_string(), 0.9)
    }

    #[test]
    fn test_paints_black_rectangle() {
        let masker = ImageMasker::new();
        let pages = vec![white_page(100, 100)];
        let masked = masker.apply(&pages, &[region(1, 10.0, 10.0, 20.0, 20.0)]);

        assert_eq!(masked[0].get_pixel(15, 15), &Rgb([0, 0, 0]));
        assert_eq!(masked[0].get_pixel(29, 29), &Rgb([0, 0, 0]));
        assert_eq!(masked[0].get_pixel(31, 31), &Rgb([255, 255, 255]));
        assert_eq!(masked[0].get_pixel(5, 5), &Rgb([255, 255, 255]));
    }

    #[test]
    fn test_inputs_never_mutated() {
        let masker = ImageMasker::new();
        let pages = vec![white_page(50, 50)];
        let _ = masker.apply(&pages, &[region(1, 0.0, 0.0, 50.0, 50.0)]);
        assert_eq!(pages[0].get_pixel(25, 25), &Rgb([255, 255, 255]));
    }

    #[test]
    fn test_pages_without_regions_copied_unchanged() {
        let masker = ImageMasker::new();
        let pages = vec![white_page(20, 20), white_page(20, 20)];
        let masked = masker.apply(&pages, &[region(2, 0.0, 0.0, 10.0, 10.0)]);
        assert_eq!(masked[0].as_raw(), pages[0].as_raw());
        assert_ne!(masked[1].as_raw(), pages[1].as_raw());
    }

    #[test]
    fn test_masking_is_idempotent() {
        let masker = ImageMasker::new();
        let pages = vec![white_page(40, 40)];
        let regions = vec![
            region(1, 5.0, 5.0, 20.0, 10.0),
            region(1, 10.0, 8.0, 20.0, 10.0), // overlapping
        ];
        let once = masker.apply(&pages, &regions);
        let twice = masker.apply(&once, &regions);
        assert_eq!(once[0].as_raw(), twice[0].as_raw());
    }

    #[test]
    fn test_region_clamped_to_page_bounds() {
        let masker = ImageMasker::new();
        let pages = vec![white_page(30, 30)];
        // Extends past the page on all sides; must not panic.
        let masked = masker.apply(&pages, &[region(1, 20.0, 20.0, 100.0, 100.0)]);
        assert_eq!(masked[0].get_pixel(29, 29), &Rgb([0, 0, 0]));
        assert_eq!(masked[0].get_pixel(10, 10), &Rgb([255, 255, 255]));
    }

    #[test]
    fn test_debug_mode_refused_in_production() {
        assert!(matches!(
            ImageMasker::debug_mode(DeploymentEnv::Production),
            Err(MaskingError::DebugInProduction)
        ));
        assert!(ImageMasker::debug_mode(DeploymentEnv::Development).is_ok());
    }
}
