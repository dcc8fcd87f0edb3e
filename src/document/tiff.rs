//! Multi-page TIFF decode/encode.

use std::fs::File;
use std::io::Cursor;

use image::RgbImage;
use tempfile::NamedTempFile;
use tiff::decoder::ifd::Value;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::compression::{Compression, Lzw};
use tiff::encoder::{colortype, Rational, TiffEncoder, TiffKind, TiffKindBig};
use tiff::tags::{ResolutionUnit, Tag};
use tiff::ColorType;
use tracing::debug;

use super::{DocumentError, PageImage};
use crate::models::{DocumentFormat, DocumentMetadata};

/// Lazy page-by-page TIFF decoder.
///
/// The compressed source bytes stay in memory; decoded pages are
/// produced one at a time so the caller controls peak pixel memory.
pub struct TiffPageReader {
    decoder: Decoder<Cursor<Vec<u8>>>,
    metadata: DocumentMetadata,
    page_count: u32,
    done: bool,
}

impl TiffPageReader {
    pub fn open(bytes: &[u8]) -> Result<Self, DocumentError> {
        let page_count = count_pages(bytes)?;

        let mut decoder = Decoder::new(Cursor::new(bytes.to_vec()))
            .map_err(|e| DocumentError::Format(format!("TIFF open failed: {e}")))?
            .with_limits(Limits::unlimited());

        let metadata = extract_metadata(&mut decoder, page_count)?;
        debug!(pages = page_count, dpi = ?metadata.dpi, "opened TIFF");

        Ok(Self {
            decoder,
            metadata,
            page_count,
            done: page_count == 0,
        })
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    pub fn metadata(&self) -> &DocumentMetadata {
        &self.metadata
    }

    pub fn into_metadata(self) -> DocumentMetadata {
        self.metadata
    }

    pub fn next_page(&mut self) -> Result<Option<PageImage>, DocumentError> {
        if self.done {
            return Ok(None);
        }
        let page = decode_current_page(&mut self.decoder)?;
        if self.decoder.more_images() {
            self.decoder
                .next_image()
                .map_err(|e| DocumentError::Format(format!("TIFF page advance failed: {e}")))?;
        } else {
            self.done = true;
        }
        Ok(Some(page))
    }
}

/// Count directory entries without decoding pixel data.
fn count_pages(bytes: &[u8]) -> Result<u32, DocumentError> {
    let mut decoder = Decoder::new(Cursor::new(bytes.to_vec()))
        .map_err(|e| DocumentError::Format(format!("TIFF open failed: {e}")))?;
    let mut count = 1u32;
    while decoder.more_images() {
        decoder
            .next_image()
            .map_err(|e| DocumentError::Format(format!("TIFF directory walk failed: {e}")))?;
        count += 1;
    }
    Ok(count)
}

fn extract_metadata(
    decoder: &mut Decoder<Cursor<Vec<u8>>>,
    page_count: u32,
) -> Result<DocumentMetadata, DocumentError> {
    let (width, height) = decoder
        .dimensions()
        .map_err(|e| DocumentError::Format(format!("TIFF dimensions unreadable: {e}")))?;

    let color_mode = match decoder.colortype() {
        Ok(ColorType::Gray(bits)) => Some(format!("gray{bits}")),
        Ok(ColorType::RGB(bits)) => Some(format!("rgb{bits}")),
        Ok(ColorType::RGBA(bits)) => Some(format!("rgba{bits}")),
        Ok(_) | Err(_) => None,
    };

    let dpi_x = read_rational(decoder, Tag::XResolution);
    let dpi_y = read_rational(decoder, Tag::YResolution);
    let dpi = match (dpi_x, dpi_y) {
        (Some(x), Some(y)) => Some((x, y)),
        (Some(x), None) => Some((x, x)),
        (None, Some(y)) => Some((y, y)),
        (None, None) => None,
    };

    let compression = match decoder.find_tag(Tag::Compression) {
        Ok(Some(Value::Short(code))) => Some(compression_name(code as u32)),
        Ok(Some(Value::Unsigned(code))) => Some(compression_name(code)),
        _ => None,
    };

    let mut metadata = DocumentMetadata::new(DocumentFormat::Tiff);
    metadata.dpi = dpi;
    metadata.color_mode = color_mode;
    metadata.compression = compression;
    metadata.page_count = page_count;
    metadata.extras = serde_json::json!({ "original_size": [width, height] });
    Ok(metadata)
}

fn read_rational(decoder: &mut Decoder<Cursor<Vec<u8>>>, tag: Tag) -> Option<u32> {
    match decoder.find_tag(tag) {
        Ok(Some(Value::Rational(num, den))) if den != 0 => Some(num / den),
        Ok(Some(Value::RationalBig(num, den))) if den != 0 => Some((num / den) as u32),
        _ => None,
    }
}

fn compression_name(code: u32) -> String {
    match code {
        1 => "none".to_string(),
        5 => "lzw".to_string(),
        6 | 7 => "jpeg".to_string(),
        8 => "deflate".to_string(),
        32773 => "packbits".to_string(),
        other => format!("compression-{other}"),
    }
}

/// Decode the decoder's current directory into an RGB8 page.
///
/// Gray and RGBA sources are normalized to RGB; 16-bit samples are
/// narrowed to their high byte. Dimensions are never altered.
fn decode_current_page(
    decoder: &mut Decoder<Cursor<Vec<u8>>>,
) -> Result<PageImage, DocumentError> {
    let (width, height) = decoder
        .dimensions()
        .map_err(|e| DocumentError::Format(format!("TIFF dimensions unreadable: {e}")))?;
    let colortype = decoder
        .colortype()
        .map_err(|e| DocumentError::Format(format!("TIFF color type unreadable: {e}")))?;
    let decoded = decoder
        .read_image()
        .map_err(|e| DocumentError::Format(format!("TIFF page decode failed: {e}")))?;

    let samples: Vec<u8> = match decoded {
        DecodingResult::U8(data) => data,
        DecodingResult::U16(data) => data.into_iter().map(|v| (v >> 8) as u8).collect(),
        _ => {
            return Err(DocumentError::Unsupported(
                "TIFF sample format (only 8/16-bit unsigned supported)".to_string(),
            ))
        }
    };

    let rgb = match colortype {
        ColorType::Gray(_) => {
            let mut out = Vec::with_capacity(samples.len() * 3);
            for v in samples {
                out.extend_from_slice(&[v, v, v]);
            }
            out
        }
        ColorType::RGB(_) => samples,
        ColorType::RGBA(_) => {
            let mut out = Vec::with_capacity(samples.len() / 4 * 3);
            for px in samples.chunks_exact(4) {
                out.extend_from_slice(&px[..3]);
            }
            out
        }
        other => {
            return Err(DocumentError::Unsupported(format!(
                "TIFF color type {other:?}"
            )))
        }
    };

    RgbImage::from_raw(width, height, rgb).ok_or_else(|| {
        DocumentError::Format("TIFF sample count does not match dimensions".to_string())
    })
}

/// Write one RGB page into an open encoder, carrying the resolution tags.
fn write_page<W, K, D>(
    encoder: &mut TiffEncoder<W, K>,
    page: &PageImage,
    dpi: (u32, u32),
    compression: D,
) -> Result<(), DocumentError>
where
    W: std::io::Write + std::io::Seek,
    K: TiffKind,
    D: Compression,
{
    let (width, height) = page.dimensions();
    let mut image = encoder
        .new_image_with_compression::<colortype::RGB8, D>(width, height, compression)
        .map_err(|e| DocumentError::Encode(format!("TIFF page setup failed: {e}")))?;
    image.resolution_unit(ResolutionUnit::Inch);
    image.x_resolution(Rational { n: dpi.0, d: 1 });
    image.y_resolution(Rational { n: dpi.1, d: 1 });
    image
        .write_data(page.as_raw())
        .map_err(|e| DocumentError::Encode(format!("TIFF page write failed: {e}")))?;
    Ok(())
}

/// Encode pages as one in-memory multi-page TIFF.
pub fn encode_multipage<D>(
    pages: &[PageImage],
    dpi: (u32, u32),
    compression: D,
) -> Result<Vec<u8>, DocumentError>
where
    D: Compression + Clone,
{
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut encoder = TiffEncoder::new(&mut cursor)
            .map_err(|e| DocumentError::Encode(format!("TIFF encoder setup failed: {e}")))?;
        for page in pages {
            write_page(&mut encoder, page, dpi, compression.clone())?;
        }
    }
    Ok(cursor.into_inner())
}

/// Append-only BigTIFF encoder backed by a temp file.
///
/// Used for documents past the streaming threshold: each masked batch is
/// written and dropped, so peak memory is one page regardless of
/// document length.
pub struct StreamingTiffWriter {
    tmp: NamedTempFile,
    encoder: Option<TiffEncoder<File, TiffKindBig>>,
    dpi: (u32, u32),
    pages_written: u32,
}

impl StreamingTiffWriter {
    pub fn create(dpi: (u32, u32)) -> Result<Self, DocumentError> {
        let tmp = NamedTempFile::new()?;
        let file = tmp.reopen()?;
        let encoder = TiffEncoder::new_big(file)
            .map_err(|e| DocumentError::Encode(format!("BigTIFF encoder setup failed: {e}")))?;
        Ok(Self {
            tmp,
            encoder: Some(encoder),
            dpi,
            pages_written: 0,
        })
    }

    pub fn pages_written(&self) -> u32 {
        self.pages_written
    }

    pub fn append_page(&mut self, page: &PageImage) -> Result<(), DocumentError> {
        let Some(encoder) = self.encoder.as_mut() else {
            return Err(DocumentError::Encode(
                "streaming writer already finished".to_string(),
            ));
        };
        write_page(encoder, page, self.dpi, Lzw)?;
        self.pages_written += 1;
        Ok(())
    }

    /// Close the encoder and read the assembled document back. The temp
    /// file is removed when `self` drops.
    pub fn finish(mut self) -> Result<Vec<u8>, DocumentError> {
        // Each page's directory is flushed as it is written; dropping
        // the encoder closes its handle on the temp file.
        self.encoder.take();
        let bytes = std::fs::read(self.tmp.path())?;
        debug!(
            pages = self.pages_written,
            size = bytes.len(),
            "finished streaming TIFF"
        );
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_gray_pages_normalize_to_rgb() {
        // Encode a gray image with the tiff crate, then read it back
        // through the page reader.
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut encoder = TiffEncoder::new(&mut cursor).unwrap();
            let data: Vec<u8> = vec![0, 64, 128, 255];
            encoder
                .write_image::<colortype::Gray8>(2, 2, &data)
                .unwrap();
        }
        let bytes = cursor.into_inner();

        let mut reader = TiffPageReader::open(&bytes).unwrap();
        assert_eq!(reader.page_count(), 1);
        let page = reader.next_page().unwrap().unwrap();
        assert_eq!(page.dimensions(), (2, 2));
        assert_eq!(page.get_pixel(1, 0), &Rgb([64, 64, 64]));
        assert_eq!(page.get_pixel(1, 1), &Rgb([255, 255, 255]));
        assert!(reader.next_page().unwrap().is_none());
    }

    #[test]
    fn test_missing_resolution_reports_no_dpi() {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut encoder = TiffEncoder::new(&mut cursor).unwrap();
            encoder
                .write_image::<colortype::RGB8>(1, 1, &[1, 2, 3])
                .unwrap();
        }
        let reader = TiffPageReader::open(&cursor.into_inner()).unwrap();
        assert_eq!(reader.metadata().dpi, None);
    }

    #[test]
    fn test_streaming_writer_requires_pages_before_finish() {
        let writer = StreamingTiffWriter::create((300, 300)).unwrap();
        assert_eq!(writer.pages_written(), 0);
        // Finishing with zero pages yields a header-only file that the
        // reader rejects as unreadable.
        let bytes = writer.finish().unwrap();
        assert!(TiffPageReader::open(&bytes).is_err());
    }
}
