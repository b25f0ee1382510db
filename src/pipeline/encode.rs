//! Image encoding: raw page-image pixels → RGBA → base64 PNG.
//!
//! Images embedded in a PDF come out of the extractor in whatever layout the
//! PDF stored them: grayscale, RGB or RGBA. Everything is normalised to
//! 4-channel RGBA before encoding so that the model and the EPUB reader both
//! receive one predictable format. PNG is lossless, which keeps diagrams and
//! text inside figures crisp.
//!
//! A pixel buffer whose length matches none of the 1/3/4-channel layouts is
//! read as grayscale (missing bytes become black) instead of being rejected,
//! so one odd image never aborts a page.

use crate::pipeline::extract::RasterImage;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{DynamicImage, RgbaImage};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use tracing::debug;

/// An image asset carried through the pipeline: sent to the model as an
/// inline part, persisted in the session, finally written into the EPUB.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedImage {
    pub mime_type: String,
    /// Base64 (standard alphabet, padded) of the encoded file.
    pub data: String,
}

/// Why an image could not be turned into an asset.
#[derive(Debug, thiserror::Error)]
pub enum ImageEncodeError {
    #[error("image has zero area ({width}x{height})")]
    Empty { width: u32, height: u32 },

    #[error("image dimensions {width}x{height} overflow")]
    TooLarge { width: u32, height: u32 },

    #[error("PNG encoding failed: {0}")]
    Png(#[from] image::ImageError),
}

/// Channel layout detected from a buffer's length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    Gray,
    Rgb,
    Rgba,
    /// Length matches nothing; read as zero-padded grayscale.
    Malformed,
}

pub fn detect_layout(width: u32, height: u32, len: usize) -> PixelLayout {
    let Some(area) = (width as usize).checked_mul(height as usize) else {
        return PixelLayout::Malformed;
    };
    if Some(len) == area.checked_mul(4) {
        PixelLayout::Rgba
    } else if Some(len) == area.checked_mul(3) {
        PixelLayout::Rgb
    } else if len == area {
        PixelLayout::Gray
    } else {
        PixelLayout::Malformed
    }
}

/// Expand any supported layout to RGBA.
pub fn normalize_to_rgba(raster: &RasterImage) -> Result<RgbaImage, ImageEncodeError> {
    let (width, height) = (raster.width, raster.height);
    if width == 0 || height == 0 {
        return Err(ImageEncodeError::Empty { width, height });
    }
    let area = (width as usize)
        .checked_mul(height as usize)
        .filter(|a| a.checked_mul(4).is_some())
        .ok_or(ImageEncodeError::TooLarge { width, height })?;

    let src = &raster.pixels;
    let layout = detect_layout(width, height, src.len());
    let mut rgba = Vec::with_capacity(area * 4);

    match layout {
        PixelLayout::Rgba => rgba.extend_from_slice(src),
        PixelLayout::Rgb => {
            for px in src.chunks_exact(3) {
                rgba.extend_from_slice(&[px[0], px[1], px[2], 255]);
            }
        }
        PixelLayout::Gray | PixelLayout::Malformed => {
            if layout == PixelLayout::Malformed {
                debug!(
                    "Pixel buffer of {} bytes fits no layout for {}x{}, using grayscale",
                    src.len(),
                    width,
                    height
                );
            }
            for i in 0..area {
                let v = src.get(i).copied().unwrap_or(0);
                rgba.extend_from_slice(&[v, v, v, 255]);
            }
        }
    }

    RgbaImage::from_raw(width, height, rgba).ok_or(ImageEncodeError::TooLarge { width, height })
}

/// Normalise and PNG-encode a raster, ready for the model and the archive.
pub fn encode_raster(raster: &RasterImage) -> Result<ExtractedImage, ImageEncodeError> {
    let rgba = normalize_to_rgba(raster)?;
    let mut buf = Vec::new();
    DynamicImage::ImageRgba8(rgba).write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;

    let data = STANDARD.encode(&buf);
    debug!(
        "Encoded {}x{} image → {} bytes base64",
        raster.width,
        raster.height,
        data.len()
    );

    Ok(ExtractedImage {
        mime_type: "image/png".to_string(),
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raster(width: u32, height: u32, pixels: Vec<u8>) -> RasterImage {
        RasterImage {
            width,
            height,
            pixels,
        }
    }

    #[test]
    fn rgb_is_expanded_with_opaque_alpha() {
        let img = normalize_to_rgba(&raster(2, 1, vec![10, 20, 30, 40, 50, 60])).unwrap();
        assert_eq!(img.as_raw(), &vec![10, 20, 30, 255, 40, 50, 60, 255]);
    }

    #[test]
    fn gray_is_replicated() {
        let img = normalize_to_rgba(&raster(2, 1, vec![7, 9])).unwrap();
        assert_eq!(img.as_raw(), &vec![7, 7, 7, 255, 9, 9, 9, 255]);
    }

    #[test]
    fn rgba_passes_through() {
        let px = vec![1, 2, 3, 4, 5, 6, 7, 8];
        let img = normalize_to_rgba(&raster(1, 2, px.clone())).unwrap();
        assert_eq!(img.as_raw(), &px);
    }

    #[test]
    fn malformed_length_falls_back_to_grayscale() {
        // 2x2 needs 4, 12 or 16 bytes; 5 matches none.
        let r = raster(2, 2, vec![100, 101, 102, 103, 104]);
        assert_eq!(detect_layout(2, 2, 5), PixelLayout::Malformed);
        let img = normalize_to_rgba(&r).unwrap();
        assert_eq!(img.as_raw().len(), 16);
        assert_eq!(&img.as_raw()[..4], &[100, 100, 100, 255]);

        let short = normalize_to_rgba(&raster(3, 1, vec![42])).unwrap();
        assert_eq!(short.as_raw(), &vec![42, 42, 42, 255, 0, 0, 0, 255, 0, 0, 0, 255]);

        let asset = encode_raster(&r).unwrap();
        assert_eq!(asset.mime_type, "image/png");
    }

    #[test]
    fn zero_area_is_an_error() {
        assert!(matches!(
            encode_raster(&raster(0, 5, vec![])),
            Err(ImageEncodeError::Empty { .. })
        ));
    }

    #[test]
    fn encoded_png_round_trips_through_base64() {
        let asset = encode_raster(&raster(4, 4, vec![200; 48])).unwrap();
        let bytes = STANDARD.decode(&asset.data).expect("valid base64");
        assert_eq!(&bytes[1..4], b"PNG");
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.width(), 4);
        assert_eq!(decoded.height(), 4);
    }

    #[test]
    fn serialises_with_camel_case_keys() {
        let img = ExtractedImage {
            mime_type: "image/png".into(),
            data: "AAAA".into(),
        };
        let json = serde_json::to_string(&img).unwrap();
        assert_eq!(json, r#"{"mimeType":"image/png","data":"AAAA"}"#);
    }
}
