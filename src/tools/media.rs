//! Raster image normalization for model-bound payloads.
//!
//! Every image headed to the model must satisfy `longest side <= 2000px` and
//! `bytes <= 5 MB`. Decoding honors EXIF orientation. Re-encoding walks a
//! progressive grid of target sizes and JPEG qualities; if nothing fits, the
//! smallest attempt is returned together with a warning.

use image::imageops::FilterType;
use image::DynamicImage;
use std::io::Cursor;

/// Maximum longest side in pixels.
pub const MAX_SIDE: u32 = 2000;
/// Maximum encoded size in bytes.
pub const MAX_BYTES: usize = 5 * 1024 * 1024;

const SIZE_STEPS: &[u32] = &[2000, 1600, 1200, 960, 640];
const QUALITY_STEPS: &[u8] = &[85, 75, 60, 45];

pub struct NormalizedImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    /// Set when the constraints could not be met and the smallest attempt was
    /// returned instead.
    pub warning: Option<String>,
}

/// Normalize raw image bytes to satisfy the model-endpoint size rules.
///
/// Returns an error only when the payload cannot be decoded at all; the
/// caller replaces the block with explanatory text in that case.
pub fn normalize_image(bytes: &[u8]) -> Result<NormalizedImage, String> {
    let decoded = image::load_from_memory(bytes)
        .map_err(|e| format!("unsupported or corrupt image data: {}", e))?;
    let orientation = exif_orientation(bytes);
    let oriented = apply_orientation(decoded, orientation);

    let longest = oriented.width().max(oriented.height());

    // Already compliant and needed no rotation: hand back the original bytes
    // untouched so output is never larger than input.
    if orientation <= 1 && longest <= MAX_SIDE && bytes.len() <= MAX_BYTES {
        return Ok(NormalizedImage {
            bytes: bytes.to_vec(),
            mime_type: sniff_mime(bytes),
            warning: None,
        });
    }

    let mut smallest: Option<Vec<u8>> = None;
    for &side in SIZE_STEPS {
        let target_side = side.min(longest);
        let resized = if target_side < longest {
            oriented.resize(target_side, target_side, FilterType::Lanczos3)
        } else {
            oriented.clone()
        };
        for &quality in QUALITY_STEPS {
            let encoded = encode_jpeg(&resized, quality)?;
            if encoded.len() <= MAX_BYTES {
                return Ok(NormalizedImage {
                    bytes: encoded,
                    mime_type: "image/jpeg".to_string(),
                    warning: None,
                });
            }
            if smallest
                .as_ref()
                .map(|s| encoded.len() < s.len())
                .unwrap_or(true)
            {
                smallest = Some(encoded);
            }
        }
    }

    let fallback = smallest.unwrap_or_else(|| bytes.to_vec());
    let warning = format!(
        "could not reduce image below {} bytes; returning smallest attempt ({} bytes)",
        MAX_BYTES,
        fallback.len()
    );
    Ok(NormalizedImage {
        bytes: fallback,
        mime_type: "image/jpeg".to_string(),
        warning: Some(warning),
    })
}

fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, String> {
    let mut buf = Cursor::new(Vec::new());
    let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, quality);
    rgb.write_with_encoder(encoder)
        .map_err(|e| format!("jpeg encode failed: {}", e))?;
    Ok(buf.into_inner())
}

/// Read the EXIF orientation tag (1-8); 1 means no transform needed.
fn exif_orientation(bytes: &[u8]) -> u32 {
    let mut cursor = Cursor::new(bytes);
    let reader = match exif::Reader::new().read_from_container(&mut cursor) {
        Ok(r) => r,
        Err(_) => return 1,
    };
    reader
        .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
        .and_then(|f| f.value.get_uint(0))
        .unwrap_or(1)
}

fn apply_orientation(img: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}

fn sniff_mime(bytes: &[u8]) -> String {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        "image/png".to_string()
    } else if bytes.starts_with(&[0xFF, 0xD8]) {
        "image/jpeg".to_string()
    } else if bytes.starts_with(b"GIF8") {
        "image/gif".to_string()
    } else if bytes.len() > 11 && &bytes[8..12] == b"WEBP" {
        "image/webp".to_string()
    } else {
        "application/octet-stream".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = ImageBuffer::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        });
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut buf, image::ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    #[test]
    fn small_image_is_returned_unchanged() {
        let bytes = png_bytes(100, 80);
        let out = normalize_image(&bytes).unwrap();
        assert_eq!(out.bytes, bytes);
        assert_eq!(out.mime_type, "image/png");
        assert!(out.warning.is_none());
    }

    #[test]
    fn oversized_image_is_scaled_down() {
        let bytes = png_bytes(3000, 2200);
        let out = normalize_image(&bytes).unwrap();
        let decoded = image::load_from_memory(&out.bytes).unwrap();
        assert!(decoded.width().max(decoded.height()) <= MAX_SIDE);
        assert!(out.bytes.len() <= MAX_BYTES);
        assert_eq!(out.mime_type, "image/jpeg");
    }

    #[test]
    fn output_never_larger_than_oversized_input() {
        let bytes = png_bytes(2600, 2600);
        let out = normalize_image(&bytes).unwrap();
        assert!(out.bytes.len() <= bytes.len().max(MAX_BYTES));
    }

    #[test]
    fn garbage_bytes_are_rejected() {
        assert!(normalize_image(b"not an image").is_err());
    }
}
