//! Decoding of embedded image payloads.
//!
//! Sensor messages and uploads carry images as base64. Oversized images are
//! re-encoded as JPEG before they reach the database.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use image::ImageFormat;

/// Images larger than this after decoding get recompressed.
pub const MAX_IMAGE_BYTES: usize = 2 * 1024 * 1024;

const JPEG_QUALITY: u8 = 85;

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("invalid base64 image payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("unrecognized image format")]
    UnknownFormat,
    #[error("corrupt image payload: {0}")]
    Corrupt(#[from] image::ImageError),
}

/// A decoded image ready for storage.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub bytes: Vec<u8>,
    /// Lowercase format label (`jpeg`, `png`, ...), as stored alongside the blob.
    pub format: String,
}

/// Decode a base64 image payload, sniffing the format from magic bytes.
///
/// Payloads over [`MAX_IMAGE_BYTES`] are re-encoded as JPEG quality 85 to
/// keep blob rows bounded; smaller payloads are stored byte-for-byte.
pub fn decode_image(encoded: &str) -> Result<DecodedImage, ImageError> {
    let bytes = BASE64.decode(encoded.trim())?;
    let format = image::guess_format(&bytes).map_err(|_| ImageError::UnknownFormat)?;

    if bytes.len() <= MAX_IMAGE_BYTES {
        return Ok(DecodedImage {
            bytes,
            format: format_label(format).to_string(),
        });
    }

    let decoded = image::load_from_memory_with_format(&bytes, format)?;
    let mut recompressed = Vec::new();
    let encoder =
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut recompressed, JPEG_QUALITY);
    decoded.write_with_encoder(encoder)?;
    tracing::debug!(
        original_bytes = bytes.len(),
        compressed_bytes = recompressed.len(),
        "recompressed oversized image"
    );

    Ok(DecodedImage {
        bytes: recompressed,
        format: "jpeg".to_string(),
    })
}

fn format_label(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Jpeg => "jpeg",
        ImageFormat::Png => "png",
        ImageFormat::Gif => "gif",
        ImageFormat::WebP => "webp",
        ImageFormat::Bmp => "bmp",
        ImageFormat::Tiff => "tiff",
        _ => "jpeg",
    }
}
