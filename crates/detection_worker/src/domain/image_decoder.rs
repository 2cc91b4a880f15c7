use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::domain::{DetectionError, DetectionResult};
use image::{ImageFormat, ImageReader};
use std::io::Cursor;

/// An image decoded from a message payload, kept in its encoded form
/// so it can be forwarded to the vision model unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedImage {
    bytes: Vec<u8>,
    format: ImageFormat,
    width: u32,
    height: u32,
}

impl DecodedImage {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn mime_type(&self) -> &'static str {
        self.format.to_mime_type()
    }
}

/// Decode a base64 payload into an image
///
/// Whitespace anywhere in the payload is ignored and an optional
/// `data:<mime>;base64,` prefix is accepted. The image format is detected
/// from content and the pixel data is fully decoded to reject truncated or
/// corrupt files.
pub fn decode_image_payload(payload: &[u8]) -> DetectionResult<DecodedImage> {
    let compact: Vec<u8> = payload
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();

    let encoded = match compact.strip_prefix(b"data:") {
        Some(rest) => match rest.iter().position(|&b| b == b',') {
            Some(comma) => &rest[comma + 1..],
            None => {
                return Err(DetectionError::Decode(
                    "data URL payload is missing a ',' separator".to_string(),
                ));
            }
        },
        None => compact.as_slice(),
    };

    if encoded.is_empty() {
        return Err(DetectionError::Decode("payload is empty".to_string()));
    }

    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| DetectionError::Decode(format!("invalid base64: {}", e)))?;

    let reader = ImageReader::new(Cursor::new(bytes.as_slice()))
        .with_guessed_format()
        .map_err(|e| DetectionError::Decode(format!("failed to read image bytes: {}", e)))?;

    let format = reader.format().ok_or_else(|| {
        DetectionError::Decode(format!(
            "unrecognized image format ({} bytes)",
            bytes.len()
        ))
    })?;

    let image = reader
        .decode()
        .map_err(|e| DetectionError::Decode(format!("corrupt {:?} image: {}", format, e)))?;

    Ok(DecodedImage {
        width: image.width(),
        height: image.height(),
        format,
        bytes,
    })
}
