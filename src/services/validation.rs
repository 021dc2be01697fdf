use std::collections::BTreeMap;
use std::io::Cursor;

use image::{ImageFormat, ImageReader};

/// Default upload ceiling: 10 MB.
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

pub const DEFAULT_LIST_LIMIT: u32 = 10;
pub const MAX_LIST_LIMIT: u32 = 100;

const MAX_METADATA_ENTRIES: usize = 32;
const MAX_METADATA_KEY_CHARS: usize = 64;
const MAX_METADATA_VALUE_CHARS: usize = 512;

/// Upload accepted for processing, with the facts sniffed from its header.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedImage {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
}

impl ValidatedImage {
    pub fn content_type(&self) -> &'static str {
        match self.format {
            ImageFormat::Png => "image/png",
            ImageFormat::WebP => "image/webp",
            _ => "image/jpeg",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self.format {
            ImageFormat::Png => "png",
            ImageFormat::WebP => "webp",
            _ => "jpg",
        }
    }
}

/// Validate an uploaded image payload.
///
/// Checks, in order:
/// - payload is non-empty
/// - payload fits within `max_bytes`
/// - format is JPEG, PNG or WebP
/// - header decodes to non-zero dimensions
pub fn validate_image(bytes: &[u8], max_bytes: usize) -> Result<ValidatedImage, ValidationError> {
    if bytes.is_empty() {
        return Err(ValidationError::Empty);
    }

    if bytes.len() > max_bytes {
        return Err(ValidationError::TooLarge {
            size: bytes.len(),
            max: max_bytes,
        });
    }

    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| ValidationError::Undecodable(e.to_string()))?;

    let format = match reader.format() {
        Some(f @ (ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::WebP)) => f,
        Some(other) => return Err(ValidationError::UnsupportedFormat(format!("{other:?}"))),
        None => return Err(ValidationError::UnsupportedFormat("unknown".to_string())),
    };

    let (width, height) = reader
        .into_dimensions()
        .map_err(|e| ValidationError::Undecodable(e.to_string()))?;

    if width == 0 || height == 0 {
        return Err(ValidationError::Undecodable(format!(
            "image has zero dimension ({width}x{height})"
        )));
    }

    Ok(ValidatedImage {
        format,
        width,
        height,
    })
}

/// 1..=max printable characters (not bytes) with no surrounding whitespace.
fn is_printable_token(value: &str, max_chars: usize) -> bool {
    let trimmed = value.trim();
    !trimmed.is_empty()
        && trimmed.len() == value.len()
        && value.chars().count() <= max_chars
        && !value.chars().any(|c| c.is_control())
}

/// Validate a client-supplied idempotency key.
pub fn validate_idempotency_key(key: &str) -> Result<(), ValidationError> {
    if !is_printable_token(key, 255) {
        return Err(ValidationError::InvalidIdempotencyKey);
    }
    Ok(())
}

pub fn validate_user_id(user_id: &str) -> Result<(), ValidationError> {
    if !is_printable_token(user_id, 128) {
        return Err(ValidationError::InvalidUserId);
    }
    Ok(())
}

/// Metadata is bounded in entry count and per-entry size.
pub fn validate_metadata(metadata: &BTreeMap<String, String>) -> Result<(), ValidationError> {
    if metadata.len() > MAX_METADATA_ENTRIES {
        return Err(ValidationError::InvalidMetadata(format!(
            "{} entries, at most {MAX_METADATA_ENTRIES} allowed",
            metadata.len()
        )));
    }
    for (key, value) in metadata {
        if !is_printable_token(key, MAX_METADATA_KEY_CHARS) {
            return Err(ValidationError::InvalidMetadata(format!("invalid key {key:?}")));
        }
        if value.chars().count() > MAX_METADATA_VALUE_CHARS {
            return Err(ValidationError::InvalidMetadata(format!(
                "value for {key:?} exceeds {MAX_METADATA_VALUE_CHARS} characters"
            )));
        }
    }
    Ok(())
}

pub fn validate_list_limit(limit: u32) -> Result<(), ValidationError> {
    if limit == 0 || limit > MAX_LIST_LIMIT {
        return Err(ValidationError::InvalidLimit(limit));
    }
    Ok(())
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ValidationError {
    #[error("Image payload is empty")]
    Empty,

    #[error("Image payload is {size} bytes, exceeding the {max} byte limit")]
    TooLarge { size: usize, max: usize },

    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("Image could not be decoded: {0}")]
    Undecodable(String),

    #[error("Idempotency key must be 1-255 printable characters without surrounding whitespace")]
    InvalidIdempotencyKey,

    #[error("User id must be 1-128 printable characters without surrounding whitespace")]
    InvalidUserId,

    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("Limit {0} is outside 1-100")]
    InvalidLimit(u32),
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn encode(format: ImageFormat, width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| Rgb([(x * 7) as u8, (y * 5) as u8, 90]));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, format).unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_accepts_png_and_jpeg() {
        let png = validate_image(&encode(ImageFormat::Png, 16, 8), DEFAULT_MAX_IMAGE_BYTES).unwrap();
        assert_eq!(png.format, ImageFormat::Png);
        assert_eq!((png.width, png.height), (16, 8));
        assert_eq!(png.content_type(), "image/png");
        assert_eq!(png.extension(), "png");

        let jpeg =
            validate_image(&encode(ImageFormat::Jpeg, 32, 32), DEFAULT_MAX_IMAGE_BYTES).unwrap();
        assert_eq!(jpeg.format, ImageFormat::Jpeg);
        assert_eq!(jpeg.content_type(), "image/jpeg");
    }

    #[test]
    fn test_rejects_empty_payload() {
        assert_eq!(validate_image(&[], DEFAULT_MAX_IMAGE_BYTES), Err(ValidationError::Empty));
    }

    #[test]
    fn test_rejects_oversized_payload() {
        let png = encode(ImageFormat::Png, 16, 16);
        let err = validate_image(&png, 10).unwrap_err();
        assert!(matches!(err, ValidationError::TooLarge { max: 10, .. }));
    }

    #[test]
    fn test_rejects_non_image_bytes() {
        let err = validate_image(b"definitely not an image", DEFAULT_MAX_IMAGE_BYTES).unwrap_err();
        assert!(matches!(err, ValidationError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_rejects_truncated_header() {
        let png = encode(ImageFormat::Png, 16, 16);
        let err = validate_image(&png[..12], DEFAULT_MAX_IMAGE_BYTES).unwrap_err();
        assert!(matches!(err, ValidationError::Undecodable(_)));
    }

    #[test]
    fn test_idempotency_key_rules() {
        assert!(validate_idempotency_key("abc").is_ok());
        assert!(validate_idempotency_key("").is_err());
        assert!(validate_idempotency_key(" abc").is_err());
        assert!(validate_idempotency_key("a\nb").is_err());
        assert!(validate_idempotency_key(&"k".repeat(256)).is_err());
    }

    #[test]
    fn test_key_length_counts_characters() {
        // 255 characters of up to three bytes each, well over 255 bytes.
        assert!(validate_idempotency_key(&"\u{e7}\u{e3}\u{20ac}".repeat(85)).is_ok());
        assert!(validate_idempotency_key(&"\u{20ac}".repeat(256)).is_err());
        assert!(validate_user_id(&"\u{e9}".repeat(100)).is_ok());
    }

    #[test]
    fn test_metadata_and_limit_bounds() {
        let mut metadata = BTreeMap::new();
        metadata.insert("orchard".to_string(), "north-field".to_string());
        assert!(validate_metadata(&metadata).is_ok());

        metadata.insert(" padded".to_string(), "x".to_string());
        assert!(matches!(
            validate_metadata(&metadata),
            Err(ValidationError::InvalidMetadata(_))
        ));

        let crowded: BTreeMap<String, String> =
            (0..33).map(|n| (format!("k{n}"), "v".to_string())).collect();
        assert!(validate_metadata(&crowded).is_err());

        assert!(validate_list_limit(1).is_ok());
        assert!(validate_list_limit(MAX_LIST_LIMIT).is_ok());
        assert_eq!(validate_list_limit(0), Err(ValidationError::InvalidLimit(0)));
        assert!(validate_list_limit(101).is_err());
    }
}
