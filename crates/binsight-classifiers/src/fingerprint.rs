//! Content fingerprints used as prediction cache keys

use image::RgbImage;
use sha2::{Digest, Sha256};
use std::fmt;

const DOMAIN_TAG: &[u8] = b"binsight.prediction.v1";

/// Identity used when no model is loaded
pub const NO_MODEL_IDENTITY: &str = "none";

/// SHA-256 over the image pixels and the configuration that produced a prediction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for CacheKey {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Fingerprint `image` under the given augmentation flag and model identity.
///
/// The image is hashed in a canonical raw form (dimensions then RGB8 rows), so two
/// images collide only if their pixels are identical.
pub fn fingerprint(image: &RgbImage, augment: bool, model_identity: &str) -> CacheKey {
    let (width, height) = image.dimensions();
    let mut hasher = Sha256::new();

    hasher.update(DOMAIN_TAG);
    hasher.update(width.to_le_bytes());
    hasher.update(height.to_le_bytes());
    hasher.update(image.as_raw());
    hasher.update(if augment { b"_tta".as_slice() } else { b"_no_tta".as_slice() });
    hasher.update((model_identity.len() as u64).to_le_bytes());
    hasher.update(model_identity.as_bytes());

    CacheKey(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_identical_pixels_same_key() {
        let a = RgbImage::from_pixel(8, 8, Rgb([10, 20, 30]));
        let b = RgbImage::from_pixel(8, 8, Rgb([10, 20, 30]));
        assert_eq!(fingerprint(&a, false, "m:1"), fingerprint(&b, false, "m:1"));
    }

    #[test]
    fn test_configuration_is_part_of_key() {
        let image = RgbImage::from_pixel(8, 8, Rgb([10, 20, 30]));
        let base = fingerprint(&image, false, "m:1");
        assert_ne!(base, fingerprint(&image, true, "m:1"));
        assert_ne!(base, fingerprint(&image, false, "m:2"));
        assert_ne!(base, fingerprint(&image, false, NO_MODEL_IDENTITY));
    }

    #[test]
    fn test_dimensions_are_part_of_key() {
        // Same byte buffer, different geometry
        let wide = RgbImage::from_pixel(4, 2, Rgb([1, 1, 1]));
        let tall = RgbImage::from_pixel(2, 4, Rgb([1, 1, 1]));
        assert_eq!(wide.as_raw(), tall.as_raw());
        assert_ne!(fingerprint(&wide, false, "m"), fingerprint(&tall, false, "m"));
    }

    #[test]
    fn test_single_pixel_change() {
        let a = RgbImage::from_pixel(8, 8, Rgb([10, 20, 30]));
        let mut b = a.clone();
        b.put_pixel(7, 7, Rgb([10, 20, 31]));
        assert_ne!(fingerprint(&a, false, "m"), fingerprint(&b, false, "m"));
    }

    #[test]
    fn test_display_is_hex() {
        let key = fingerprint(&RgbImage::new(1, 1), false, "m");
        let hex = key.to_string();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
