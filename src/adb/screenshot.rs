//! Screen capture decoding.

use image::RgbImage;

use super::connection::AdbError;

const PNG_MAGIC: &[u8; 8] = b"\x89PNG\r\n\x1a\n";

/// A captured screen.
#[derive(Debug, Clone)]
pub struct Screenshot {
    pub image: RgbImage,
    pub width: u32,
    pub height: u32,
}

impl Screenshot {
    pub fn new(image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            image,
            width,
            height,
        }
    }
}

/// Decode the PNG bytes written by `screencap -p`.
///
/// Secure screens (payment pages, some login forms) make screencap fail or
/// emit garbage; that surfaces as an error, never as a placeholder image.
pub fn decode_screencap(data: &[u8]) -> Result<Screenshot, AdbError> {
    if data.len() < PNG_MAGIC.len() {
        return Err(AdbError::InvalidScreenshot(format!(
            "screenshot data too small: {} bytes",
            data.len()
        )));
    }
    if &data[..PNG_MAGIC.len()] != PNG_MAGIC {
        return Err(AdbError::InvalidScreenshot(format!(
            "invalid PNG header: {:?}",
            &data[..PNG_MAGIC.len()]
        )));
    }

    let image = image::load_from_memory_with_format(data, image::ImageFormat::Png)
        .map_err(|e| AdbError::InvalidScreenshot(e.to_string()))?
        .to_rgb8();
    if image.width() == 0 || image.height() == 0 {
        return Err(AdbError::InvalidScreenshot("empty image".to_string()));
    }
    Ok(Screenshot::new(image))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb};
    use std::io::Cursor;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([10, 20, 30]));
        let mut buffer = Cursor::new(Vec::new());
        img.write_to(&mut buffer, ImageFormat::Png).unwrap();
        buffer.into_inner()
    }

    #[test]
    fn test_decode_valid_png() {
        let shot = decode_screencap(&png_bytes(36, 80)).unwrap();
        assert_eq!((shot.width, shot.height), (36, 80));
        assert_eq!(shot.image.get_pixel(0, 0), &Rgb([10, 20, 30]));
    }

    #[test]
    fn test_rejects_non_png() {
        assert!(matches!(
            decode_screencap(b"Status: -1"),
            Err(AdbError::InvalidScreenshot(_))
        ));
        assert!(decode_screencap(b"").is_err());

        let mut truncated = png_bytes(36, 80);
        truncated.truncate(40);
        assert!(decode_screencap(&truncated).is_err());
    }
}
