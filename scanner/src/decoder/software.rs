use image::GrayImage;
use tracing::debug;

use super::{DecodeError, SymbolDetector};

/// In-process QR decoder over the grayscale buffer.
pub struct RqrrDetector;

impl RqrrDetector {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RqrrDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolDetector for RqrrDetector {
    fn detect(&mut self, image: &GrayImage) -> Result<Vec<String>, DecodeError> {
        let (width, height) = image.dimensions();
        let mut prepared =
            rqrr::PreparedImage::prepare_from_greyscale(width as usize, height as usize, |x, y| {
                image.get_pixel(x as u32, y as u32)[0]
            });

        let mut found = Vec::new();
        for grid in prepared.detect_grids() {
            match grid.decode() {
                Ok((_meta, content)) => {
                    debug!(bytes = content.len(), "qr grid decoded");
                    found.push(content);
                }
                // A located grid that does not decode is just an unreadable frame.
                Err(e) => debug!(error = ?e, "qr grid failed to decode"),
            }
        }
        Ok(found)
    }

    fn name(&self) -> &str {
        "rqrr"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use image::{DynamicImage, Luma};
    use qrcode::{Color, QrCode};
    use scan_relay_common::frame::Frame;

    /// Render `payload` as a QR code, `scale` pixels per module with a
    /// four-module quiet zone.
    fn qr_image(payload: &str, scale: u32) -> GrayImage {
        let code = QrCode::new(payload.as_bytes()).unwrap();
        let modules = code.width() as u32;
        let colors = code.to_colors();
        let side = (modules + 8) * scale;
        GrayImage::from_fn(side, side, |x, y| {
            let (mx, my) = (x / scale, y / scale);
            let dark = (4..modules + 4).contains(&mx)
                && (4..modules + 4).contains(&my)
                && colors[((my - 4) * modules + (mx - 4)) as usize] == Color::Dark;
            Luma([if dark { 0 } else { 255 }])
        })
    }

    #[test]
    fn blank_frame_has_no_symbols() {
        let mut detector = RqrrDetector::new();
        let image = GrayImage::from_pixel(320, 240, Luma([255]));
        assert!(detector.detect(&image).unwrap().is_empty());
    }

    #[test]
    fn noise_has_no_symbols() {
        let mut detector = RqrrDetector::new();
        let image = GrayImage::from_fn(64, 64, |x, y| Luma([((x * 31 + y * 17) % 256) as u8]));
        assert!(detector.detect(&image).unwrap().is_empty());
    }

    #[test]
    fn reads_tagged_payload_from_frame() {
        let payload = r#"{"qr_type":"incomingstaging","resi_no":"IN-00080"}"#;
        let frame = Frame::new(DynamicImage::ImageLuma8(qr_image(payload, 10)), Utc::now(), 1);

        let buffer = frame.decode_buffer(1280);
        let mut detector = RqrrDetector::new();
        assert_eq!(detector.detect(&buffer).unwrap(), [payload]);
    }

    #[test]
    fn reads_payload_after_downscale() {
        let payload = "PRODUCT-0042";
        let frame = Frame::new(DynamicImage::ImageLuma8(qr_image(payload, 40)), Utc::now(), 2);
        assert!(frame.width() > 640);

        let buffer = frame.decode_buffer(640);
        assert!(buffer.width() <= 640);
        let mut detector = RqrrDetector::new();
        assert_eq!(detector.detect(&buffer).unwrap(), [payload]);
    }
}
