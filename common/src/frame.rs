use chrono::{DateTime, Utc};
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, ImageFormat};

/// One still image sampled from a capture device or loaded from a file.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: DynamicImage,
    pub captured_at: DateTime<Utc>,
    pub seq: u64,
}

impl Frame {
    pub fn new(image: DynamicImage, captured_at: DateTime<Utc>, seq: u64) -> Self {
        Self {
            image,
            captured_at,
            seq,
        }
    }

    /// Decode a JPEG snapshot as delivered by an MJPEG stream or a snapshot URL.
    pub fn from_jpeg(jpeg_data: &[u8], captured_at_ms: i64, seq: u64) -> Result<Self, FrameError> {
        let image = image::load_from_memory_with_format(jpeg_data, ImageFormat::Jpeg)
            .map_err(|e| FrameError::Decode(e.to_string()))?;
        let captured_at =
            DateTime::from_timestamp_millis(captured_at_ms).unwrap_or_else(Utc::now);
        Ok(Self::new(image, captured_at, seq))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Copy the frame into a grayscale decode buffer whose longer side is at most `cap`.
    pub fn decode_buffer(&self, cap: u32) -> GrayImage {
        let (width, height) = fit_within(self.width(), self.height(), cap);
        if (width, height) == (self.width(), self.height()) {
            self.image.to_luma8()
        } else {
            self.image
                .resize_exact(width, height, FilterType::Triangle)
                .to_luma8()
        }
    }
}

/// Scale `width`×`height` down so that the longer side equals `cap`, keeping the
/// aspect ratio. Images already within the cap are returned unchanged.
pub fn fit_within(width: u32, height: u32, cap: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest <= cap || cap == 0 {
        return (width, height);
    }
    let scale = cap as f64 / longest as f64;
    let scaled = |side: u32| -> u32 {
        if side == longest {
            cap
        } else {
            ((side as f64 * scale).round() as u32).max(1)
        }
    };
    (scaled(width), scaled(height))
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("failed to decode image: {0}")]
    Decode(String),
}
