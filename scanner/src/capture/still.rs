use chrono::Utc;
use image::imageops::FilterType;
use scan_relay_common::frame::{fit_within, Frame};
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum StillImageError {
    #[error("failed to read {0}: {1}")]
    Read(String, String),
    #[error("image is {size} bytes, larger than the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },
    #[error("failed to decode image: {0}")]
    Decode(String),
}

/// Load an image file as a single frame, scaled down so its longer side is at
/// most `cap`. Files over `max_bytes` are rejected before being read.
pub fn load_still(path: &Path, max_bytes: u64, cap: u32) -> Result<Frame, StillImageError> {
    let shown = path.display().to_string();
    let size = std::fs::metadata(path)
        .map_err(|e| StillImageError::Read(shown.clone(), e.to_string()))?
        .len();
    if size > max_bytes {
        return Err(StillImageError::TooLarge {
            size,
            limit: max_bytes,
        });
    }

    let data = std::fs::read(path).map_err(|e| StillImageError::Read(shown.clone(), e.to_string()))?;
    let image = image::load_from_memory(&data).map_err(|e| StillImageError::Decode(e.to_string()))?;

    let (width, height) = fit_within(image.width(), image.height(), cap);
    let image = if (width, height) == (image.width(), image.height()) {
        image
    } else {
        debug!(
            from_w = image.width(),
            from_h = image.height(),
            width,
            height,
            "scaling still image"
        );
        image.resize_exact(width, height, FilterType::Triangle)
    };

    info!(path = shown, size, width, height, "still image loaded");
    Ok(Frame::new(image, Utc::now(), 0))
}
