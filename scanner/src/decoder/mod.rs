pub mod native;
pub mod software;

use image::GrayImage;
use scan_relay_common::config::DecoderConfig;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::status::{Level, StatusSink};

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("detector unavailable: {0}")]
    Unavailable(String),
    #[error("detection failed: {0}")]
    Failed(String),
}

/// Pluggable symbol detector.
///
/// Implementations receive a grayscale decode buffer and return every symbol
/// they could read, best candidate first. `detect` may block; the strategy
/// runs it on the blocking pool.
pub trait SymbolDetector: Send {
    fn detect(&mut self, image: &GrayImage) -> Result<Vec<String>, DecodeError>;

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

enum ActiveDecoder {
    Native(Box<dyn SymbolDetector>),
    Fallback(Box<dyn SymbolDetector>),
    Unavailable,
}

/// Decoder chosen for one scan session.
///
/// Starts on the native detector when there is one. The first native failure
/// drops it for good and hands every later frame to the fallback.
pub struct DecoderStrategy {
    active: ActiveDecoder,
    fallback: Option<Box<dyn SymbolDetector>>,
}

impl DecoderStrategy {
    pub fn new(
        native: Option<Box<dyn SymbolDetector>>,
        fallback: Option<Box<dyn SymbolDetector>>,
    ) -> Self {
        match native {
            Some(native) => Self {
                active: ActiveDecoder::Native(native),
                fallback,
            },
            None => Self {
                active: fallback
                    .map(ActiveDecoder::Fallback)
                    .unwrap_or(ActiveDecoder::Unavailable),
                fallback: None,
            },
        }
    }

    /// Probe the configured detectors. A native detector that cannot be
    /// constructed is skipped in favour of the fallback.
    pub async fn from_config(config: &DecoderConfig) -> Self {
        let native: Option<Box<dyn SymbolDetector>> = if config.native {
            match native::ZbarDetector::probe(&config.native_command, &config.formats).await {
                Ok(detector) => Some(Box::new(detector)),
                Err(e) => {
                    warn!(command = config.native_command, error = %e, "native detector unavailable");
                    None
                }
            }
        } else {
            None
        };
        let fallback: Option<Box<dyn SymbolDetector>> = if config.fallback {
            Some(Box::new(software::RqrrDetector::new()))
        } else {
            None
        };
        Self::new(native, fallback)
    }

    pub fn is_available(&self) -> bool {
        !matches!(self.active, ActiveDecoder::Unavailable)
    }

    pub fn is_native(&self) -> bool {
        matches!(self.active, ActiveDecoder::Native(_))
    }

    pub fn describe(&self) -> String {
        match &self.active {
            ActiveDecoder::Native(d) => format!("native ({})", d.name()),
            ActiveDecoder::Fallback(d) => format!("software ({})", d.name()),
            ActiveDecoder::Unavailable => "none".to_string(),
        }
    }

    /// Decode one buffer, returning only the first candidate.
    pub async fn decode(&mut self, image: GrayImage, sink: &dyn StatusSink) -> Option<String> {
        let image = Arc::new(image);
        let mut active = std::mem::replace(&mut self.active, ActiveDecoder::Unavailable);

        if let ActiveDecoder::Native(detector) = active {
            let name = detector.name().to_string();
            let (detector, result) = detect_blocking(detector, Arc::clone(&image)).await;
            match (detector, result) {
                (Some(detector), Ok(candidates)) => {
                    self.active = ActiveDecoder::Native(detector);
                    return candidates.into_iter().next();
                }
                (_, Err(e)) => warn!(detector = name, error = %e, "native detector failed"),
                (None, Ok(_)) => warn!(detector = name, "native detector lost"),
            }
            self.degrade(sink);
            active = std::mem::replace(&mut self.active, ActiveDecoder::Unavailable);
        }

        let detector = match active {
            ActiveDecoder::Fallback(detector) => detector,
            other => {
                self.active = other;
                return None;
            }
        };
        let name = detector.name().to_string();
        let (detector, result) = detect_blocking(detector, image).await;
        match detector {
            Some(detector) => self.active = ActiveDecoder::Fallback(detector),
            None => sink.report("Software decoder stopped; frames will not be decoded", Level::Error),
        }
        match result {
            Ok(candidates) => candidates.into_iter().next(),
            Err(e) => {
                debug!(detector = name, error = %e, "fallback decode failed");
                None
            }
        }
    }

    fn degrade(&mut self, sink: &dyn StatusSink) {
        self.active = match self.fallback.take() {
            Some(fallback) => {
                info!(detector = fallback.name(), "switching to software decoder");
                sink.log_line(&format!(
                    "Native detector failed, using {} from now on",
                    fallback.name()
                ));
                ActiveDecoder::Fallback(fallback)
            }
            None => {
                sink.report(
                    "Native detector failed and no fallback decoder is enabled",
                    Level::Error,
                );
                ActiveDecoder::Unavailable
            }
        };
    }
}

/// Run one detector pass on the blocking pool. The detector comes back
/// unless the pass panicked.
async fn detect_blocking(
    mut detector: Box<dyn SymbolDetector>,
    image: Arc<GrayImage>,
) -> (Option<Box<dyn SymbolDetector>>, Result<Vec<String>, DecodeError>) {
    let pass = tokio::task::spawn_blocking(move || {
        let result = detector.detect(&image);
        (detector, result)
    })
    .await;
    match pass {
        Ok((detector, result)) => (Some(detector), result),
        Err(e) => (None, Err(DecodeError::Failed(format!("detector task failed: {e}")))),
    }
}
