use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use tracing::{debug, info, warn};

use crate::capture::{acquire, AcquisitionError, CaptureDevice, Facing, FramePoll, FrameSource};
use crate::decoder::DecoderStrategy;
use crate::status::{Level, StatusSink};

/// Lifecycle of the scanner.
///
/// ```text
///  Idle --start()--> Starting --acquired--> Running
///   ^                   |                     |
///   |<----failed--------+                     |
///   |<---------------- Stopping <---stop()----+
///   |<-------------------------------- source lost
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Starting,
    Running,
    Stopping,
}

/// State of one capture session. Created on start, dropped on stop.
#[derive(Debug, Clone)]
pub struct ScanSession {
    pub device: CaptureDevice,
    pub running: bool,
    pub last_detected: Option<String>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub value: String,
    pub timestamp: DateTime<Utc>,
}

/// Builds the decoder for a new session. Probing may run external commands,
/// so the factory hands back a future.
pub type DecoderFactory = Box<dyn FnMut() -> BoxFuture<'static, DecoderStrategy> + Send>;

/// Per-frame engine: pulls frames, decodes, deduplicates.
///
/// Owns the frame source; the driver calls [`ScanLoop::cycle`] on its own
/// cadence, so no two cycles ever overlap.
pub struct ScanLoop<S> {
    source: S,
    state: ScanState,
    session: Option<ScanSession>,
    decoder: Option<DecoderStrategy>,
    make_decoder: DecoderFactory,
    live_cap: u32,
    facing: Option<Facing>,
}

impl<S: FrameSource> ScanLoop<S> {
    pub fn new(
        source: S,
        make_decoder: DecoderFactory,
        live_cap: u32,
        facing: Option<Facing>,
    ) -> Self {
        Self {
            source,
            state: ScanState::Idle,
            session: None,
            decoder: None,
            make_decoder,
            live_cap,
            facing,
        }
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == ScanState::Running && self.session.as_ref().is_some_and(|s| s.running)
    }

    pub fn session(&self) -> Option<&ScanSession> {
        self.session.as_ref()
    }

    /// Acquire a device and begin a session. A no-op unless idle.
    ///
    /// On failure the error is reported once and the loop stays idle.
    pub async fn start(
        &mut self,
        devices: &[CaptureDevice],
        requested: Option<&str>,
        sink: &dyn StatusSink,
    ) -> Result<(), AcquisitionError> {
        if self.state != ScanState::Idle {
            debug!(state = ?self.state, "start ignored, scanner not idle");
            return Ok(());
        }
        self.state = ScanState::Starting;
        sink.report("Starting camera…", Level::Info);

        let device = match acquire(&mut self.source, devices, requested, self.facing).await {
            Ok(device) => device,
            Err(e) => {
                self.state = ScanState::Idle;
                sink.report(&format!("Camera permission or start error: {e}"), Level::Error);
                return Err(e);
            }
        };

        let decoder = (self.make_decoder)().await;
        if decoder.is_available() {
            sink.log_line(&format!("Decoder: {}", decoder.describe()));
        } else {
            sink.report(
                "No barcode decoder available; frames will not be decoded",
                Level::Error,
            );
        }
        info!(
            device = device.id,
            decoder = decoder.describe(),
            native = decoder.is_native(),
            "scan session started"
        );

        sink.log_line(&format!("Camera started: {}", device.display_name()));
        self.session = Some(ScanSession {
            device,
            running: true,
            last_detected: None,
            started_at: Utc::now(),
        });
        self.decoder = Some(decoder);
        self.state = ScanState::Running;
        sink.report("Camera ready, scanning…", Level::Info);
        Ok(())
    }

    /// End the session and release the device. Returns `true` if a session was
    /// actually stopped; calling it again, or before any start, does nothing.
    pub fn stop(&mut self, sink: &dyn StatusSink) -> bool {
        let Some(mut session) = self.session.take() else {
            return false;
        };
        self.state = ScanState::Stopping;
        session.running = false;
        self.decoder = None;
        let released = self.source.close();
        self.state = ScanState::Idle;

        info!(
            device = session.device.id,
            released,
            duration_secs = (Utc::now() - session.started_at).num_seconds(),
            "scan session stopped"
        );
        sink.report("Camera stopped", Level::Info);
        true
    }

    /// Run one scan cycle. Returns a detection only for a value different from
    /// the previous one in this session.
    pub async fn cycle(&mut self, sink: &dyn StatusSink) -> Option<Detection> {
        if self.state != ScanState::Running {
            return None;
        }

        let frame = match self.source.frame() {
            FramePoll::Ready(frame) => frame,
            FramePoll::Pending => return None,
            FramePoll::Lost(reason) => {
                warn!(reason, "capture source lost");
                sink.report(&format!("Camera lost: {reason}"), Level::Error);
                self.source.close();
                self.session = None;
                self.decoder = None;
                self.state = ScanState::Idle;
                return None;
            }
        };

        let buffer = frame.decode_buffer(self.live_cap);
        let value = self.decoder.as_mut()?.decode(buffer, sink).await?;

        let session = self.session.as_mut()?;
        if session.last_detected.as_deref() == Some(value.as_str()) {
            debug!(seq = frame.seq, "duplicate detection suppressed");
            return None;
        }
        session.last_detected = Some(value.clone());

        info!(seq = frame.seq, value, "code detected");
        sink.report(&format!("Detected: {value}"), Level::Info);
        Some(Detection {
            value,
            timestamp: Utc::now(),
        })
    }
}

#[cfg(test)]
impl ScanLoop<crate::capture::testing::ScriptedSource> {
    pub fn source_opened(&self) -> &[String] {
        &self.source.opened
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::testing::{device, ScriptedSource};
    use crate::decoder::testing::ScriptedDetector;
    use crate::status::testing::RecordingSink;
    use futures_util::future::{self, FutureExt};
    use image::{DynamicImage, GrayImage};
    use scan_relay_common::frame::Frame;

    fn ready() -> FramePoll {
        FramePoll::Ready(Frame::new(
            DynamicImage::ImageLuma8(GrayImage::new(16, 16)),
            Utc::now(),
            0,
        ))
    }

    fn scan_loop(frames: usize, values: &'static [&'static str]) -> ScanLoop<ScriptedSource> {
        let source = ScriptedSource::with_frames((0..frames).map(|_| ready()));
        let factory: DecoderFactory = Box::new(move || {
            future::ready(DecoderStrategy::new(
                None,
                Some(Box::new(ScriptedDetector::new("fake").values(values))),
            ))
            .boxed()
        });
        ScanLoop::new(source, factory, 1280, None)
    }

    async fn run(
        scan: &mut ScanLoop<ScriptedSource>,
        cycles: usize,
        sink: &RecordingSink,
    ) -> Vec<String> {
        let mut values = Vec::new();
        for _ in 0..cycles {
            if let Some(detection) = scan.cycle(sink).await {
                values.push(detection.value);
            }
        }
        values
    }

    #[tokio::test]
    async fn duplicates_suppressed() {
        let sink = RecordingSink::default();
        let mut scan = scan_loop(4, &["v1", "v2", "v2", "v3"]);
        scan.start(&[device("cam", None)], None, &sink).await.unwrap();

        assert_eq!(run(&mut scan, 4, &sink).await, ["v1", "v2", "v3"]);
        assert_eq!(
            scan.session().unwrap().last_detected.as_deref(),
            Some("v3")
        );
    }

    #[tokio::test]
    async fn restart_resets_dedup() {
        let sink = RecordingSink::default();
        let mut scan = scan_loop(0, &["same"]);
        let devices = [device("cam", None)];

        scan.start(&devices, None, &sink).await.unwrap();
        scan.source.frames.push_back(ready());
        assert_eq!(run(&mut scan, 1, &sink).await, ["same"]);
        assert!(scan.stop(&sink));

        // The factory builds a fresh decoder, so the same value shows up again.
        scan.start(&devices, None, &sink).await.unwrap();
        scan.source.frames.push_back(ready());
        assert_eq!(run(&mut scan, 1, &sink).await, ["same"]);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let sink = RecordingSink::default();
        let mut scan = scan_loop(0, &[]);
        assert!(!scan.stop(&sink));
        assert_eq!(scan.source.release_count(), 0);

        scan.start(&[device("cam", None)], None, &sink).await.unwrap();
        assert!(scan.stop(&sink));
        assert!(!scan.stop(&sink));
        assert_eq!(scan.source.release_count(), 1);
        assert_eq!(scan.state(), ScanState::Idle);
        assert!(sink.errors().is_empty());
    }

    #[tokio::test]
    async fn start_while_running_is_noop() {
        let sink = RecordingSink::default();
        let mut scan = scan_loop(0, &[]);
        let devices = [device("a", None), device("b", None)];
        scan.start(&devices, Some("a"), &sink).await.unwrap();
        scan.start(&devices, Some("b"), &sink).await.unwrap();
        assert_eq!(scan.source.opened, ["a"]);
        assert_eq!(scan.session().unwrap().device.id, "a");
    }

    #[tokio::test]
    async fn failed_start_reports_once() {
        let sink = RecordingSink::default();
        let mut scan = scan_loop(0, &[]);
        scan.source = ScriptedSource::default().fail("cam", AcquisitionError::PermissionDenied);

        let err = scan
            .start(&[device("cam", None)], None, &sink)
            .await
            .unwrap_err();
        assert_eq!(err, AcquisitionError::PermissionDenied);
        assert_eq!(scan.state(), ScanState::Idle);
        assert_eq!(sink.errors().len(), 1);
        assert!(scan.cycle(&sink).await.is_none());
    }

    #[tokio::test]
    async fn source_loss_goes_idle() {
        let sink = RecordingSink::default();
        let mut scan = scan_loop(0, &["v1"]);
        scan.source.frames.push_back(FramePoll::Lost("stream ended".into()));
        scan.start(&[device("cam", None)], None, &sink).await.unwrap();

        assert!(scan.cycle(&sink).await.is_none());
        assert_eq!(scan.state(), ScanState::Idle);
        assert!(scan.session().is_none());
        assert_eq!(sink.errors(), ["Camera lost: stream ended"]);
        assert_eq!(scan.source.release_count(), 1);

        // Later cycles and stops are quiet.
        assert!(scan.cycle(&sink).await.is_none());
        assert!(!scan.stop(&sink));
        assert_eq!(sink.errors().len(), 1);
    }

    #[tokio::test]
    async fn native_failure_switches_for_rest_of_session() {
        let sink = RecordingSink::default();
        let native = ScriptedDetector::new("native").failure().values(&["n1", "n2"]);
        let native_calls = native.calls.clone();
        let mut native = Some(native);
        let factory: DecoderFactory = Box::new(move || {
            let native: Option<Box<dyn crate::decoder::SymbolDetector>> = native
                .take()
                .map(|d| Box::new(d) as Box<dyn crate::decoder::SymbolDetector>);
            future::ready(DecoderStrategy::new(
                native,
                Some(Box::new(ScriptedDetector::new("fallback").values(&["f1", "f2"]))),
            ))
            .boxed()
        });
        let source = ScriptedSource::with_frames([ready(), ready(), ready()]);
        let mut scan = ScanLoop::new(source, factory, 1280, None);
        scan.start(&[device("cam", None)], None, &sink).await.unwrap();

        assert_eq!(run(&mut scan, 3, &sink).await, ["f1", "f2"]);
        assert_eq!(native_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_decoder_reports_once_and_keeps_running() {
        let sink = RecordingSink::default();
        let source = ScriptedSource::with_frames([ready(), ready()]);
        let factory: DecoderFactory =
            Box::new(|| future::ready(DecoderStrategy::new(None, None)).boxed());
        let mut scan = ScanLoop::new(source, factory, 1280, None);
        scan.start(&[device("cam", None)], None, &sink).await.unwrap();

        assert!(run(&mut scan, 2, &sink).await.is_empty());
        assert!(scan.is_running());
        assert_eq!(sink.errors().len(), 1);
    }
}
