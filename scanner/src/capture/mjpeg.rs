use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures_util::StreamExt;
use reqwest::header::CONTENT_TYPE;
use scan_relay_common::frame::Frame;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{AcquisitionError, CaptureDevice, FramePoll, FrameSource};

static SEQ_COUNTER: AtomicU64 = AtomicU64::new(0);

const BOUNDARY: &[u8] = b"--frame\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";

/// Consecutive failed snapshot fetches before a polled camera counts as lost.
const MAX_POLL_FAILURES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// One long-lived `multipart/x-mixed-replace` response.
    Mjpeg,
    /// Periodic GETs of a single-JPEG snapshot URL.
    Polling,
}

impl StreamMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mjpeg" => Some(Self::Mjpeg),
            "polling" => Some(Self::Polling),
            _ => None,
        }
    }
}

/// Latest-image slot shared between the reader task and the scan loop.
#[derive(Debug, Clone)]
enum Slot {
    Empty,
    Jpeg {
        data: Bytes,
        captured_at_ms: i64,
        seq: u64,
    },
    Lost(String),
}

/// Parse state for the MJPEG multipart stream.
enum ParseState {
    /// Looking for the boundary marker `--frame\r\n`.
    SeekingBoundary,
    /// Found boundary, now looking for end of headers `\r\n\r\n`.
    SeekingHeaderEnd,
    /// Collecting JPEG bytes until the next boundary.
    CollectingJpeg,
}

/// Incremental splitter for a multipart MJPEG body.
pub struct MultipartParser {
    buffer: BytesMut,
    state: ParseState,
    jpeg_start: usize,
}

impl MultipartParser {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(256 * 1024),
            state: ParseState::SeekingBoundary,
            jpeg_start: 0,
        }
    }

    /// Feed one network chunk; returns every JPEG completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);
        let mut completed = Vec::new();

        loop {
            match self.state {
                ParseState::SeekingBoundary => {
                    if let Some(pos) = find_subsequence(&self.buffer, BOUNDARY) {
                        let _ = self.buffer.split_to(pos + BOUNDARY.len());
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        // Keep last few bytes in case boundary spans chunks
                        if self.buffer.len() > BOUNDARY.len() {
                            let _ = self.buffer.split_to(self.buffer.len() - BOUNDARY.len());
                        }
                        break;
                    }
                }
                ParseState::SeekingHeaderEnd => {
                    if let Some(pos) = find_subsequence(&self.buffer, HEADER_END) {
                        let _ = self.buffer.split_to(pos + HEADER_END.len());
                        self.jpeg_start = 0;
                        self.state = ParseState::CollectingJpeg;
                    } else {
                        break;
                    }
                }
                ParseState::CollectingJpeg => {
                    let Some(pos) = find_subsequence(&self.buffer[self.jpeg_start..], BOUNDARY)
                    else {
                        // Skip already-scanned bytes on the next chunk
                        self.jpeg_start = self.buffer.len().saturating_sub(BOUNDARY.len());
                        break;
                    };
                    let jpeg_end = self.jpeg_start + pos;
                    // Strip trailing \r\n before boundary
                    let end = if jpeg_end >= 2
                        && self.buffer[jpeg_end - 2] == b'\r'
                        && self.buffer[jpeg_end - 1] == b'\n'
                    {
                        jpeg_end - 2
                    } else {
                        jpeg_end
                    };

                    let mut part = self.buffer.split_to(jpeg_end + BOUNDARY.len());
                    part.truncate(end);
                    if !part.is_empty() {
                        completed.push(part.freeze());
                    }
                    // Already past boundary, go to header parsing
                    self.state = ParseState::SeekingHeaderEnd;
                }
            }
        }

        completed
    }
}

impl Default for MultipartParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Network camera source speaking MJPEG over HTTP, either as a continuous
/// multipart stream or by polling a snapshot URL.
pub struct MjpegSource {
    client: reqwest::Client,
    mode: StreamMode,
    quality: u32,
    fps: f64,
    latest: Option<watch::Receiver<Slot>>,
    task: Option<JoinHandle<()>>,
}

impl MjpegSource {
    pub fn new(
        mode: StreamMode,
        quality: u32,
        fps: f64,
        connect_timeout: Duration,
    ) -> Result<Self, AcquisitionError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| AcquisitionError::Unknown(e.to_string()))?;
        Ok(Self {
            client,
            mode,
            quality,
            fps,
            latest: None,
            task: None,
        })
    }

    fn request_url(&self, device_url: &str) -> String {
        match self.mode {
            StreamMode::Mjpeg => with_query(
                device_url,
                &format!("quality={}&fps={}", self.quality, self.fps),
            ),
            StreamMode::Polling => with_query(
                &device_url.replace("/stream", "/frame"),
                &format!("quality={}", self.quality),
            ),
        }
    }
}

impl FrameSource for MjpegSource {
    async fn open(&mut self, device: &CaptureDevice) -> Result<(), AcquisitionError> {
        self.close();

        let url = self.request_url(&device.url);
        info!(url, device = device.id, mode = ?self.mode, "connecting to camera");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(classify_request_error)?;
        check_response(&response, self.mode)?;

        info!(status = %response.status(), device = device.id, "connected to camera");

        let (tx, rx) = watch::channel(Slot::Empty);
        let task = match self.mode {
            StreamMode::Mjpeg => tokio::spawn(consume_stream(response, tx)),
            StreamMode::Polling => {
                let interval = Duration::from_secs_f64(1.0 / self.fps);
                tokio::spawn(poll_snapshots(
                    self.client.clone(),
                    url,
                    interval,
                    response,
                    tx,
                ))
            }
        };
        self.latest = Some(rx);
        self.task = Some(task);
        Ok(())
    }

    fn frame(&mut self) -> FramePoll {
        let Some(rx) = self.latest.as_mut() else {
            return FramePoll::Pending;
        };

        match rx.has_changed() {
            Ok(false) => return FramePoll::Pending,
            Ok(true) => {}
            Err(_) => {
                // Reader task is gone; report why if it said so.
                return match &*rx.borrow() {
                    Slot::Lost(reason) => FramePoll::Lost(reason.clone()),
                    _ => FramePoll::Lost("capture task stopped".into()),
                };
            }
        }

        let slot = rx.borrow_and_update().clone();
        match slot {
            Slot::Empty => FramePoll::Pending,
            Slot::Jpeg {
                data,
                captured_at_ms,
                seq,
            } => match Frame::from_jpeg(&data, captured_at_ms, seq) {
                Ok(frame) => FramePoll::Ready(frame),
                Err(e) => {
                    warn!(error = %e, seq, "undecodable camera frame, skipping");
                    FramePoll::Pending
                }
            },
            Slot::Lost(reason) => FramePoll::Lost(reason),
        }
    }

    fn close(&mut self) -> bool {
        let had_stream = self.task.is_some() || self.latest.is_some();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.latest = None;
        if had_stream {
            debug!("camera stream released");
        }
        had_stream
    }
}

impl Drop for MjpegSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// Read the multipart body and publish each JPEG into the slot.
async fn consume_stream(response: reqwest::Response, tx: watch::Sender<Slot>) {
    let mut byte_stream = response.bytes_stream();
    let mut parser = MultipartParser::new();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "camera stream error");
                let _ = tx.send(Slot::Lost(format!("camera stream error: {e}")));
                return;
            }
        };
        for jpeg in parser.push(&chunk) {
            if !publish(&tx, jpeg) {
                return;
            }
        }
    }

    info!("camera stream ended");
    let _ = tx.send(Slot::Lost("camera stream ended".into()));
}

/// Polling-based fallback: periodically fetch single frames.
async fn poll_snapshots(
    client: reqwest::Client,
    frame_url: String,
    interval: Duration,
    first: reqwest::Response,
    tx: watch::Sender<Slot>,
) {
    match first.bytes().await {
        Ok(jpeg) => {
            if !publish(&tx, jpeg) {
                return;
            }
        }
        Err(e) => warn!(error = %e, "failed to read first camera snapshot"),
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    let mut failures: u32 = 0;

    loop {
        ticker.tick().await;

        let result = match client.get(&frame_url).send().await {
            Ok(resp) if resp.status().is_success() => resp.bytes().await.map_err(|e| e.to_string()),
            Ok(resp) => Err(format!("HTTP status {}", resp.status())),
            Err(e) => Err(e.to_string()),
        };

        match result {
            Ok(jpeg) => {
                failures = 0;
                if !publish(&tx, jpeg) {
                    return;
                }
            }
            Err(e) => {
                failures += 1;
                warn!(error = e, failures, "failed to fetch camera snapshot");
                if failures >= MAX_POLL_FAILURES {
                    let _ = tx.send(Slot::Lost(format!("camera unreachable: {e}")));
                    return;
                }
            }
        }
    }
}

/// Returns `false` once nobody is listening any more.
fn publish(tx: &watch::Sender<Slot>, jpeg: Bytes) -> bool {
    if jpeg.is_empty() {
        return true;
    }
    let seq = SEQ_COUNTER.fetch_add(1, Ordering::Relaxed);
    debug!(seq, bytes = jpeg.len(), "camera frame received");
    tx.send(Slot::Jpeg {
        data: jpeg,
        captured_at_ms: Utc::now().timestamp_millis(),
        seq,
    })
    .is_ok()
}

fn check_response(response: &reqwest::Response, mode: StreamMode) -> Result<(), AcquisitionError> {
    let status = response.status();
    if !status.is_success() {
        return Err(classify_status(status.as_u16()));
    }
    let expected = match mode {
        StreamMode::Mjpeg => "multipart/",
        StreamMode::Polling => "image/",
    };
    if let Some(content_type) = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
    {
        if !content_type.to_ascii_lowercase().starts_with(expected) {
            warn!(content_type, expected, "camera returned unexpected content type");
            return Err(AcquisitionError::ConstraintsUnsupported);
        }
    }
    Ok(())
}

/// Map an HTTP status from a camera endpoint onto the acquisition taxonomy.
pub fn classify_status(status: u16) -> AcquisitionError {
    match status {
        401 | 403 => AcquisitionError::PermissionDenied,
        404 | 410 => AcquisitionError::DeviceNotFound,
        409 | 423 | 429 | 503 => AcquisitionError::DeviceBusy,
        400 | 406 | 415 | 416 | 422 => AcquisitionError::ConstraintsUnsupported,
        other => AcquisitionError::Unknown(format!("HTTP status {other}")),
    }
}

fn classify_request_error(e: reqwest::Error) -> AcquisitionError {
    if e.is_timeout() {
        AcquisitionError::DeviceBusy
    } else if e.is_connect() {
        AcquisitionError::DeviceNotFound
    } else if let Some(status) = e.status() {
        classify_status(status.as_u16())
    } else {
        AcquisitionError::Unknown(e.to_string())
    }
}

fn with_query(url: &str, query: &str) -> String {
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{url}{sep}{query}")
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
