use scan_relay_common::config::CaptureConfig;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::capture::still::{load_still, StillImageError};
use crate::capture::FrameSource;
use crate::decoder::DecoderStrategy;
use crate::devices::DeviceManager;
use crate::scan_loop::{Detection, ScanLoop};
use crate::status::{Level, StatusSink};
use crate::submission::{
    CompletedMove, CreatedMove, RecordError, SubmissionClient, SubmissionOutcome,
    SubmissionPayload,
};

/// Operator command read from stdin in live mode.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Start,
    Stop,
    Devices,
    Select(String),
    Create {
        quantity: f64,
        lot: Option<String>,
    },
    Complete {
        quantity: f64,
        lot: Option<String>,
        move_id: Option<i64>,
    },
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("unknown command: {0}")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("not a number: {0}")]
    Number(String),
}

pub fn parse_command(line: &str) -> Result<Option<Command>, CommandError> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let args: Vec<&str> = words.collect();

    let command = match (verb.to_ascii_lowercase().as_str(), args.as_slice()) {
        ("start", []) => Command::Start,
        ("stop", []) => Command::Stop,
        ("devices", []) => Command::Devices,
        ("select", [id]) => Command::Select(id.to_string()),
        ("select", _) => return Err(CommandError::Usage("select <device-id>")),
        ("create", [qty, rest @ ..]) if rest.len() <= 1 => Command::Create {
            quantity: parse_quantity(qty)?,
            lot: rest.first().map(|s| s.to_string()),
        },
        ("create", _) => return Err(CommandError::Usage("create <qty> [lot]")),
        ("complete", [qty, rest @ ..]) if rest.len() <= 2 => Command::Complete {
            quantity: parse_quantity(qty)?,
            lot: rest.first().filter(|s| **s != "-").map(|s| s.to_string()),
            move_id: rest
                .get(1)
                .map(|s| s.parse().map_err(|_| CommandError::Number(s.to_string())))
                .transpose()?,
        },
        ("complete", _) => return Err(CommandError::Usage("complete <qty> [lot|-] [move_id]")),
        ("quit" | "exit", []) => Command::Quit,
        (other, _) => return Err(CommandError::Unknown(other.to_string())),
    };
    Ok(Some(command))
}

fn parse_quantity(s: &str) -> Result<f64, CommandError> {
    match s.parse::<f64>() {
        Ok(q) if q.is_finite() && q >= 0.0 => Ok(q),
        _ => Err(CommandError::Number(s.to_string())),
    }
}

/// Result of the one remote call allowed in flight.
enum ActionResult {
    Submitted(SubmissionOutcome),
    Created(Result<CreatedMove, RecordError>),
    Completed {
        move_id: i64,
        result: Result<CompletedMove, RecordError>,
    },
}

/// Live-mode scheduler: interleaves scan cycles, operator commands and the
/// single outstanding remote call on one task.
pub struct Driver<S> {
    scan: ScanLoop<S>,
    devices: DeviceManager,
    client: SubmissionClient,
    sink: Arc<dyn StatusSink>,
    cadence: Duration,
    scanned: Option<String>,
    last_created: Option<CreatedMove>,
    pending: Option<JoinHandle<ActionResult>>,
}

impl<S: FrameSource> Driver<S> {
    pub fn new(
        scan: ScanLoop<S>,
        devices: DeviceManager,
        client: SubmissionClient,
        sink: Arc<dyn StatusSink>,
        fps: f64,
    ) -> Self {
        Self {
            scan,
            devices,
            client,
            sink,
            cadence: Duration::from_secs_f64(1.0 / fps),
            scanned: None,
            last_created: None,
            pending: None,
        }
    }

    /// Run until `quit` or Ctrl-C. The capture device is released on the way out.
    pub async fn run_live(&mut self, mut commands: mpsc::Receiver<Command>) {
        let mut ticker = tokio::time::interval(self.cadence);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut commands_open = true;

        loop {
            tokio::select! {
                _ = ticker.tick(), if self.scan.is_running() => {
                    if let Some(detection) = self.scan.cycle(self.sink.as_ref()).await {
                        self.on_detection(detection);
                    }
                }
                cmd = commands.recv(), if commands_open => match cmd {
                    Some(Command::Quit) => break,
                    Some(cmd) => self.handle(cmd).await,
                    None => {
                        debug!("command input closed");
                        commands_open = false;
                    }
                },
                result = wait_pending(&mut self.pending), if self.pending.is_some() => {
                    self.pending = None;
                    match result {
                        Ok(result) => self.on_result(result),
                        Err(e) => {
                            error!(error = %e, "remote call task failed");
                            self.sink.report("Processing failed (internal error)", Level::Error);
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("received ctrl-c, shutting down");
                    break;
                }
            }
        }

        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(pending) = self.pending.take() {
            warn!("abandoning in-flight remote call");
            pending.abort();
        }
        self.scan.stop(self.sink.as_ref());
    }

    async fn handle(&mut self, cmd: Command) {
        debug!(?cmd, "operator command");
        match cmd {
            Command::Start => {
                let devices = self.devices.list_devices().await;
                let requested = self.devices.preferred().map(str::to_string);
                if let Err(e) = self
                    .scan
                    .start(&devices, requested.as_deref(), self.sink.as_ref())
                    .await
                {
                    debug!(error = %e, "start failed");
                }
            }
            Command::Stop => {
                if !self.scan.stop(self.sink.as_ref()) {
                    debug!("stop ignored, scanner idle");
                }
            }
            Command::Devices => self.list_devices().await,
            Command::Select(id) => {
                let devices = self.devices.list_devices().await;
                if !DeviceManager::selection_visible(&devices) {
                    self.sink
                        .report("Camera selection needs two or more cameras", Level::Error);
                    return;
                }
                if let Err(e) = self
                    .devices
                    .select(&id, &mut self.scan, self.sink.as_ref())
                    .await
                {
                    debug!(device = id, error = %e, "select failed");
                }
            }
            Command::Create { quantity, lot } => {
                let Some(barcode) = self.scanned.clone() else {
                    self.sink.report("Scan a product barcode first", Level::Error);
                    return;
                };
                let client = self.client.clone();
                self.spawn_call("Creating move…", async move {
                    ActionResult::Created(client.create_move(&barcode, quantity, lot.as_deref()).await)
                });
            }
            Command::Complete {
                quantity,
                lot,
                move_id,
            } => {
                let Some(move_id) = move_id.or(self.last_created.as_ref().map(|c| c.move_id)) else {
                    self.sink
                        .report("No move to complete; create one first", Level::Error);
                    return;
                };
                let client = self.client.clone();
                self.spawn_call("Completing move…", async move {
                    let result = client.complete_move(move_id, quantity, lot.as_deref()).await;
                    ActionResult::Completed { move_id, result }
                });
            }
            Command::Quit => {}
        }
    }

    async fn list_devices(&self) {
        let devices = self.devices.list_devices().await;
        if devices.is_empty() {
            self.sink.log_line("No cameras found");
            return;
        }
        let current = self.scan.session().map(|s| s.device.id.as_str());
        for d in &devices {
            let marker = if Some(d.id.as_str()) == current {
                "*"
            } else if Some(d.id.as_str()) == self.devices.preferred() {
                "+"
            } else {
                " "
            };
            self.sink
                .log_line(&format!("{marker} {} ({})", d.id, d.display_name()));
        }
        if !DeviceManager::selection_visible(&devices) {
            debug!("single camera, selection hidden");
        }
    }

    fn on_detection(&mut self, detection: Detection) {
        self.sink.log_line(&format!(
            "Scanned {} at {}",
            detection.value,
            detection.timestamp.format("%H:%M:%S")
        ));
        self.scanned = Some(detection.value.clone());

        let Some(payload) = SubmissionPayload::from_decoded(&detection.value, self.client.qr_type())
        else {
            debug!("detection is display-only");
            return;
        };
        let client = self.client.clone();
        self.spawn_call("Processing QR…", async move {
            ActionResult::Submitted(client.submit(&payload).await)
        });
    }

    fn spawn_call<F>(&mut self, status: &str, call: F)
    where
        F: std::future::Future<Output = ActionResult> + Send + 'static,
    {
        if self.pending.is_some() {
            self.sink
                .report("Another request is still in progress", Level::Error);
            return;
        }
        self.sink.report(status, Level::Info);
        self.pending = Some(tokio::spawn(call));
    }

    fn on_result(&mut self, result: ActionResult) {
        match result {
            ActionResult::Submitted(outcome) => present_outcome(&outcome, self.sink.as_ref()),
            ActionResult::Created(Ok(created)) => {
                self.sink.report(
                    &format!(
                        "Created move {} in picking {}",
                        created.move_id, created.picking_id
                    ),
                    Level::Info,
                );
                self.sink
                    .set_last_action(&format!("Created move {}", created.move_id));
                self.scanned = None;
                self.last_created = Some(created);
            }
            ActionResult::Created(Err(e)) => present_record_error("Create", &e, self.sink.as_ref()),
            ActionResult::Completed {
                move_id,
                result: Ok(done),
            } => {
                debug!(move_id, move_line_id = ?done.move_line_id, "move line recorded");
                self.sink.report(
                    &format!(
                        "Move {move_id} completed, picking is {}",
                        done.picking_state.as_deref().unwrap_or("unknown")
                    ),
                    Level::Info,
                );
                self.sink.set_last_action(&format!("Completed move {move_id}"));
            }
            ActionResult::Completed {
                result: Err(e), ..
            } => present_record_error("Complete", &e, self.sink.as_ref()),
        }
    }
}

async fn wait_pending(
    pending: &mut Option<JoinHandle<ActionResult>>,
) -> Result<ActionResult, JoinError> {
    match pending {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

fn present_outcome(outcome: &SubmissionOutcome, sink: &dyn StatusSink) {
    match outcome {
        SubmissionOutcome::Updated => {
            sink.report("Processing complete: record updated", Level::Info);
            sink.set_last_action("Updated");
        }
        SubmissionOutcome::Success(details) => {
            sink.report("Processing complete", Level::Info);
            sink.log_line(&details.to_string());
            sink.set_last_action("Processed");
        }
        SubmissionOutcome::Failure(message) | SubmissionOutcome::TransportError(message) => {
            sink.report(message, Level::Error);
        }
    }
}

fn present_record_error(action: &str, e: &RecordError, sink: &dyn StatusSink) {
    match e {
        RecordError::Rejected(code) => sink.report(&format!("{action} failed: {code}"), Level::Error),
        RecordError::Transport(message) => sink.report(message, Level::Error),
    }
}

/// What a one-shot file scan found.
#[derive(Debug, PartialEq)]
pub struct FileScan {
    pub value: Option<String>,
    pub outcome: Option<SubmissionOutcome>,
}

/// Decode a single image file and submit it if it carries a tagged payload.
pub async fn scan_file(
    path: &Path,
    capture: &CaptureConfig,
    mut decoder: DecoderStrategy,
    client: &SubmissionClient,
    sink: &dyn StatusSink,
) -> Result<FileScan, StillImageError> {
    let frame = match load_still(path, capture.max_file_bytes, capture.file_max_dimension) {
        Ok(frame) => frame,
        Err(e) => {
            sink.report(&e.to_string(), Level::Error);
            return Err(e);
        }
    };

    let buffer = frame.decode_buffer(capture.file_max_dimension);
    let Some(value) = decoder.decode(buffer, sink).await else {
        sink.report("No QR code detected in the image.", Level::Error);
        return Ok(FileScan {
            value: None,
            outcome: None,
        });
    };
    sink.report("QR code decoded", Level::Info);
    sink.log_line(&value);

    let outcome = match SubmissionPayload::from_decoded(&value, client.qr_type()) {
        Some(payload) => {
            sink.report("Processing QR…", Level::Info);
            let outcome = client.submit(&payload).await;
            present_outcome(&outcome, sink);
            Some(outcome)
        }
        None => None,
    };
    Ok(FileScan {
        value: Some(value),
        outcome,
    })
}
