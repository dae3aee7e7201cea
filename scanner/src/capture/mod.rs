pub mod mjpeg;
pub mod still;

use reqwest::Url;
use scan_relay_common::config::DeviceConfig;
use scan_relay_common::frame::Frame;
use serde::Deserialize;
use std::net::IpAddr;
use tracing::{debug, info, warn};

/// Which way a camera points. Used as an acquisition hint when no exact
/// device is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facing {
    Environment,
    User,
}

impl Facing {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "environment" | "back" | "rear" => Some(Self::Environment),
            "user" | "front" => Some(Self::User),
            _ => None,
        }
    }
}

/// A video input the operator can choose.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CaptureDevice {
    pub id: String,
    #[serde(default)]
    pub label: String,
    pub url: String,
    #[serde(default)]
    pub facing: Option<Facing>,
}

impl CaptureDevice {
    /// Label for display; unlabeled devices show their id.
    pub fn display_name(&self) -> &str {
        if self.label.is_empty() {
            &self.id
        } else {
            &self.label
        }
    }
}

impl From<&DeviceConfig> for CaptureDevice {
    fn from(cfg: &DeviceConfig) -> Self {
        let facing = cfg.facing.as_deref().and_then(Facing::parse);
        if cfg.facing.is_some() && facing.is_none() {
            warn!(device = cfg.id, facing = ?cfg.facing, "unknown facing hint ignored");
        }
        Self {
            id: cfg.id.clone(),
            label: cfg.label.clone(),
            url: cfg.url.clone(),
            facing,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AcquisitionError {
    #[error("permission to use the camera was denied")]
    PermissionDenied,
    #[error("camera not found")]
    DeviceNotFound,
    #[error("camera is busy or in use by another client")]
    DeviceBusy,
    #[error("camera does not support the requested constraints")]
    ConstraintsUnsupported,
    #[error("camera access requires https or a loopback address: {0}")]
    InsecureContext(String),
    #[error("camera error: {0}")]
    Unknown(String),
}

/// Result of asking a source for its latest image.
#[derive(Debug)]
pub enum FramePoll {
    Ready(Frame),
    /// Nothing new since the last read.
    Pending,
    /// The device went away; the session cannot continue.
    Lost(String),
}

/// A live capture device that yields frames without blocking.
pub trait FrameSource {
    /// Acquire the device. Must be called on a closed source.
    async fn open(&mut self, device: &CaptureDevice) -> Result<(), AcquisitionError>;

    /// Latest frame produced since the previous call, if any.
    fn frame(&mut self) -> FramePoll;

    /// Release the device. Returns `true` if something was actually released,
    /// so repeated calls are harmless.
    fn close(&mut self) -> bool;
}

/// One entry in the ranked acquisition plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constraint {
    Exact(String),
    Facing(Facing),
    Any,
}

/// Build the ranked list of constraints: exact device, then facing hint, then anything.
pub fn acquisition_plan(requested: Option<&str>, facing: Option<Facing>) -> Vec<Constraint> {
    let mut plan = Vec::with_capacity(3);
    if let Some(id) = requested {
        plan.push(Constraint::Exact(id.to_string()));
    }
    if let Some(facing) = facing {
        plan.push(Constraint::Facing(facing));
    }
    plan.push(Constraint::Any);
    plan
}

fn resolve<'a>(
    devices: &'a [CaptureDevice],
    constraint: &Constraint,
) -> Result<&'a CaptureDevice, AcquisitionError> {
    match constraint {
        Constraint::Exact(id) => devices
            .iter()
            .find(|d| &d.id == id)
            .ok_or(AcquisitionError::DeviceNotFound),
        Constraint::Facing(facing) => devices
            .iter()
            .find(|d| d.facing == Some(*facing))
            .ok_or(AcquisitionError::ConstraintsUnsupported),
        Constraint::Any => devices.first().ok_or(AcquisitionError::DeviceNotFound),
    }
}

/// Capture is only allowed from https origins or the local loopback.
pub fn check_secure_origin(url: &str) -> Result<(), AcquisitionError> {
    let parsed =
        Url::parse(url).map_err(|e| AcquisitionError::Unknown(format!("bad device url {url}: {e}")))?;
    if parsed.scheme() == "https" {
        return Ok(());
    }
    let loopback = match parsed.host_str() {
        Some(host) if host.eq_ignore_ascii_case("localhost") => true,
        Some(host) => host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .is_ok_and(|ip| ip.is_loopback()),
        None => false,
    };
    if loopback {
        Ok(())
    } else {
        Err(AcquisitionError::InsecureContext(url.to_string()))
    }
}

/// Walk the acquisition plan and open the first device that succeeds.
///
/// A device already tried under an earlier constraint is skipped. When every
/// attempt fails, the last error is returned. An insecure device URL aborts the
/// whole plan before anything is opened.
pub async fn acquire<S: FrameSource>(
    source: &mut S,
    devices: &[CaptureDevice],
    requested: Option<&str>,
    facing: Option<Facing>,
) -> Result<CaptureDevice, AcquisitionError> {
    let plan = acquisition_plan(requested, facing);
    let mut tried: Vec<&str> = Vec::new();
    let mut last_err = AcquisitionError::DeviceNotFound;

    for constraint in &plan {
        let device = match resolve(devices, constraint) {
            Ok(d) => d,
            Err(e) => {
                debug!(?constraint, error = %e, "constraint matched no device");
                last_err = e;
                continue;
            }
        };
        if tried.contains(&device.id.as_str()) {
            continue;
        }
        check_secure_origin(&device.url)?;
        tried.push(&device.id);

        match source.open(device).await {
            Ok(()) => {
                info!(device = device.id, ?constraint, "camera acquired");
                return Ok(device.clone());
            }
            Err(e) => {
                warn!(device = device.id, ?constraint, error = %e, "camera acquisition failed");
                last_err = e;
            }
        }
    }

    Err(last_err)
}
