use scan_relay_common::config::{CaptureConfig, DeviceConfig};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::capture::{AcquisitionError, CaptureDevice, FrameSource};
use crate::scan_loop::ScanLoop;
use crate::status::{Level, StatusSink};

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("discovery request failed: {0}")]
    Request(String),
    #[error("discovery returned HTTP {0}")]
    Status(u16),
    #[error("discovery returned an invalid device list: {0}")]
    Parse(String),
}

/// Where the list of capture devices comes from: the config file, optionally
/// refreshed from a discovery URL on every listing.
pub struct DeviceCatalog {
    configured: Vec<CaptureDevice>,
    discovery_url: Option<String>,
    client: reqwest::Client,
}

impl DeviceCatalog {
    pub fn new(devices: &[DeviceConfig], capture: &CaptureConfig) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(capture.connect_timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            configured: devices.iter().map(CaptureDevice::from).collect(),
            discovery_url: capture.discovery_url.clone(),
            client,
        }
    }

    pub async fn list(&self) -> Vec<CaptureDevice> {
        let Some(url) = &self.discovery_url else {
            return self.configured.clone();
        };
        match self.discover(url).await {
            Ok(devices) => {
                debug!(url, count = devices.len(), "devices discovered");
                devices
            }
            Err(e) => {
                warn!(url, error = %e, "device discovery failed, using configured devices");
                self.configured.clone()
            }
        }
    }

    async fn discover(&self, url: &str) -> Result<Vec<CaptureDevice>, CatalogError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CatalogError::Request(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(CatalogError::Status(status.as_u16()));
        }
        let body = resp
            .bytes()
            .await
            .map_err(|e| CatalogError::Request(e.to_string()))?;
        serde_json::from_slice(&body).map_err(|e| CatalogError::Parse(e.to_string()))
    }
}

/// Result of a device selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Already the current (or preferred) device.
    Unchanged,
    /// Remembered for the next start.
    Preferred,
    /// The running session moved to the new device.
    Switched,
}

/// Enumerates devices and applies operator selection to the scan loop.
pub struct DeviceManager {
    catalog: DeviceCatalog,
    preferred: Option<String>,
}

impl DeviceManager {
    pub fn new(catalog: DeviceCatalog) -> Self {
        Self {
            catalog,
            preferred: None,
        }
    }

    /// Re-queried on every call; nothing is cached.
    pub async fn list_devices(&self) -> Vec<CaptureDevice> {
        self.catalog.list().await
    }

    /// A chooser is only worth showing with two or more devices.
    pub fn selection_visible(devices: &[CaptureDevice]) -> bool {
        devices.len() >= 2
    }

    pub fn preferred(&self) -> Option<&str> {
        self.preferred.as_deref()
    }

    /// Select a device. While running on another device the session is
    /// stopped and restarted on `id`; while idle the choice is kept for the
    /// next start.
    pub async fn select<S: FrameSource>(
        &mut self,
        id: &str,
        scan: &mut ScanLoop<S>,
        sink: &dyn StatusSink,
    ) -> Result<Selection, AcquisitionError> {
        let devices = self.list_devices().await;
        if !devices.iter().any(|d| d.id == id) {
            sink.report(&format!("Unknown camera: {id}"), Level::Error);
            return Err(AcquisitionError::DeviceNotFound);
        }

        let current = scan.session().map(|s| s.device.id.clone());
        match current {
            Some(current) if current == id => Ok(Selection::Unchanged),
            Some(current) => {
                info!(from = current, to = id, "switching camera");
                self.preferred = Some(id.to_string());
                scan.stop(sink);
                scan.start(&devices, Some(id), sink).await?;
                Ok(Selection::Switched)
            }
            None if self.preferred.as_deref() == Some(id) => Ok(Selection::Unchanged),
            None => {
                self.preferred = Some(id.to_string());
                sink.log_line(&format!("Camera selected: {id}"));
                Ok(Selection::Preferred)
            }
        }
    }
}
