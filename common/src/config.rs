use serde::Deserialize;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub decoder: DecoderConfig,
    pub submission: SubmissionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_quality")]
    pub quality: u32,
    #[serde(default = "default_fps")]
    pub fps: f64,
    #[serde(default = "default_preferred_facing")]
    pub preferred_facing: Option<String>,
    #[serde(default = "default_live_max_dimension")]
    pub live_max_dimension: u32,
    #[serde(default = "default_file_max_dimension")]
    pub file_max_dimension: u32,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub discovery_url: Option<String>,
}

/// A capture device declared in the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    #[serde(default)]
    pub label: String,
    pub url: String,
    #[serde(default)]
    pub facing: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecoderConfig {
    #[serde(default = "default_true")]
    pub native: bool,
    #[serde(default = "default_native_command")]
    pub native_command: String,
    /// Symbol formats the native detector is scoped to. Empty means all supported.
    #[serde(default)]
    pub formats: Vec<String>,
    #[serde(default = "default_true")]
    pub fallback: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmissionConfig {
    pub endpoint: String,
    #[serde(default = "default_process_path")]
    pub process_path: String,
    #[serde(default = "default_scan_path")]
    pub scan_path: String,
    #[serde(default = "default_complete_path")]
    pub complete_path: String,
    #[serde(default = "default_qr_type")]
    pub qr_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            quality: default_quality(),
            fps: default_fps(),
            preferred_facing: default_preferred_facing(),
            live_max_dimension: default_live_max_dimension(),
            file_max_dimension: default_file_max_dimension(),
            max_file_bytes: default_max_file_bytes(),
            connect_timeout_secs: default_connect_timeout(),
            discovery_url: None,
        }
    }
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            native: true,
            native_command: default_native_command(),
            formats: Vec::new(),
            fallback: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        let config = Self::parse(&content)?;
        debug!(
            path = path.display().to_string(),
            devices = config.devices.len(),
            "config loaded"
        );
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.capture.fps.is_nan() || self.capture.fps <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "capture.fps must be positive, got {}",
                self.capture.fps
            )));
        }
        if self.capture.live_max_dimension == 0 || self.capture.file_max_dimension == 0 {
            return Err(ConfigError::Invalid(
                "capture max dimensions must be non-zero".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for device in &self.devices {
            if !seen.insert(device.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate device id {:?}",
                    device.id
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_mode() -> String {
    "mjpeg".into()
}
fn default_quality() -> u32 {
    80
}
fn default_fps() -> f64 {
    30.0
}
fn default_preferred_facing() -> Option<String> {
    Some("environment".into())
}
fn default_live_max_dimension() -> u32 {
    1280
}
fn default_file_max_dimension() -> u32 {
    1600
}
fn default_max_file_bytes() -> u64 {
    8 * 1024 * 1024
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_true() -> bool {
    true
}
fn default_native_command() -> String {
    "zbarimg".into()
}
fn default_process_path() -> String {
    "/mobile_warehouse/api/process_incoming_qr".into()
}
fn default_scan_path() -> String {
    "/mobile_warehouse/api/scan".into()
}
fn default_complete_path() -> String {
    "/mobile_warehouse/api/complete".into()
}
fn default_qr_type() -> String {
    "incomingstaging".into()
}
fn default_log_level() -> String {
    "info".into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = Config::parse(
            r#"
            [submission]
            endpoint = "https://erp.example.com"
            "#,
        )
        .unwrap();
        assert_eq!(config.capture.mode, "mjpeg");
        assert_eq!(config.capture.live_max_dimension, 1280);
        assert_eq!(config.capture.file_max_dimension, 1600);
        assert_eq!(config.capture.max_file_bytes, 8 * 1024 * 1024);
        assert_eq!(config.capture.preferred_facing.as_deref(), Some("environment"));
        assert!(config.decoder.native);
        assert!(config.decoder.fallback);
        assert!(config.decoder.formats.is_empty());
        assert_eq!(config.submission.qr_type, "incomingstaging");
        assert_eq!(config.logging.level, "info");
        assert!(config.devices.is_empty());
    }

    #[test]
    fn devices_are_parsed_in_order() {
        let config = Config::parse(
            r#"
            [[devices]]
            id = "rear"
            label = "Rear camera"
            url = "http://127.0.0.1:8080/stream"
            facing = "environment"

            [[devices]]
            id = "front"
            url = "https://cam.local/stream"

            [submission]
            endpoint = "http://localhost:8069"
            "#,
        )
        .unwrap();
        let ids: Vec<&str> = config.devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, ["rear", "front"]);
        assert_eq!(config.devices[1].label, "");
        assert!(config.devices[1].facing.is_none());
    }

    #[test]
    fn duplicate_device_ids_rejected() {
        let err = Config::parse(
            r#"
            [[devices]]
            id = "cam"
            url = "http://127.0.0.1/a"

            [[devices]]
            id = "cam"
            url = "http://127.0.0.1/b"

            [submission]
            endpoint = "http://localhost:8069"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn zero_fps_rejected() {
        let err = Config::parse(
            r#"
            [capture]
            fps = 0.0

            [submission]
            endpoint = "http://localhost:8069"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn missing_submission_section_is_parse_error() {
        let err = Config::parse("[capture]\nmode = \"polling\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[submission]\nendpoint = \"http://localhost:8069\"\n[logging]\nlevel = \"debug\""
        )
        .unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn load_missing_file() {
        let err = Config::load(Path::new("/nonexistent/scan-relay.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadFile(..)));
    }
}
