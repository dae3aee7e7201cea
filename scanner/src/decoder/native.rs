use image::{GrayImage, ImageFormat};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

use super::{DecodeError, SymbolDetector};

static SCRATCH_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Exit status zbarimg uses when the image was read but held no symbol.
const EXIT_NO_SYMBOL: i32 = 4;

/// Symbologies zbar can be scoped to.
pub const ZBAR_SYMBOLOGIES: &[&str] = &[
    "qrcode",
    "ean13",
    "ean8",
    "upca",
    "upce",
    "isbn10",
    "isbn13",
    "i25",
    "code39",
    "code93",
    "code128",
    "codabar",
    "databar",
    "databar-exp",
    "pdf417",
];

/// Map a format name (zbar or web-style, e.g. `qr_code`, `ean_13`) onto the
/// zbar symbology name.
pub fn zbar_symbology(format: &str) -> Option<&'static str> {
    let name = match format.trim().to_ascii_lowercase().as_str() {
        "qr" | "qr_code" | "qrcode" => "qrcode",
        "ean_13" | "ean13" => "ean13",
        "ean_8" | "ean8" => "ean8",
        "upc_a" | "upca" => "upca",
        "upc_e" | "upce" => "upce",
        "itf" | "i25" => "i25",
        "code_39" | "code39" => "code39",
        "code_93" | "code93" => "code93",
        "code_128" | "code128" => "code128",
        "codabar" => "codabar",
        "pdf417" => "pdf417",
        other => return ZBAR_SYMBOLOGIES.iter().copied().find(|s| *s == other),
    };
    Some(name)
}

/// Resolve the configured format list. Empty means every supported symbology.
pub fn scope_formats(formats: &[String]) -> Result<Vec<&'static str>, DecodeError> {
    if formats.is_empty() {
        return Ok(Vec::new());
    }
    let mut scoped = Vec::new();
    for format in formats {
        match zbar_symbology(format) {
            Some(sym) if !scoped.contains(&sym) => scoped.push(sym),
            Some(_) => {}
            None => warn!(format, "format not supported by native detector, ignoring"),
        }
    }
    if scoped.is_empty() {
        return Err(DecodeError::Unavailable(format!(
            "none of the configured formats are supported: {formats:?}"
        )));
    }
    Ok(scoped)
}

/// Native detector backed by the host's `zbarimg` executable.
pub struct ZbarDetector {
    command: String,
    symbologies: Vec<&'static str>,
}

/// How zbarimg's `--raw` stdout is cut into symbols.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawOutput {
    /// One symbol per line.
    Lines,
    /// The whole of stdout is one symbol, embedded newlines included.
    Whole,
}

impl ZbarDetector {
    /// Check that the executable runs and scope it to `formats`.
    pub async fn probe(command: &str, formats: &[String]) -> Result<Self, DecodeError> {
        let output = tokio::process::Command::new(command)
            .arg("--version")
            .output()
            .await
            .map_err(|e| DecodeError::Unavailable(format!("{command}: {e}")))?;
        if !output.status.success() {
            return Err(DecodeError::Unavailable(format!(
                "{command} --version exited with {}",
                output.status
            )));
        }
        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let symbologies = scope_formats(formats)?;

        info!(command, version, formats = ?symbologies, "native detector ready");
        Ok(Self {
            command: command.to_string(),
            symbologies,
        })
    }

    fn args(&self, image_path: &Path) -> Vec<String> {
        let mut args = vec!["--quiet".to_string(), "--raw".to_string()];
        if !self.symbologies.is_empty() {
            args.push("-Sdisable".to_string());
            for sym in &self.symbologies {
                args.push(format!("-S{sym}.enable"));
            }
        }
        args.push(image_path.display().to_string());
        args
    }

    /// Scoped to one symbology, stdout is read as a single symbol so QR
    /// payloads keep their line breaks.
    fn raw_output(&self) -> RawOutput {
        if self.symbologies.len() == 1 {
            RawOutput::Whole
        } else {
            RawOutput::Lines
        }
    }
}

impl SymbolDetector for ZbarDetector {
    fn detect(&mut self, image: &GrayImage) -> Result<Vec<String>, DecodeError> {
        let scratch = scratch_path();
        image
            .save_with_format(&scratch, ImageFormat::Png)
            .map_err(|e| DecodeError::Failed(format!("failed to write decode buffer: {e}")))?;

        let result = std::process::Command::new(&self.command)
            .args(self.args(&scratch))
            .output();

        if let Err(e) = std::fs::remove_file(&scratch) {
            warn!(path = scratch.display().to_string(), error = %e, "failed to delete decode buffer");
        }

        let output = result.map_err(|e| DecodeError::Failed(format!("{}: {e}", self.command)))?;
        let symbols = interpret_output(
            output.status.code(),
            &String::from_utf8_lossy(&output.stdout),
            &String::from_utf8_lossy(&output.stderr),
            self.raw_output(),
        )?;
        debug!(count = symbols.len(), "native detector pass");
        Ok(symbols)
    }

    fn name(&self) -> &str {
        &self.command
    }
}

fn scratch_path() -> PathBuf {
    let n = SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("scan-relay-{}-{n}.png", std::process::id()))
}

/// Turn a zbarimg exit into symbols, an empty result, or a failure.
pub fn interpret_output(
    code: Option<i32>,
    stdout: &str,
    stderr: &str,
    raw: RawOutput,
) -> Result<Vec<String>, DecodeError> {
    match (code, raw) {
        (Some(0), RawOutput::Lines) => Ok(stdout
            .lines()
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()),
        (Some(0), RawOutput::Whole) => {
            let symbol = stdout.strip_suffix('\n').unwrap_or(stdout);
            let symbol = symbol.strip_suffix('\r').unwrap_or(symbol);
            Ok(if symbol.is_empty() {
                Vec::new()
            } else {
                vec![symbol.to_string()]
            })
        }
        (Some(EXIT_NO_SYMBOL), _) => Ok(Vec::new()),
        (Some(code), _) => {
            let detail = stderr.lines().next().unwrap_or("").trim();
            Err(DecodeError::Failed(format!("exit status {code}: {detail}")))
        }
        (None, _) => Err(DecodeError::Failed("terminated by signal".into())),
    }
}
