use chrono::Local;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Error,
}

/// Operator-facing presentation of status and log lines.
///
/// Calls are fire-and-forget; the scanner never reads anything back.
pub trait StatusSink: Send + Sync {
    /// Replace the current status line.
    fn report(&self, message: &str, level: Level);

    /// Append a line to the scrolling log.
    fn log_line(&self, message: &str);

    /// Update the "last action" label.
    fn set_last_action(&self, text: &str);
}

/// Terminal sink: status and log lines go to stdout with a local timestamp and
/// are mirrored into tracing.
pub struct ConsoleStatus;

impl StatusSink for ConsoleStatus {
    fn report(&self, message: &str, level: Level) {
        match level {
            Level::Info => {
                info!(status = message, "status");
                println!("[status] {message}");
            }
            Level::Error => {
                error!(status = message, "status");
                println!("[error]  {message}");
            }
        }
    }

    fn log_line(&self, message: &str) {
        info!("{message}");
        println!("{} {message}", Local::now().format("%H:%M:%S"));
    }

    fn set_last_action(&self, text: &str) {
        info!(last_action = text, "last action");
        println!("[last]   {text}");
    }
}
