mod capture;
mod decoder;
mod devices;
mod driver;
mod scan_loop;
mod status;
mod submission;

use capture::mjpeg::{MjpegSource, StreamMode};
use capture::Facing;
use decoder::DecoderStrategy;
use devices::{DeviceCatalog, DeviceManager};
use driver::{parse_command, Driver};
use futures_util::FutureExt;
use scan_loop::ScanLoop;
use scan_relay_common::config::Config;
use status::{ConsoleStatus, Level, StatusSink};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use submission::SubmissionClient;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const USAGE: &str = "usage: scan-relay [config.toml] [live | devices | file <image>]";
const MODES: &[&str] = &["live", "devices", "file"];

/// Split argv into the config path and the mode words. The config path may
/// be left out, in which case the first word is already the mode.
fn split_args(args: &[String]) -> (PathBuf, &[String]) {
    match args.first() {
        Some(first) if !MODES.contains(&first.as_str()) => (PathBuf::from(first), &args[1..]),
        _ => (PathBuf::from("config.toml"), args),
    }
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (config_path, mode_args) = split_args(&args);

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    let sink: Arc<dyn StatusSink> = Arc::new(ConsoleStatus);
    let client = SubmissionClient::new(&config.submission);
    let catalog = DeviceCatalog::new(&config.devices, &config.capture);

    match mode_args.first().map(String::as_str).unwrap_or("live") {
        "live" => run_live(&config, catalog, client, sink).await,
        "devices" => {
            let devices = catalog.list().await;
            if devices.is_empty() {
                println!("no cameras configured");
            }
            for d in &devices {
                println!("{}\t{}\t{}", d.id, d.display_name(), d.url);
            }
        }
        "file" => {
            let Some(path) = mode_args.get(1) else {
                eprintln!("{USAGE}");
                std::process::exit(2);
            };
            let decoder = DecoderStrategy::from_config(&config.decoder).await;
            info!(path, decoder = decoder.describe(), "scanning file");
            let result =
                driver::scan_file(path.as_ref(), &config.capture, decoder, &client, sink.as_ref())
                    .await;
            match result {
                Ok(scan) if scan.outcome.as_ref().is_some_and(|o| o.is_error()) => {
                    std::process::exit(1)
                }
                Ok(scan) if scan.value.is_none() => std::process::exit(1),
                Ok(_) => {}
                Err(_) => std::process::exit(1),
            }
        }
        other => {
            eprintln!("unknown mode {other:?}\n{USAGE}");
            std::process::exit(2);
        }
    }
}

async fn run_live(
    config: &Config,
    catalog: DeviceCatalog,
    client: SubmissionClient,
    sink: Arc<dyn StatusSink>,
) {
    let Some(mode) = StreamMode::parse(&config.capture.mode) else {
        error!(
            mode = config.capture.mode,
            "unknown stream mode, expected 'mjpeg' or 'polling'"
        );
        std::process::exit(1);
    };

    let source = match MjpegSource::new(
        mode,
        config.capture.quality,
        config.capture.fps,
        Duration::from_secs(config.capture.connect_timeout_secs),
    ) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to create capture client");
            std::process::exit(1);
        }
    };

    let facing = config.capture.preferred_facing.as_deref().and_then(|f| {
        let parsed = Facing::parse(f);
        if parsed.is_none() {
            warn!(facing = f, "unknown preferred_facing ignored");
        }
        parsed
    });

    let decoder_config = config.decoder.clone();
    let scan = ScanLoop::new(
        source,
        Box::new(move || {
            let config = decoder_config.clone();
            async move { DecoderStrategy::from_config(&config).await }.boxed()
        }),
        config.capture.live_max_dimension,
        facing,
    );

    info!(
        mode = config.capture.mode,
        fps = config.capture.fps,
        endpoint = config.submission.endpoint,
        devices = config.devices.len(),
        "starting scan-relay"
    );

    let (tx, rx) = mpsc::channel(16);
    if tx.send(driver::Command::Start).await.is_err() {
        error!("command channel closed before start");
        std::process::exit(1);
    }

    let input_sink = sink.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "failed to read stdin");
                    break;
                }
            };
            match parse_command(&line) {
                Ok(Some(cmd)) => {
                    if tx.send(cmd).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => input_sink.report(&e.to_string(), Level::Error),
            }
        }
    });

    let mut driver = Driver::new(
        scan,
        DeviceManager::new(catalog),
        client,
        sink,
        config.capture.fps,
    );
    driver.run_live(rx).await;
    info!("scan-relay stopped");
}
