mod domain;
mod infrastructure;

use crate::domain::models::{AppEvent, MessageSeverity, MetricSample, SpeedUnit};
use crate::domain::settings::SettingsService;
use crate::infrastructure::bluetooth::{
    BluetoothService, BtleplugAdapter, ChannelObserver, SessionHandle,
};
use std::io::BufRead;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

fn print_sample(sample: &MetricSample) {
    let other = match sample.unit {
        SpeedUnit::KilometersPerHour => SpeedUnit::MilesPerHour,
        SpeedUnit::MilesPerHour => SpeedUnit::KilometersPerHour,
    };
    match (sample.decoded_value, sample.value_in(other)) {
        (Some(value), Some(converted)) => println!(
            "Speed: {} {} ({:.1} {})",
            value,
            sample.unit.suffix(),
            converted,
            other.suffix()
        ),
        // The decode error itself arrives as a log message.
        _ => debug!(raw = ?sample.raw_bytes, "Unreadable speed frame"),
    }
}

/// Line commands on stdin: start, stop, cancel, quit
///
/// Runs on a plain thread; a blocking stdin read must not hold up runtime
/// shutdown.
fn run_console(handle: SessionHandle) {
    for line in std::io::stdin().lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!("Console input failed: {}", e);
                break;
            }
        };
        let sent = match line.trim() {
            "" => continue,
            "start" => handle.start(),
            "stop" => handle.stop(),
            "cancel" => handle.cancel_connect(),
            "quit" | "exit" => handle.shutdown(),
            other => {
                println!("Unknown command {other:?} (start, stop, cancel, quit)");
                continue;
            }
        };
        if !sent {
            break;
        }
    }
    debug!("Console closed");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings_service = match std::env::args_os().nth(1) {
        Some(path) => SettingsService::load(PathBuf::from(path))?,
        None => SettingsService::new()?,
    };

    let _logging_guard =
        infrastructure::logging::init_logger(&settings_service.get().log_settings)
            .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
            .ok();

    info!("Starting OBD speed monitor");
    info!("Settings file: {}", settings_service.path().display());
    if !settings_service.path().exists() {
        match settings_service.save() {
            Ok(()) => info!("Wrote default settings"),
            Err(e) => warn!("Could not write default settings: {}", e),
        }
    }

    let settings = settings_service.get().clone();
    let (app_tx, mut app_rx) = mpsc::unbounded_channel();
    let (adapter_tx, adapter_rx) = mpsc::unbounded_channel();

    let adapter = BtleplugAdapter::new(adapter_tx).await?;
    let (service, handle) =
        BluetoothService::new(&settings, adapter, adapter_rx, ChannelObserver::new(app_tx))?;

    tokio::spawn(async move {
        while let Some(event) = app_rx.recv().await {
            match event {
                AppEvent::MetricSample(sample) => print_sample(&sample),
                AppEvent::SessionState(state) => info!(?state, "Session state"),
                AppEvent::LogMessage(msg) => match msg.severity {
                    MessageSeverity::Error => error!("{}", msg.message),
                    MessageSeverity::Warning => warn!("{}", msg.message),
                },
            }
        }
    });

    let console = handle.clone();
    std::thread::spawn(move || run_console(console));

    let shutdown = handle;
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            return;
        }
        info!("Ctrl-C received, shutting down");
        shutdown.shutdown();
    });

    service.run().await;

    // Let the final disconnect request reach the radio.
    tokio::time::sleep(Duration::from_millis(500)).await;
    Ok(())
}
