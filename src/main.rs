//! CLI entry point for the deposit station.
//!
//! - `controller`: run the detection pipeline and drive the device over a serial port
//! - `device`: act as the device on a serial port (bench simulator)
//! - `simulate`: run both sides in-process over an in-memory link
//! - `show-config`: print the effective configuration
//!
//! Commands typed on stdin (`*IDN?`, `LED:ON`, `LOCK:ON`, ...) are queued for the device;
//! `quit` or Ctrl+C stops the station cleanly.
//!
//! # Usage
//!
//! ```bash
//! deposit-station controller --port /dev/ttyACM0
//! deposit-station --verbose simulate --scan-script scans.txt
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::{select, Receiver};
use deposit_station::config::StationConfig;
use deposit_station::dispatch::CommandOutcome;
use deposit_station::link::{self, MemoryLink};
use deposit_station::logging;
use deposit_station::pipeline::{ScriptedDecoder, SyntheticCamera, UniqueBarcode};
use deposit_station::queue::QueueSender;
use deposit_station::shutdown::StopSignal;
use deposit_station::state::StateStore;
use deposit_station::station::{ControllerStation, DeviceStation};
use deposit_station::worker::{spawn_worker, Worker};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "deposit-station")]
#[command(about = "Barcode intake and lid-lock controller for a deposit station", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = "config/station.toml")]
    config: PathBuf,

    /// Log at debug level regardless of the configured level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the detection pipeline and drive the device over a serial port
    Controller {
        /// Serial port, overriding link.port
        #[arg(long)]
        port: Option<String>,

        /// Scan script replayed as decoder output, one line per frame
        #[arg(long)]
        scan_script: Option<PathBuf>,
    },

    /// Act as the device on a serial port
    Device {
        /// Serial port, overriding link.port
        #[arg(long)]
        port: Option<String>,

        /// State file, overriding device.state_file
        #[arg(long)]
        state_file: Option<PathBuf>,
    },

    /// Run controller and device in-process over an in-memory link
    Simulate {
        /// Scan script replayed as decoder output, one line per frame
        #[arg(long)]
        scan_script: Option<PathBuf>,

        /// State file, overriding device.state_file
        #[arg(long)]
        state_file: Option<PathBuf>,
    },

    /// Print the effective configuration as TOML
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = StationConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    if cli.verbose {
        config.application.log_level = "debug".to_string();
    }
    config.validate()?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Controller { port, scan_script } => {
            if let Some(port) = port {
                config.link.port = port;
            }
            run_controller(config, scan_script).await
        }
        Commands::Device { port, state_file } => {
            if let Some(port) = port {
                config.link.port = port;
            }
            if let Some(path) = state_file {
                config.device.state_file = path;
            }
            run_device(config).await
        }
        Commands::Simulate {
            scan_script,
            state_file,
        } => {
            if let Some(path) = state_file {
                config.device.state_file = path;
            }
            run_simulation(config, scan_script).await
        }
        Commands::ShowConfig => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn run_controller(config: StationConfig, scan_script: Option<PathBuf>) -> Result<()> {
    let link = link::open_serial(&config.link.port, config.link.baud_rate)
        .with_context(|| format!("Failed to open {}", config.link.port))?;
    let stop = StopSignal::new();

    let station = ControllerStation::launch(
        &config,
        link,
        camera(&config),
        decoder(scan_script.as_deref())?,
        stop.clone(),
    )?;
    spawn_console(station.commands(), stop.clone())?;
    let reporter = spawn_reporter(&station, &stop)?;

    wait_for_stop(&stop).await?;
    let report = tokio::task::spawn_blocking(move || station.shutdown()).await??;
    reporter.join()?;
    info!(
        identity = ?report.engine.identity,
        unique_barcodes = report.consumer.unique,
        commands = report.dispatch.completed,
        "Controller finished"
    );
    Ok(())
}

async fn run_device(config: StationConfig) -> Result<()> {
    let link = link::open_serial(&config.link.port, config.link.baud_rate)
        .with_context(|| format!("Failed to open {}", config.link.port))?;
    let stop = StopSignal::new();
    let store = StateStore::open(&config.device.state_file);
    let device = DeviceStation::launch(&config, link, store, stop.clone())?;

    wait_for_stop(&stop).await?;
    let store = tokio::task::spawn_blocking(move || device.shutdown()).await??;
    info!(state = ?store.values(), "Device finished");
    Ok(())
}

async fn run_simulation(config: StationConfig, scan_script: Option<PathBuf>) -> Result<()> {
    let (controller_link, device_link) = MemoryLink::pair();
    let stop = StopSignal::new();

    let store = StateStore::open(&config.device.state_file);
    let device = DeviceStation::launch(&config, device_link, store, stop.clone())?;
    let station = ControllerStation::launch(
        &config,
        controller_link,
        camera(&config),
        decoder(scan_script.as_deref())?,
        stop.clone(),
    )?;
    spawn_console(station.commands(), stop.clone())?;
    let reporter = spawn_reporter(&station, &stop)?;

    wait_for_stop(&stop).await?;
    let (controller, device) = tokio::task::spawn_blocking(move || {
        let controller = station.shutdown();
        let device = device.shutdown();
        (controller, device)
    })
    .await?;
    reporter.join()?;

    let store = device?;
    let report = controller?;
    info!(
        unique_barcodes = report.consumer.unique,
        commands = report.dispatch.completed,
        state = ?store.values(),
        "Simulation finished"
    );
    Ok(())
}

fn camera(config: &StationConfig) -> SyntheticCamera {
    SyntheticCamera::new(640, 480, config.pipeline.synthetic_fps)
}

fn decoder(scan_script: Option<&Path>) -> Result<ScriptedDecoder> {
    match scan_script {
        Some(path) => {
            let decoder = ScriptedDecoder::from_file(path)?;
            info!(path = %path.display(), frames = decoder.remaining(), "Scan script loaded");
            Ok(decoder)
        }
        None => {
            warn!("No capture backend attached and no --scan-script given; no barcodes will be seen");
            Ok(ScriptedDecoder::default())
        }
    }
}

/// Block until Ctrl+C or until a station thread raises the stop signal itself.
async fn wait_for_stop(stop: &StopSignal) -> Result<()> {
    let watcher = stop.clone();
    let stopped = tokio::task::spawn_blocking(move || watcher.wait());
    info!("Running; type commands, `quit` or Ctrl+C to stop");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            info!("Interrupt received, shutting down");
        }
        _ = stopped => {
            info!("Station stopped");
        }
    }
    stop.cancel();
    Ok(())
}

/// Feed stdin lines into the command queue.
///
/// The thread is detached: a read on stdin cannot be interrupted, and the process exits
/// without waiting for it.
fn spawn_console(commands: QueueSender<String>, stop: StopSignal) -> Result<()> {
    std::thread::Builder::new()
        .name("console".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                if stop.is_cancelled() {
                    break;
                }
                match line.trim() {
                    "" => continue,
                    "quit" | "exit" => {
                        stop.cancel();
                        break;
                    }
                    command => {
                        if !commands.push(command.to_string()) {
                            break;
                        }
                    }
                }
            }
        })
        .context("Failed to start console reader")?;
    Ok(())
}

/// Print unique barcodes and command outcomes to stdout until stopped.
fn spawn_reporter(station: &ControllerStation, stop: &StopSignal) -> Result<Worker<()>> {
    let events: Receiver<UniqueBarcode> = station.events().clone();
    let outcomes: Receiver<CommandOutcome> = station.outcomes().clone();
    let signal = stop.clone();
    let worker = spawn_worker("reporter", stop, move || {
        loop {
            select! {
                recv(events) -> event => match event {
                    Ok(event) => println!("barcode #{}: {}", event.ordinal, event.detection.payload),
                    Err(_) => break,
                },
                recv(outcomes) -> outcome => match outcome {
                    Ok(CommandOutcome { request, result: Ok(reply) }) => println!("{request} -> {reply}"),
                    Ok(CommandOutcome { request, result: Err(e) }) => println!("{request} failed: {e}"),
                    Err(_) => break,
                },
                recv(signal.wake()) -> _ => break,
            }
        }
        Ok(())
    })
    .context("Failed to start reporter")?;
    Ok(worker)
}
