//! CLI Entry Point for testrig
//!
//! Provides command-line interface for:
//! - Listing connected controllers
//! - Pushing stage configuration and cycle programs to one controller
//! - Running an interactive acquisition session across every controller
//! - Summarising an exported run
//!
//! # Usage
//!
//! ```bash
//! testrig ports
//! testrig configure --port ttyACM0 --stage A --ghr 30 --tpi 5 --resolution 1024 --quadrature 4
//! testrig cycle --port ttyACM0 --cycles 200 --duty 50
//! testrig run --output-dir data
//! testrig analyze data/ttyACM0_20261014_093000.csv --threshold 2500
//! ```

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use testrig_daq::acquisition::WorkerSettings;
use testrig_daq::analysis::{summarize_above, Channel, DEFAULT_RPM_THRESHOLD};
use testrig_daq::config::RigConfig;
use testrig_daq::consumer::{ChartSink, LogSink, TableSink};
use testrig_daq::device::{Device, DeviceId, DeviceRegistry};
use testrig_daq::dispatch::DispatchBridge;
use testrig_daq::protocol::{ConfigCommand, ControlMessage, CycleCommand, StageId};
use testrig_daq::session::Session;
use testrig_daq::{storage, tracing_setup};
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "testrig")]
#[command(about = "Multi-controller test rig acquisition", long_about = None)]
struct Cli {
    /// Configuration file (defaults to config/testrig.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports that look like controllers
    Ports,

    /// Send a stage configuration to one controller
    Configure {
        #[arg(long)]
        port: String,
        /// Stage id (A or B)
        #[arg(long)]
        stage: StageId,
        #[arg(long)]
        ghr: String,
        #[arg(long)]
        tpi: String,
        #[arg(long)]
        resolution: String,
        #[arg(long)]
        quadrature: String,
    },

    /// Send a cycle program to one controller
    Cycle {
        #[arg(long)]
        port: String,
        /// Number of cycles
        #[arg(long)]
        cycles: u32,
        /// Duty cycle in percent (0-100)
        #[arg(long)]
        duty: f64,
    },

    /// Open every controller and read control words from stdin
    Run {
        /// Where exported tables are written (overrides export.output_dir)
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },

    /// Summarise RPM above a threshold in an exported CSV
    Analyze {
        csv: PathBuf,
        #[arg(long, default_value_t = DEFAULT_RPM_THRESHOLD)]
        threshold: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => RigConfig::load_from(path),
        None => RigConfig::load(),
    }
    .context("Failed to load configuration")?;
    tracing_setup::init_from_config(&config).context("Failed to initialize logging")?;

    match cli.command {
        Commands::Ports => list_ports(&config),
        Commands::Configure {
            port,
            stage,
            ghr,
            tpi,
            resolution,
            quadrature,
        } => {
            let command = ConfigCommand {
                ghr,
                tpi,
                resolution,
                quadrature,
                stage,
            };
            send_one(&config, &port, ControlMessage::Config(command)).await
        }
        Commands::Cycle { port, cycles, duty } => {
            let command = CycleCommand::from_percent(cycles, duty)?;
            send_one(&config, &port, ControlMessage::Cycle(command)).await
        }
        Commands::Run { output_dir } => {
            let output_dir = output_dir.unwrap_or_else(|| config.export.output_dir.clone());
            run_session(&config, &output_dir).await
        }
        Commands::Analyze { csv, threshold } => analyze(&csv, threshold),
    }
}

fn registry(config: &RigConfig) -> DeviceRegistry {
    DeviceRegistry::system().with_patterns(config.serial.port_patterns.clone())
}

fn list_ports(config: &RigConfig) -> Result<()> {
    let candidates = registry(config).discover()?;
    if candidates.is_empty() {
        println!("No controllers found");
    }
    for candidate in candidates {
        println!("{}\t{}", candidate.name, candidate.path);
    }
    Ok(())
}

async fn send_one(config: &RigConfig, port: &str, message: ControlMessage) -> Result<()> {
    let mut registry = registry(config);
    let device = registry
        .open(port)
        .with_context(|| format!("Failed to open controller on {port}"))?;
    device.send(&message).await?;
    println!("✅ Sent {} to {}", message.kind(), device.id());
    registry.close_all().await;
    Ok(())
}

struct DeviceSinks {
    id: DeviceId,
    table: TableSink,
    chart: ChartSink,
}

enum Flow {
    Continue,
    Quit,
}

async fn run_session(config: &RigConfig, output_dir: &Path) -> Result<()> {
    let mut registry = registry(config);
    let (devices, failures) = registry.open_all()?;
    for failure in &failures {
        println!("⚠️  {failure}");
    }
    if devices.is_empty() {
        bail!("No controllers could be opened");
    }

    let mut bridge = DispatchBridge::new(
        config.dispatch.channel_capacity,
        config.dispatch.backpressure(),
    );
    let sinks: Vec<DeviceSinks> = devices
        .iter()
        .map(|device: &Device| {
            let sinks = DeviceSinks {
                id: device.id().clone(),
                table: TableSink::new(format!("{} table", device.id())),
                chart: ChartSink::new(format!("{} graph", device.id()), config.chart.window),
            };
            bridge.bind(device.id(), sinks.table.clone());
            bridge.bind(device.id(), sinks.chart.clone());
            sinks
        })
        .collect();
    bridge.bind_all(LogSink::new());

    let mut session = Session::new(
        registry,
        bridge.spawn()?,
        WorkerSettings::from(&config.acquisition),
    );

    println!("📡 {} controller(s) ready", sinks.len());
    println!("   Commands: start, pause, stop, clear, export, status, quit");

    let mut lines = stdin_lines();
    loop {
        tokio::select! {
            line = lines.recv() => {
                let Some(line) = line else { break };
                match handle_command(&mut session, line.trim(), &sinks, output_dir).await {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Quit) => break,
                    Err(e) => println!("❌ {e}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        }
    }

    println!("👋 Shutting down...");
    session.shutdown().await?;
    export_tables(&sinks, output_dir)?;
    Ok(())
}

/// Stdin read on a plain thread, which does not hold up runtime shutdown.
fn stdin_lines() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

async fn handle_command(
    session: &mut Session,
    word: &str,
    sinks: &[DeviceSinks],
    output_dir: &Path,
) -> Result<Flow> {
    match word {
        "" => {}
        "start" => {
            let id = session.start().await?;
            println!("▶️  Running (session {id})");
        }
        "pause" => {
            session.pause().await?;
            println!("⏸️  Paused");
        }
        "stop" => {
            let reports = session.stop().await?;
            for report in reports {
                println!(
                    "⏹️  {}: {:?}, {} samples, {} skipped, {} read errors",
                    report.device,
                    report.exit,
                    report.stats.samples_forwarded,
                    report.stats.lines_skipped,
                    report.stats.read_errors
                );
            }
        }
        "clear" => {
            session.clear().await?;
            session.bridge().flush().await?;
            println!("🧹 Tables cleared");
        }
        "export" => export_tables(sinks, output_dir)?,
        "status" => print_status(session, sinks),
        "quit" | "exit" => return Ok(Flow::Quit),
        other => println!("Unknown command '{other}'"),
    }
    Ok(Flow::Continue)
}

fn print_status(session: &Session, sinks: &[DeviceSinks]) {
    println!("Run state: {}", session.run_state());
    for (id, state) in session.device_states() {
        let Some(sink) = sinks.iter().find(|s| s.id == id) else {
            println!("  {id}: {state}");
            continue;
        };
        let position = sink
            .chart
            .latest()
            .map_or_else(|| "-".to_string(), |p| p.pos_cnt.to_string());
        println!(
            "  {id}: {state}, {} rows, pos_cnt {position}",
            sink.table.len()
        );
    }
    let metrics = session.metrics();
    println!(
        "Dispatch: {} forwarded, {} dropped ({:.2}%), {} stale, {}/{} queued",
        metrics.forwarded,
        metrics.dropped,
        metrics.drop_rate_percent,
        metrics.stale,
        metrics.channel_occupancy,
        metrics.channel_capacity
    );
}

fn export_tables(sinks: &[DeviceSinks], output_dir: &Path) -> Result<()> {
    let now = Local::now();
    for sink in sinks {
        let path = storage::export_path(output_dir, &sink.id, now);
        let rows = storage::export_csv(&sink.table.rows(), &path)
            .with_context(|| format!("Failed to export {}", path.display()))?;
        println!("💾 {} rows -> {}", rows, path.display());
    }
    Ok(())
}

fn analyze(csv: &Path, threshold: f64) -> Result<()> {
    let records = storage::load_csv(csv)
        .with_context(|| format!("Failed to read {}", csv.display()))?;
    println!("{} rows in {}", records.len(), csv.display());
    for channel in [Channel::A, Channel::B] {
        match summarize_above(&records, channel, threshold) {
            Some(summary) => println!("{summary}"),
            None => println!("RPM {channel} > {threshold}: no rows"),
        }
    }
    Ok(())
}
