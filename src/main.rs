use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use dot_exporter::config::{DEFAULT_BAUD_RATE, DEFAULT_RETRANSMISSION_BUDGET};
use dot_exporter::{logging, ControlCommand, ExporterConfig, SensorRegistry, SerialOpener};

/// Bridges DOT sensors to a control surface speaking JSON lines.
///
/// Commands are read from stdin, one `{"event": ..., "parameters": {...}}`
/// object per line; device events are written to stdout in the same shape.
#[derive(Parser, Debug)]
#[command(name = "dot-exporter", about = "Export recordings from DOT sensors to CSV")]
struct Args {
    /// Serial ports opened on startScanning (e.g., /dev/ttyACM0, COM4)
    #[arg(required = true)]
    ports: Vec<String>,
    /// Root directory for export batches
    #[arg(long, default_value = "data")]
    export_root: PathBuf,
    #[arg(long, default_value_t = DEFAULT_BAUD_RATE)]
    baud_rate: u32,
    /// Serial read timeout in milliseconds
    #[arg(long, default_value_t = 20)]
    read_timeout_ms: u64,
    /// Out-of-order units tolerated before a sequence gap is skipped
    #[arg(long, default_value_t = DEFAULT_RETRANSMISSION_BUDGET)]
    retransmission_budget: u32,
    /// Seconds to wait for a non-streaming response; 0 waits forever
    #[arg(long, default_value_t = 10)]
    request_timeout_secs: u64,
    /// Log level (overrides DOT_EXPORTER_LOG / RUST_LOG)
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn config(&self) -> ExporterConfig {
        ExporterConfig {
            ports: self.ports.clone(),
            baud_rate: self.baud_rate,
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            export_root: self.export_root.clone(),
            retransmission_budget: self.retransmission_budget,
            request_timeout: (self.request_timeout_secs > 0)
                .then(|| Duration::from_secs(self.request_timeout_secs)),
        }
    }
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    logging::init_logging_at(args.log_level.as_deref());

    let config = args.config();
    let opener = SerialOpener {
        baud_rate: config.baud_rate,
        read_timeout: config.read_timeout,
    };
    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(serve(config, Arc::new(opener)))
}

async fn serve(config: ExporterConfig, opener: Arc<SerialOpener>) -> Result<()> {
    info!("serving {} ports, exporting to {}", config.ports.len(), config.export_root.display());
    let registry = SensorRegistry::new(config, opener);
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
    let registry_task = tokio::spawn(registry.run(cmd_rx, ev_tx));

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(event) = ev_rx.recv().await {
            let mut line = serde_json::to_vec(&event)?;
            line.push(b'\n');
            stdout.write_all(&line).await?;
            stdout.flush().await?;
        }
        anyhow::Ok(())
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ControlCommand>(&line) {
            Ok(cmd) => {
                if cmd_tx.send(cmd).is_err() {
                    break;
                }
            }
            Err(e) => warn!("ignoring unrecognised command {:?}: {}", line, e),
        }
    }

    info!("stdin closed, shutting down");
    drop(cmd_tx);
    registry_task.await.context("Registry task failed")?;
    writer.await.context("Event writer failed")??;
    Ok(())
}
