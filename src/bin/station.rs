//! Standalone station binary: wires the S2E core to stdin/stdout as a
//! degenerate LNS transport (one JSON message per line) and an in-memory
//! mock radio, since no chip driver ships with this core. A real deployment
//! swaps in its own [`Ral`] and [`SendBuf`] (a WebSocket client) behind the
//! same traits.

use clap::Parser;
use station_engine::config::{CliOverrides, StationConfig};
use station_engine::engine::Engine;
use station_engine::ral::MockRal;
use station_engine::rx_forwarder::MacHeaderParser;
use station_engine::transport::LineJsonTransport;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(name = "station", about = "LoRaWAN Station-to-Engine packet-forwarding core")]
struct Args {
    /// Path to station.conf.
    #[arg(long, default_value = "station.conf")]
    config: PathBuf,

    #[arg(long)]
    log_level: Option<String>,

    #[arg(long)]
    radio_init: Option<String>,

    #[arg(long)]
    device: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    station_engine::logging::init_logger();

    let args = Args::parse();
    let cli = CliOverrides {
        log_level: args.log_level,
        radio_init: args.radio_init,
        device: args.device,
    };

    let config = match StationConfig::load(&args.config, &cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to load {}: {e}", args.config.display());
            return ExitCode::FAILURE;
        }
    };
    log::info!("starting station, routerid={:?}", config.routerid);

    let ral = MockRal::new(1);
    let send = LineJsonTransport::new(std::io::stdout());
    let engine = Engine::new(ral, MacHeaderParser, send, 1);

    let (tx, rx) = mpsc::unbounded_channel();
    let reader_task = tokio::spawn(async move {
        let stdin = tokio::io::stdin();
        let mut lines = BufReader::new(stdin).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    });

    tokio::select! {
        _ = engine.run(rx) => {}
        _ = tokio::signal::ctrl_c() => {
            log::info!("received interrupt, shutting down");
        }
    }
    reader_task.abort();

    ExitCode::SUCCESS
}
