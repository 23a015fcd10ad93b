//! HuskyLens polling tool
//!
//! Connects to a HuskyLens over UART, selects an algorithm and prints the
//! detections of each poll.
//!
//! Usage:
//!   cargo run --example poll_huskylens -- [OPTIONS]
//!
//! Options:
//!   --port PORT       Serial port (default: first port found)
//!   --config FILE     JSON configuration file
//!   --algorithm CODE  Algorithm code 0-8 (default: 0, face recognition)
//!   --polls N         Number of polls (default: 10)
//!   --list            List serial ports and exit
//!
//! Set RUST_LOG=huskylens_core=debug for protocol traces.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use huskylens_core::prelude::*;
use huskylens_core::transport::list_ports;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let mut config = HuskyLensConfig::default();
    let mut port = None;
    let mut algorithm_code = 0u8;
    let mut polls = 10u32;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                i += 1;
                port = args.get(i).cloned();
            }
            "--config" | "-c" => {
                i += 1;
                let path = args.get(i).context("--config needs a file")?;
                config = HuskyLensConfig::from_file(path)
                    .with_context(|| format!("loading {}", path))?;
            }
            "--algorithm" | "-a" => {
                i += 1;
                algorithm_code = args
                    .get(i)
                    .context("--algorithm needs a code")?
                    .parse()
                    .context("algorithm code must be a number")?;
            }
            "--polls" | "-n" => {
                i += 1;
                polls = args
                    .get(i)
                    .context("--polls needs a count")?
                    .parse()
                    .context("poll count must be a number")?;
            }
            "--list" => {
                for info in list_ports() {
                    println!("{:<20} {:?}", info.name, info.product);
                }
                return Ok(());
            }
            other => bail!("unknown argument: {}", other),
        }
        i += 1;
    }
    if port.is_some() {
        config.serial.port = port;
    }

    let transport = Arc::new(SerialTransport::open(&config.serial)?);
    let lens = HuskylensProtocol::new(Arc::clone(&transport), &config);

    if !lens.begin().await {
        bail!("no answer from HuskyLens on {}", transport.name());
    }
    lens.init_mode_code(algorithm_code).await?;
    println!("Learned IDs: {}", lens.get_ids().await);

    for _ in 0..polls {
        if lens.request().await {
            let results = lens.result_set();
            println!(
                "frame {}: {} results",
                results.info.frame_number,
                results.detections.len()
            );
            for detection in &results.detections {
                println!("  {:?}", detection);
            }
            if lens.is_appear(ResultKind::Block) {
                println!(
                    "  nearest block: id {} at ({}, {})",
                    lens.read_box(BoxField::Id),
                    lens.read_box(BoxField::XCenter),
                    lens.read_box(BoxField::YCenter)
                );
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    println!("{:?}", lens.queue_stats());
    Ok(())
}
