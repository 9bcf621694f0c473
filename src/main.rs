use std::process::exit;

use anyhow::{Context, Result};
use biopot_rs::{logging, BioPot, BluetoothConnector, SessionConfig, DEFAULT_REORDER_WINDOW};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "biopot-demo", about = "Connect to a BioPot and stream ordered samples")]
struct Args {
    /// Bluetooth address (e.g., C0:98:E5:00:12:34)
    address: String,
    /// Number of samples to read before stopping
    #[arg(long, default_value_t = 1000)]
    samples: usize,
    /// Out-of-order packets held before a missing one is skipped
    #[arg(long, default_value_t = DEFAULT_REORDER_WINDOW)]
    window: usize,
    /// Print one JSON object per sample instead of a summary line every 100 samples
    #[arg(long)]
    json: bool,
}

fn main() {
    logging::init_rust_logging();
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();

    eprintln!("Connecting to {}...", args.address);
    let transport = BluetoothConnector::default()
        .connect(&args.address)
        .await
        .context("bluetooth connection failed")?;
    let mut device = BioPot::with_config(
        transport,
        SessionConfig {
            reorder_window: args.window,
        },
    );

    let info = device.read_device_information().await?;
    eprintln!(
        "Battery: {}% (charging: {}), temperature: {}",
        info.battery_level, info.battery_charging, info.temperature_value
    );

    let mut samples = device.start().await.context("failed to start acquisition")?;
    if let Some(config) = device.device_configuration() {
        eprintln!(
            "Streaming: serial={}, accelerometer={:?}, samples_per_packet={}",
            config.serial_number, config.accelerometer_status, config.samples_per_channel
        );
    }

    let mut received = 0;
    while received < args.samples {
        let Some(sample) = samples.recv().await else {
            eprintln!("Session ended early after {} samples", received);
            break;
        };
        received += 1;
        if args.json {
            println!("{}", serde_json::to_string(&sample)?);
        } else if received % 100 == 1 {
            println!("[{:>8}] {:?}", sample.index, sample.channels);
        }
    }

    eprintln!("Stopping...");
    drop(samples);
    device.stop().await?;
    if let Some(stats) = device.last_session_stats() {
        eprintln!("Session stats: {}", serde_json::to_string(&stats)?);
    }
    Ok(())
}
