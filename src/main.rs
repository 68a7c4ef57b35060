//! Demo: read a simulated power meter through device-scoped wrappers.
//!
//! ```text
//! rust_labrad --device A --device B --setting read
//! RUST_LOG=rust_labrad=trace rust_labrad --config labrad.toml
//! ```

use anyhow::{Context as _, Result};
use clap::Parser;
use rust_labrad::config::LabradConfig;
use rust_labrad::logging::init_tracing;
use rust_labrad::servers::{PowerMeterServer, TestServer};
use rust_labrad::{Connection, Manager, StatefulDevice};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "rust_labrad", version, about = "Device-scoped LabRAD client demo")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Device to address (repeatable)
    #[arg(short, long = "device", default_values = ["A", "B"])]
    devices: Vec<String>,

    /// Setting to call on every device
    #[arg(short, long, default_value = "read")]
    setting: String,

    /// Log and print results as JSON lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => LabradConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => LabradConfig::load().context("loading configuration")?,
    };
    config.logging.json |= cli.json;
    init_tracing(&config.logging);

    let manager = Manager::start(config.manager.clone()).await?;
    manager.register(TestServer::new()).await?;
    manager
        .register(
            PowerMeterServer::new()
                .with_device("A", 0.002)
                .with_device("B", 0.005)
                .with_device("C", 0.0125),
        )
        .await?;

    let cxn = Connection::connect(&manager, &config.client).await?;
    info!(servers = ?cxn.servers().await?, "Servers available");

    let power_meter = cxn.server("power_meter").await?;
    let first = cli.devices.first().context("no device given")?;
    let mut meter = StatefulDevice::new(&power_meter, first.as_str())?;
    if !cli.json {
        println!("{}\n", meter);
    }

    for device in &cli.devices {
        meter.select_device(device.as_str());
        match meter.call(&cli.setting, ()).await {
            Ok(Some(value)) if cli.json => {
                println!("{}", serde_json::json!({ "device": device, "value": value }))
            }
            Ok(Some(value)) => println!("{:>8}: {}", device, value),
            Ok(None) => {
                warn!(setting = %cli.setting, "Power meter has no such setting");
                break;
            }
            Err(e) => println!("{:>8}: error: {}", device, e),
        }
    }

    cxn.disconnect().await;
    manager.shutdown().await;
    Ok(())
}
