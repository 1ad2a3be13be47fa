//! CLI entry point for tem-daq
//!
//! Every device runs as its own process:
//! - `holder` serves one detector's settings
//! - `microscope` serves acquisition and mode introspection
//!
//! and a few client commands talk to them:
//! - `acquire` fetches one image from a microscope device
//! - `status` prints a device's state, attributes and (for a microscope) backend mode
//! - `set` writes one setting on a holder
//!
//! # Usage
//!
//! ```bash
//! tem-daq --config config/tem_daq.toml holder --kind haadf --listen 127.0.0.1:8888
//! tem-daq --config config/tem_daq.toml microscope
//! tem-daq acquire haadf --address 127.0.0.1:7000 --output frame.raw
//! ```

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tem_daq::config::{TemConfig, DEFAULT_CONFIG_PATH};
use tem_daq::detector::{normalize_kind, SettingValue, SettingsHolder};
use tem_daq::hardware::{HardwareBackend, VendorEndpoint};
use tem_daq::network::{DeviceHandler, DeviceProxy, DeviceServer};
use tem_daq::{tracing_config, AcquisitionOrchestrator, Microscope, ProxyRegistry, TransferUnit};
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "tem-daq")]
#[command(about = "Remote device control and image acquisition for a TEM", long_about = None)]
struct Cli {
    /// Configuration file (TOML). Missing files fall back to defaults.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve one detector's settings holder
    Holder {
        /// Detector kind (overrides holder.kind)
        #[arg(long)]
        kind: Option<String>,
        /// Listen address (overrides holder.listen)
        #[arg(long)]
        listen: Option<String>,
    },

    /// Serve the microscope device (acquisition orchestrator)
    Microscope {
        /// Listen address (overrides microscope.listen)
        #[arg(long)]
        listen: Option<String>,
    },

    /// Acquire one image from a running microscope device
    Acquire {
        /// Detector name, e.g. haadf
        detector: String,
        /// Microscope address (defaults to microscope.listen)
        #[arg(long)]
        address: Option<String>,
        /// Write the raw little-endian payload to this file
        #[arg(long)]
        output: Option<PathBuf>,
        /// Retry this many times when a settings holder is unreachable
        #[arg(long, default_value_t = 0)]
        retries: u32,
    },

    /// Print a device's state and attributes
    Status {
        /// Device address (defaults to microscope.listen)
        #[arg(long)]
        address: Option<String>,
    },

    /// Write one setting on a settings holder
    Set {
        /// Attribute name, e.g. image_width
        name: String,
        /// New value (JSON scalar, e.g. 512 or 2e-6)
        value: String,
        /// Holder address (defaults to holder.listen)
        #[arg(long)]
        address: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = TemConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate()?;
    tracing_config::init_from_config(&config).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Holder { kind, listen } => run_holder(&config, kind, listen).await,
        Commands::Microscope { listen } => run_microscope(&config, listen).await,
        Commands::Acquire {
            detector,
            address,
            output,
            retries,
        } => acquire_once(&config, &detector, address, output, retries).await,
        Commands::Status { address } => print_status(&config, address).await,
        Commands::Set {
            name,
            value,
            address,
        } => set_attribute(&config, &name, &value, address).await,
    }
}

async fn serve(config: &TemConfig, listen: &str, handler: Arc<dyn DeviceHandler>) -> Result<()> {
    let server = DeviceServer::bind(listen, handler)
        .await
        .with_context(|| format!("binding {listen}"))?
        .with_idle_timeout(config.server.idle_timeout);
    let handle = server.spawn()?;
    info!(addr = %handle.local_addr(), "Serving; press Ctrl+C to stop");

    signal::ctrl_c().await?;
    info!("Shutdown requested");
    handle.shutdown().await?;
    Ok(())
}

async fn run_holder(config: &TemConfig, kind: Option<String>, listen: Option<String>) -> Result<()> {
    let kind = normalize_kind(kind.as_deref().unwrap_or(&config.holder.kind));
    let listen = listen.unwrap_or_else(|| config.holder.listen.clone());
    info!(detector = %kind, "Starting settings holder");

    serve(config, &listen, Arc::new(SettingsHolder::new(&kind))).await
}

async fn run_microscope(config: &TemConfig, listen: Option<String>) -> Result<()> {
    let listen = listen.unwrap_or_else(|| config.microscope.listen.clone());
    info!(name = %config.application.name, "Starting microscope device");

    let endpoint = VendorEndpoint {
        host: config.microscope.vendor_host.clone(),
        port: config.microscope.vendor_port,
        connect_timeout: config.microscope.vendor_connect_timeout,
    };
    // No vendor client is linked into this build.
    let backend = HardwareBackend::select(None, &endpoint, config.simulation.seed).await;

    let registry = ProxyRegistry::new(config.detector_table(), config.proxy.clone())?;
    let orchestrator = Arc::new(AcquisitionOrchestrator::new(registry, backend));

    serve(config, &listen, Arc::new(Microscope::new(orchestrator))).await
}

fn proxy(config: &TemConfig, name: &str, address: &str) -> Result<DeviceProxy> {
    Ok(DeviceProxy::new(name, address)?
        .with_request_timeout(config.proxy.request_timeout)
        .with_acquire_timeout(config.proxy.acquire_timeout))
}

async fn acquire_once(
    config: &TemConfig,
    detector: &str,
    address: Option<String>,
    output: Option<PathBuf>,
    retries: u32,
) -> Result<()> {
    let address = address.unwrap_or_else(|| config.microscope.listen.clone());
    let microscope = proxy(config, "microscope", &address)?;
    microscope
        .wait_ready(config.proxy.connect_timeout, config.proxy.poll_interval)
        .await?;

    let mut attempt = 0;
    let value = loop {
        match microscope.acquire(detector).await {
            Ok(value) => break value,
            Err(e) if e.is_retriable() && attempt < retries => {
                attempt += 1;
                warn!(error = %e, attempt, retries, "Acquisition failed, retrying");
                tokio::time::sleep(config.proxy.poll_interval).await;
            }
            Err(e) => return Err(e.into()),
        }
    };

    let (metadata, payload) = TransferUnit::from_encoded_value(&value)?.into_parts();
    println!("{}", serde_json::to_string_pretty(&metadata)?);

    if let Some(path) = output {
        tokio::fs::write(&path, &payload)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        println!("Wrote {} bytes to {}", payload.len(), path.display());
    }
    Ok(())
}

async fn print_status(config: &TemConfig, address: Option<String>) -> Result<()> {
    let address = address.unwrap_or_else(|| config.microscope.listen.clone());
    let device = proxy(config, "device", &address)?;
    device
        .wait_ready(config.proxy.connect_timeout, config.proxy.poll_interval)
        .await?;

    println!("state: {}", device.state().await?.as_str());
    // Settings holders do not answer BackendMode.
    if let Ok(mode) = device.backend_mode().await {
        println!("backend: {mode}");
    }
    for spec in device.list_attributes().await? {
        let value = device.read_attribute(&spec.name).await?;
        println!("{} = {value} {}", spec.name, spec.unit);
    }
    Ok(())
}

async fn set_attribute(
    config: &TemConfig,
    name: &str,
    value: &str,
    address: Option<String>,
) -> Result<()> {
    let address = address.unwrap_or_else(|| config.holder.listen.clone());
    let value: SettingValue =
        serde_json::from_str(value).unwrap_or_else(|_| SettingValue::Text(value.to_string()));

    let holder = proxy(config, "holder", &address)?;
    holder.write_attribute(name, value).await?;
    println!("{name} = {}", holder.read_attribute(name).await?);
    Ok(())
}
