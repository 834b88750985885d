//! AJA PnP Daemon - Main entry point
//!
//! Lists attached AJA boards, then logs every hot-plug event until interrupted.

mod config;
mod report;

use aja_pnp_core::HotplugBackend;
#[cfg(unix)]
use aja_pnp_discovery::backends::DevfsBackend;
use aja_pnp_discovery::backends::SimulatedBus;
use aja_pnp_discovery::DeviceDiscoveryService;
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::config::{BackendKind, Config};

#[derive(Parser, Debug)]
#[command(name = "aja-pnp")]
#[command(about = "AJA device discovery and hot-plug monitor")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "aja-pnp.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// List attached devices and exit
    #[arg(long)]
    scan_once: bool,

    /// Print devices and events as JSON
    #[arg(long)]
    json: bool,

    /// Directory holding driver device nodes
    #[arg(long)]
    devfs_root: Option<PathBuf>,

    /// Write a default configuration file to --config and exit
    #[arg(long)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // Logs go to stderr so stdout carries only device output
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("AJA PnP v{}", env!("CARGO_PKG_VERSION"));

    if args.init_config {
        config::save_default_config(&args.config)?;
        info!(path = %args.config.display(), "Wrote default configuration");
        return Ok(());
    }

    // Load configuration
    let mut config = config::load_config(&args.config)?;
    if let Some(root) = args.devfs_root {
        config.discovery.devfs.root = root;
    }
    let json = args.json || config.daemon.json;

    info!(
        backend = ?config.daemon.backend,
        classes = ?config.discovery.driver_classes,
        dispatch = ?config.discovery.dispatch.mode,
        "Configuration loaded"
    );

    let service = Arc::new(DeviceDiscoveryService::new(
        build_backend(&config)?,
        config.discovery.clone(),
    ));
    // Subscribe before starting so devices found at start are reported too
    let mut events = service.events();

    let starter = service.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || starter.start()).await? {
        warn!(error = %e, "Device discovery did not start");
    }

    if args.scan_once {
        let lister = service.clone();
        let devices = tokio::task::spawn_blocking(move || lister.devices()).await?;
        print!("{}", report::format_devices(&devices, json)?);
        if json {
            println!();
        }
    } else {
        info!(armed = ?service.armed_classes(), "Watching for devices, press Ctrl-C to stop");
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted");
                    break;
                }
                notice = events.recv() => match notice {
                    Ok(notice) => println!("{}", report::format_notice(&notice, json)?),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event stream lagged, some notices were dropped");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    }

    let stopper = service.clone();
    tokio::task::spawn_blocking(move || stopper.shutdown()).await?;
    Ok(())
}

fn build_backend(config: &Config) -> Result<Arc<dyn HotplugBackend>> {
    match config.daemon.backend {
        BackendKind::Simulated => {
            warn!("Using the simulated backend, no hardware will be found");
            Ok(Arc::new(SimulatedBus::new()))
        }
        #[cfg(unix)]
        BackendKind::Devfs => Ok(Arc::new(DevfsBackend::from_config(&config.discovery.devfs))),
        #[cfg(not(unix))]
        BackendKind::Devfs => anyhow::bail!("the devfs backend is only available on unix hosts"),
    }
}
