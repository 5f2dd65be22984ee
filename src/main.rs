//! Oppnet - opportunistic networking transport daemon

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use oppnet::common::InterfaceStore;
use oppnet::config::Config;
use oppnet::error::{Error, Result};
use oppnet::manager::{Notification, ProtocolManager};
use oppnet::metrics::init_metrics;

fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        print_version();
        return Ok(());
    }

    if args.gen_config {
        let json = serde_json::to_string_pretty(&Config::sample())
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        println!("{}", json);
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    // Initialize logging
    let log_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .or_else(|| config.log.level.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Config(format!("Failed to set tracing subscriber: {}", e)))?;

    if args.config.is_none() {
        info!("No config file specified, using defaults");
    }
    info!("Oppnet v{} starting...", env!("CARGO_PKG_VERSION"));

    init_metrics();
    std::fs::create_dir_all(&config.storage.path)?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(config))?;

    info!("Goodbye!");
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    let store = Arc::new(InterfaceStore::new());
    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
    let (manager, handle) = ProtocolManager::new(config.clone(), store.clone(), notify_tx);
    let task = manager.spawn();

    for iface in &config.interfaces {
        let local = iface.to_interface();
        store.add(local.clone(), iface.parent_id());
        handle.local_interface_up(local)?;
    }

    let mut stopping = false;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c(), if !stopping => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                }
                info!("Shutting down...");
                stopping = true;
                handle.prepare_shutdown()?;
                handle.shutdown()?;
            }
            notification = notify_rx.recv() => match notification {
                Some(Notification::ShutdownComplete) | None => break,
                Some(n) => log_notification(n),
            }
        }
    }

    task.await
        .map_err(|e| Error::Protocol(format!("Protocol manager failed: {}", e)))
}

fn log_notification(notification: Notification) {
    match notification {
        Notification::SendSuccess { envelope, target } => {
            info!("Sent [{}] to {}", envelope.id(), target);
        }
        Notification::SendFailure { envelope, target } => {
            warn!("Failed to send [{}] to {}", envelope.id(), target);
        }
        Notification::Received { envelope, source } => {
            info!("Received [{}] from {}", envelope.id(), source);
        }
        Notification::InterfaceUp(iface) => info!("Neighbor {} up", iface),
        Notification::InterfaceDown(iface) => info!("Neighbor {} down", iface),
        Notification::ShutdownComplete => {}
    }
}

struct Args {
    config: Option<PathBuf>,
    gen_config: bool,
    version: bool,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut config = None;
        let mut gen_config = false;
        let mut version = false;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "-c" | "--config" => {
                    if i + 1 < args.len() {
                        config = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--gen-config" => gen_config = true,
                "-v" | "--version" => version = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                arg if !arg.starts_with('-') && config.is_none() => {
                    config = Some(PathBuf::from(arg));
                }
                _ => {}
            }
            i += 1;
        }

        Self { config, gen_config, version }
    }
}

fn print_help() {
    println!(r#"Oppnet - opportunistic networking transport daemon

USAGE:
    oppnet [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to configuration file
    --gen-config            Print an example config
    -v, --version           Print version information
    -h, --help              Print help information

EXAMPLES:
    oppnet -c oppnet.json
    oppnet --gen-config > oppnet.json
"#);
}

fn print_version() {
    println!("Oppnet v{}", env!("CARGO_PKG_VERSION"));
    println!("Transport core of an opportunistic networking daemon");
}
