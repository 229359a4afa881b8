//! CLI entry point for the board broker daemon.
//!
//! The broker loads its inventory from a read-only device table document,
//! optionally filters it against what is actually visible on the host, and
//! then serves the allocation protocol over gRPC until stopped.
//!
//! # Usage
//!
//! Serve a farm described by a device table:
//! ```bash
//! board_broker serve --table-file devices.json --port 50051
//! ```
//!
//! Serve the table verbatim without touching VirtualBox (for tests and
//! development machines without hardware):
//! ```bash
//! board_broker serve --table-file devices.json --dry-run
//! ```

use anyhow::{anyhow, Result};
use board_broker::automation::{DeviceAutomation, MockAutomation, VboxAutomation};
use board_broker::config::{DeviceTable, Settings};
use board_broker::service::{bootstrap_inventory, AllocationService};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "board_broker")]
#[command(about = "Allocation broker for a shared farm of embedded test boards", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the device table and serve the allocation protocol
    Serve {
        /// JSON document listing vendor/product ids and serials per board type
        #[arg(long)]
        table_file: PathBuf,

        /// gRPC port (overrides the settings file)
        #[arg(long)]
        port: Option<u16>,

        /// Log level (overrides the settings file)
        #[arg(long)]
        log_level: Option<String>,

        /// Register the table verbatim and mock out host automation
        #[arg(long, default_value_t = false)]
        dry_run: bool,

        /// Alternative settings file under config/
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            table_file,
            port,
            log_level,
            dry_run,
            config,
        } => serve(table_file, port, log_level, dry_run, config).await,
    }
}

async fn serve(
    table_file: PathBuf,
    port: Option<u16>,
    log_level: Option<String>,
    dry_run: bool,
    config: Option<String>,
) -> Result<()> {
    let settings = match Settings::new(config.as_deref()) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("settings not loaded ({err}), using built-in defaults");
            Settings {
                log_level: "info".to_string(),
                port: 50051,
            }
        }
    };
    let level = log_level.unwrap_or(settings.log_level);
    let port = port.unwrap_or(settings.port);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Inventory-load failure is the only fatal error after this point.
    let table = DeviceTable::load(&table_file)?;

    let automation: Arc<dyn DeviceAutomation> = if dry_run {
        let serials: Vec<String> = table
            .0
            .values()
            .flat_map(|entry| entry.instances.iter().cloned())
            .collect();
        Arc::new(MockAutomation::with_visible(serials))
    } else {
        Arc::new(VboxAutomation::for_host())
    };

    let registry = bootstrap_inventory(&table, automation.as_ref(), dry_run).await?;
    let service = Arc::new(AllocationService::new(registry, automation));

    match service.device_count().await {
        0 => info!("no boards visible at startup; serving an empty farm"),
        n => info!(boards = n, "inventory:\n{}", service.list_devices().await),
    }

    let addr = format!("[::]:{port}").parse()?;
    board_broker::grpc::start_server(addr, service)
        .await
        .map_err(|e| anyhow!("server error: {e}"))
}
