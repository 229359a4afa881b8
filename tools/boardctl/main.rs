//! Command line client for the board broker.
//!
//! Talks the allocation protocol against a running broker and drives the
//! VirtualBox side of an attach/detach locally. Waiting for an available
//! board is entirely a client concern: `--wait` retries with capped
//! exponential backoff and can be cancelled with ctrl-c at any point.
//!
//! # Usage
//!
//! ```bash
//! boardctl request --device nucleo_f746zg --wait
//! boardctl attach --device due --vm-path ~/vm/reference --artifact-path ./artifacts
//! boardctl detach --device due --vm-path ~/vm/reference --artifact-path ./artifacts
//! boardctl release --device due --serial DUE-1
//! boardctl query
//! boardctl query --disable DUE-1
//! ```

use anyhow::{anyhow, bail, Context, Result};
use board_broker::automation::{DeviceAutomation, VboxAutomation};
use board_broker::grpc::{
    DeviceBrokerClient, DeviceReply, DeviceRequest, EnableRequest, ListDevicesRequest,
    ReleaseRequest, SessionRequest, TypeInfoRequest,
};
use board_broker::registry::{BoardType, DeviceSnapshot};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tonic::transport::Channel;
use tracing::info;

type Client = DeviceBrokerClient<Channel>;

#[derive(Parser)]
#[command(name = "boardctl")]
#[command(about = "Client for the board allocation broker", long_about = None)]
struct Cli {
    /// Broker port on localhost
    #[arg(long, default_value = "50051")]
    port: u16,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Request a board lease from the broker
    Request {
        /// Board type to request
        #[arg(long)]
        device: String,

        /// Keep retrying (with backoff) until a board is available
        #[arg(long, default_value_t = false)]
        wait: bool,
    },

    /// Request a board and attach it to a reference VM
    Attach {
        /// Board type to request
        #[arg(long)]
        device: String,

        /// Path of the vagrant-managed reference VM
        #[arg(long)]
        vm_path: PathBuf,

        /// Keep retrying (with backoff) until a board is available
        #[arg(long, default_value_t = false)]
        wait: bool,

        /// Directory to store the leased-serial artifact in
        #[arg(long)]
        artifact_path: Option<PathBuf>,
    },

    /// Detach a board from the VM and release it at the broker
    Detach {
        /// Board type being returned
        #[arg(long)]
        device: String,

        /// Path of the vagrant-managed reference VM
        #[arg(long)]
        vm_path: PathBuf,

        /// Serial to detach (defaults to the artifact file)
        #[arg(long)]
        serial: Option<String>,

        /// Directory the leased-serial artifact was stored in
        #[arg(long)]
        artifact_path: Option<PathBuf>,
    },

    /// Release a board lease by serial
    Release {
        /// Board type being returned
        #[arg(long)]
        device: String,

        /// Serial to release
        #[arg(long)]
        serial: String,
    },

    /// Print the device table, or toggle a board's enablement
    Query {
        /// Enable a board by serial
        #[arg(long)]
        enable: Option<String>,

        /// Disable a board by serial
        #[arg(long)]
        disable: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut client = DeviceBrokerClient::connect(format!("http://localhost:{}", cli.port))
        .await
        .context("cannot reach the broker")?;

    match cli.command {
        Commands::Request { device, wait } => {
            let board: BoardType = device.parse().map_err(|e| anyhow!("{e}"))?;
            match request_with_wait(&mut client, board, wait).await? {
                Some(reply) => println!("Leased {} with S/N {}", board, reply.serial),
                None => println!("No {board} available."),
            }
        }

        Commands::Attach {
            device,
            vm_path,
            wait,
            artifact_path,
        } => {
            let board: BoardType = device.parse().map_err(|e| anyhow!("{e}"))?;
            attach(&mut client, board, &vm_path, wait, artifact_path.as_deref()).await?;
        }

        Commands::Detach {
            device,
            vm_path,
            serial,
            artifact_path,
        } => {
            let board: BoardType = device.parse().map_err(|e| anyhow!("{e}"))?;
            detach(&mut client, board, &vm_path, serial, artifact_path.as_deref()).await?;
        }

        Commands::Release { device, serial } => {
            let board: BoardType = device.parse().map_err(|e| anyhow!("{e}"))?;
            release(&mut client, board, &serial).await?;
            println!("Device {serial} released.");
        }

        Commands::Query { enable, disable } => {
            if enable.is_some() && disable.is_some() {
                bail!("--enable and --disable are mutually exclusive");
            }
            if let Some(serial) = enable {
                let reply = client
                    .enable_device(EnableRequest { serial })
                    .await?
                    .into_inner();
                println!("{}", reply.message);
            } else if let Some(serial) = disable {
                let reply = client
                    .disable_device(EnableRequest { serial })
                    .await?
                    .into_inner();
                println!("{}", reply.message);
            } else {
                let reply = client.list_devices(ListDevicesRequest {}).await?.into_inner();
                println!("{}", reply.table);
            }
        }
    }

    Ok(())
}

/// Requester identity recorded against the lease.
fn requester() -> String {
    let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("{user}@{host}")
}

/// Open a session and request one board, retrying with capped exponential
/// backoff when `wait` is set. Ctrl-c cancels the loop cleanly.
async fn request_with_wait(
    client: &mut Client,
    board: BoardType,
    wait: bool,
) -> Result<Option<DeviceReply>> {
    let session = client
        .open_session(SessionRequest {})
        .await?
        .into_inner()
        .session_id;

    let mut delay = Duration::from_secs(1);
    loop {
        let reply = client
            .request_device(DeviceRequest {
                board_type: board.to_string(),
                session_id: session.clone(),
                requester: requester(),
            })
            .await?
            .into_inner();

        if !reply.serial.is_empty() {
            return Ok(Some(reply));
        }
        if !wait {
            return Ok(None);
        }

        info!(board = %board, "no board available, retrying in {delay:?}");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => bail!("cancelled while waiting for a {board}"),
            _ = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(Duration::from_secs(30));
    }
}

async fn attach(
    client: &mut Client,
    board: BoardType,
    vm_path: &Path,
    wait: bool,
    artifact_path: Option<&Path>,
) -> Result<()> {
    let Some(reply) = request_with_wait(client, board, wait).await? else {
        println!("No {board} available.");
        return Ok(());
    };

    let device = snapshot_from_reply(board, &reply);
    let automation = VboxAutomation::for_vm(vm_path)?;
    if let Err(err) = automation.attach(&device).await {
        // Compensate: never leave the board stranded leased-but-unused.
        release(client, board, &device.serial).await?;
        return Err(anyhow!(err)).context("attach failed, lease released");
    }

    if let Some(dir) = artifact_path {
        std::fs::create_dir_all(dir)?;
        std::fs::write(artifact_file(dir, board), &device.serial)?;
    }
    println!("Device {} attached.", device.serial);
    Ok(())
}

async fn detach(
    client: &mut Client,
    board: BoardType,
    vm_path: &Path,
    serial: Option<String>,
    artifact_path: Option<&Path>,
) -> Result<()> {
    let artifact = artifact_path.map(|dir| artifact_file(dir, board));
    let serial = match (serial, &artifact) {
        (Some(serial), _) => serial,
        (None, Some(file)) => std::fs::read_to_string(file)
            .with_context(|| format!("cannot read artifact {}", file.display()))?
            .trim()
            .to_string(),
        (None, None) => bail!("either --serial or --artifact-path is required"),
    };

    // Recover vendor/product ids for the type independent of the lease.
    let info = client
        .get_type_info(TypeInfoRequest {
            board_type: board.to_string(),
        })
        .await?
        .into_inner();

    let device = DeviceSnapshot {
        board,
        serial: serial.clone(),
        vendor_id: info.vendor_id,
        product_id: info.product_id,
        leased: false,
        holder: None,
        enabled: true,
    };

    let automation = VboxAutomation::for_vm(vm_path)?;
    automation.detach(&device).await?;
    release(client, board, &serial).await?;

    if let Some(file) = artifact {
        if file.is_file() {
            std::fs::remove_file(file)?;
        }
    }
    println!("Device {serial} detached and released.");
    Ok(())
}

async fn release(client: &mut Client, board: BoardType, serial: &str) -> Result<()> {
    client
        .release_device(ReleaseRequest {
            board_type: board.to_string(),
            serial: serial.to_string(),
        })
        .await?;
    Ok(())
}

fn snapshot_from_reply(board: BoardType, reply: &DeviceReply) -> DeviceSnapshot {
    DeviceSnapshot {
        board,
        serial: reply.serial.clone(),
        vendor_id: reply.vendor_id.clone(),
        product_id: reply.product_id.clone(),
        leased: true,
        holder: None,
        enabled: true,
    }
}

fn artifact_file(dir: &Path, board: BoardType) -> PathBuf {
    dir.join(format!("serial_{board}.lease"))
}
