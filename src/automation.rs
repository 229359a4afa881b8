//! Host automation: physically attaching, detaching and probing boards.
//!
//! The broker never touches USB plumbing itself. Everything physical goes
//! through the [`DeviceAutomation`] trait so the registry stays synchronous
//! and lock-friendly while subprocess work runs elsewhere:
//!
//! - `VboxAutomation` drives `VBoxManage` to capture boards into a
//!   VirtualBox reference VM and to enumerate what is visible on the host.
//! - `MockAutomation` is an in-memory stand-in for tests and `--dry-run`.
//!
//! Liveness is a point-in-time probe: re-enumerate host devices carrying the
//! board's vendor/product id and check serial membership. There is no
//! subscription or background polling here.

use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{AppResult, BrokerError};
use crate::registry::DeviceSnapshot;

/// Physical-world operations on one board, keyed by its snapshot identity.
#[async_trait]
pub trait DeviceAutomation: Send + Sync {
    /// Capture the board into the target VM. Idempotent: attaching a board
    /// that is already attached succeeds without side effects.
    async fn attach(&self, device: &DeviceSnapshot) -> AppResult<()>;

    /// Release the board from the target VM.
    async fn detach(&self, device: &DeviceSnapshot) -> AppResult<()>;

    /// Point-in-time probe: is a device with this serial currently visible
    /// among host devices matching the snapshot's vendor/product id?
    async fn is_alive(&self, device: &DeviceSnapshot) -> AppResult<bool>;
}

// =============================================================================
// VirtualBox implementation
// =============================================================================

/// One USB device block parsed from `VBoxManage list usbhost`.
#[derive(Debug, Clone, Default)]
struct UsbHostEntry {
    uuid: String,
    vendor_id: String,
    product_id: String,
    serial: String,
    captured: bool,
}

/// Automation backed by the `VBoxManage` command line tool.
///
/// Construct with [`VboxAutomation::for_host`] when only probing (the server
/// side), or [`VboxAutomation::for_vm`] with the path of a vagrant-managed
/// reference VM when attach/detach is needed (the client side).
pub struct VboxAutomation {
    machine_id: Option<String>,
}

impl VboxAutomation {
    /// Probe-only automation; attach/detach will fail.
    pub fn for_host() -> Self {
        Self { machine_id: None }
    }

    /// Automation targeting the VM whose id is stored under
    /// `<vm_path>/.vagrant/machines/default/virtualbox/id`.
    pub fn for_vm(vm_path: &Path) -> AppResult<Self> {
        let id_file: PathBuf = vm_path
            .join(".vagrant")
            .join("machines")
            .join("default")
            .join("virtualbox")
            .join("id");
        let machine_id = std::fs::read_to_string(&id_file)
            .map_err(|e| {
                BrokerError::Automation(format!(
                    "cannot read VM id from {}: {e}",
                    id_file.display()
                ))
            })?
            .trim()
            .to_string();
        Ok(Self {
            machine_id: Some(machine_id),
        })
    }

    fn machine_id(&self) -> AppResult<&str> {
        self.machine_id
            .as_deref()
            .ok_or_else(|| BrokerError::Automation("no target VM configured".into()))
    }

    async fn run_vboxmanage(args: &[&str]) -> AppResult<String> {
        let output = Command::new("VBoxManage").args(args).output().await?;
        if !output.status.success() {
            return Err(BrokerError::Automation(format!(
                "VBoxManage {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Enumerate host USB devices, filtered to the given vendor/product id.
    async fn scan_usb_host(&self, vendor_id: &str, product_id: &str) -> AppResult<Vec<UsbHostEntry>> {
        let output = Self::run_vboxmanage(&["list", "usbhost"]).await?;
        Ok(parse_usb_host(&output)
            .into_iter()
            .filter(|e| e.vendor_id == vendor_id && e.product_id == product_id)
            .collect())
    }

    /// Serials currently captured by the target VM.
    async fn vm_serials(&self) -> AppResult<Vec<String>> {
        let machine = self.machine_id()?;
        let output = Self::run_vboxmanage(&["showvminfo", machine]).await?;
        Ok(output
            .lines()
            .filter_map(|line| line.split_once(':'))
            .filter(|(key, _)| key.trim() == "SerialNumber")
            .map(|(_, value)| value.trim().to_string())
            .collect())
    }
}

#[async_trait]
impl DeviceAutomation for VboxAutomation {
    async fn attach(&self, device: &DeviceSnapshot) -> AppResult<()> {
        let machine = self.machine_id()?.to_string();

        // Already captured by the VM counts as success.
        if self.vm_serials().await?.iter().any(|s| s == &device.serial) {
            info!(serial = %device.serial, "already attached");
            return Ok(());
        }

        let entry = self
            .scan_usb_host(&device.vendor_id, &device.product_id)
            .await?
            .into_iter()
            .find(|e| e.serial == device.serial)
            .ok_or_else(|| {
                BrokerError::Automation(format!(
                    "device with serial {} not visible on host",
                    device.serial
                ))
            })?;

        if entry.captured {
            warn!(serial = %device.serial, "device is captured by another VM");
        }

        // Hold filter so the VM keeps the board across re-enumeration.
        Self::run_vboxmanage(&[
            "usbfilter",
            "add",
            "0",
            "--action",
            "hold",
            "--name",
            "test device",
            "--target",
            &machine,
            "--vendorid",
            &device.vendor_id,
            "--productid",
            &device.product_id,
            "--serialnumber",
            &device.serial,
        ])
        .await?;

        Self::run_vboxmanage(&["controlvm", &machine, "usbattach", &entry.uuid]).await?;
        info!(serial = %device.serial, vm = %machine, "board attached");
        Ok(())
    }

    async fn detach(&self, device: &DeviceSnapshot) -> AppResult<()> {
        let machine = self.machine_id()?.to_string();

        let entry = self
            .scan_usb_host(&device.vendor_id, &device.product_id)
            .await?
            .into_iter()
            .find(|e| e.serial == device.serial);

        match entry {
            Some(entry) => {
                Self::run_vboxmanage(&["controlvm", &machine, "usbdetach", &entry.uuid]).await?;
                info!(serial = %device.serial, vm = %machine, "board detached");
                Ok(())
            }
            None => {
                warn!(serial = %device.serial, "serial not found among host usb devices");
                Ok(())
            }
        }
    }

    async fn is_alive(&self, device: &DeviceSnapshot) -> AppResult<bool> {
        let visible = self
            .scan_usb_host(&device.vendor_id, &device.product_id)
            .await?;
        Ok(visible.iter().any(|e| e.serial == device.serial))
    }
}

/// Parse `VBoxManage list usbhost` output: blank-line separated blocks of
/// `Key: value` pairs. Blocks with a malformed vendor or product id are
/// skipped with a warning.
fn parse_usb_host(output: &str) -> Vec<UsbHostEntry> {
    // VendorId/ProductId lines look like "0x0483 (0483)".
    #[allow(clippy::unwrap_used)]
    let hex_re = Regex::new(r"0x([0-9A-Fa-f]{4})").unwrap();

    let mut entries = Vec::new();
    let mut block: HashMap<String, String> = HashMap::new();

    let mut flush = |block: &mut HashMap<String, String>| {
        if block.is_empty() {
            return;
        }
        let fields = std::mem::take(block);
        let vendor = fields.get("VendorId").and_then(|v| {
            hex_re
                .captures(v)
                .map(|c| c[1].to_lowercase())
        });
        let product = fields.get("ProductId").and_then(|v| {
            hex_re
                .captures(v)
                .map(|c| c[1].to_lowercase())
        });
        let (Some(vendor_id), Some(product_id)) = (vendor, product) else {
            debug!("skipping usb block with malformed vendor/product id");
            return;
        };
        entries.push(UsbHostEntry {
            uuid: fields.get("UUID").cloned().unwrap_or_default(),
            vendor_id,
            product_id,
            serial: fields.get("SerialNumber").cloned().unwrap_or_default(),
            captured: fields
                .get("Current State")
                .map(|s| s == "Captured")
                .unwrap_or(false),
        });
    };

    for line in output.lines() {
        if line.trim().is_empty() {
            flush(&mut block);
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            block.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    flush(&mut block);
    entries
}

// =============================================================================
// Mock implementation
// =============================================================================

/// In-memory automation for tests and dry runs.
///
/// Seed the visible set with the serials that should answer liveness probes;
/// attach/detach move serials into and out of the attached set. An injected
/// failure makes the next attach fail, for exercising the caller's
/// compensation path.
pub struct MockAutomation {
    state: Arc<RwLock<MockState>>,
}

#[derive(Default)]
struct MockState {
    visible: Vec<String>,
    attached: Vec<String>,
    fail_next_attach: bool,
}

impl MockAutomation {
    /// Mock with nothing visible on the host.
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(MockState::default())),
        }
    }

    /// Mock whose host sees the given serials.
    pub fn with_visible<I, S>(serials: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            state: Arc::new(RwLock::new(MockState {
                visible: serials.into_iter().map(Into::into).collect(),
                ..MockState::default()
            })),
        }
    }

    /// Make the next attach fail with an automation error.
    pub async fn fail_next_attach(&self) {
        self.state.write().await.fail_next_attach = true;
    }

    /// Serials currently attached via this mock.
    pub async fn attached(&self) -> Vec<String> {
        self.state.read().await.attached.clone()
    }
}

impl Default for MockAutomation {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceAutomation for MockAutomation {
    async fn attach(&self, device: &DeviceSnapshot) -> AppResult<()> {
        let mut state = self.state.write().await;
        if state.fail_next_attach {
            state.fail_next_attach = false;
            return Err(BrokerError::Automation("injected attach failure".into()));
        }
        if !state.visible.contains(&device.serial) {
            return Err(BrokerError::Automation(format!(
                "device with serial {} not visible on host",
                device.serial
            )));
        }
        if !state.attached.contains(&device.serial) {
            state.attached.push(device.serial.clone());
        }
        Ok(())
    }

    async fn detach(&self, device: &DeviceSnapshot) -> AppResult<()> {
        let mut state = self.state.write().await;
        state.attached.retain(|s| s != &device.serial);
        Ok(())
    }

    async fn is_alive(&self, device: &DeviceSnapshot) -> AppResult<bool> {
        Ok(self.state.read().await.visible.contains(&device.serial))
    }
}
