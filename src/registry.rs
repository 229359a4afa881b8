//! Device registry: the inventory of embedded test boards and their lease
//! state.
//!
//! The registry owns every [`DeviceRecord`] for the lifetime of the process.
//! Records are created once at bootstrap and never destroyed; the only
//! mutations are allocate, release and enable/disable, and all of them go
//! through registry methods. Every read that crosses the registry boundary
//! returns a [`DeviceSnapshot`], an owned value copy, so callers can never
//! alias live state.
//!
//! Allocation picks uniformly at random among eligible candidates instead of
//! first-fit. This spreads wear across identical boards and keeps rarely
//! used units from going stale. The RNG is owned by the registry and can be
//! seeded ([`DeviceRegistry::with_seed`]) so tests can pin the draw.
//!
//! The registry itself is not synchronized; [`crate::service`] wraps it,
//! together with the session table, behind a single guard.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::error::BrokerError;

// =============================================================================
// Board Types
// =============================================================================

/// The closed set of board models the farm knows how to host.
///
/// Wire messages and the device table document carry these as their
/// lowercase snake_case names (e.g. `nucleo_f746zg`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoardType {
    /// ST Nucleo-F746ZG
    NucleoF746zg,
    /// ST STM32F746G Discovery kit
    Stm32f746gDisco,
    /// Nordic nRF5340 DK (application core)
    Nrf5340dkNrf5340Cpuapp,
    /// ST Nucleo-L4R5ZI
    NucleoL4r5zi,
    /// Arduino Nano 33 BLE
    Nano33ble,
    /// Arduino Due
    Due,
    /// Sony Spresense
    Spresense,
}

impl BoardType {
    /// All supported board types, in declaration order.
    pub const ALL: [BoardType; 7] = [
        BoardType::NucleoF746zg,
        BoardType::Stm32f746gDisco,
        BoardType::Nrf5340dkNrf5340Cpuapp,
        BoardType::NucleoL4r5zi,
        BoardType::Nano33ble,
        BoardType::Due,
        BoardType::Spresense,
    ];

    /// Canonical wire/table name for this board type.
    pub fn as_str(&self) -> &'static str {
        match self {
            BoardType::NucleoF746zg => "nucleo_f746zg",
            BoardType::Stm32f746gDisco => "stm32f746g_disco",
            BoardType::Nrf5340dkNrf5340Cpuapp => "nrf5340dk_nrf5340_cpuapp",
            BoardType::NucleoL4r5zi => "nucleo_l4r5zi",
            BoardType::Nano33ble => "nano33ble",
            BoardType::Due => "due",
            BoardType::Spresense => "spresense",
        }
    }
}

impl fmt::Display for BoardType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BoardType {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BoardType::ALL
            .iter()
            .find(|b| b.as_str() == s)
            .copied()
            .ok_or_else(|| BrokerError::UnknownBoard(s.to_string()))
    }
}

// =============================================================================
// Device Records and Snapshots
// =============================================================================

/// One physical board: fixed identity plus lease/enable state.
///
/// Fields are private; outside this module the only way to observe a record
/// is a [`DeviceSnapshot`] and the only way to mutate one is a
/// [`DeviceRegistry`] method.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    board: BoardType,
    serial: String,
    vendor_id: String,
    product_id: String,
    leased: bool,
    holder: Option<String>,
    enabled: bool,
}

impl DeviceRecord {
    /// Create an unleased, enabled record. Identity is immutable afterwards.
    pub fn new(
        board: BoardType,
        serial: impl Into<String>,
        vendor_id: impl Into<String>,
        product_id: impl Into<String>,
    ) -> Self {
        Self {
            board,
            serial: serial.into(),
            vendor_id: vendor_id.into(),
            product_id: product_id.into(),
            leased: false,
            holder: None,
            enabled: true,
        }
    }

    fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            board: self.board,
            serial: self.serial.clone(),
            vendor_id: self.vendor_id.clone(),
            product_id: self.product_id.clone(),
            leased: self.leased,
            holder: self.holder.clone(),
            enabled: self.enabled,
        }
    }
}

/// Immutable value copy of a record, returned by every boundary-crossing
/// read. Carries everything automation needs to find the physical device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSnapshot {
    /// Board model
    pub board: BoardType,
    /// Unique serial number
    pub serial: String,
    /// USB vendor id, lowercase hex
    pub vendor_id: String,
    /// USB product id, lowercase hex
    pub product_id: String,
    /// Whether the board was leased when the snapshot was taken
    pub leased: bool,
    /// Identity the lease was recorded for, when leased
    pub holder: Option<String>,
    /// Whether the board was allocatable (administrative toggle)
    pub enabled: bool,
}

// =============================================================================
// Device Registry
// =============================================================================

/// Central inventory of boards, keyed by serial.
pub struct DeviceRegistry {
    devices: HashMap<String, DeviceRecord>,
    rng: StdRng,
}

impl DeviceRegistry {
    /// Create an empty registry with an entropy-seeded RNG.
    pub fn new() -> Self {
        Self {
            devices: HashMap::new(),
            rng: StdRng::from_entropy(),
        }
    }

    /// Create an empty registry with a fixed RNG seed, for deterministic
    /// allocation order in tests.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            devices: HashMap::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Add a record to the inventory.
    ///
    /// A duplicate serial is a silent no-op rather than an error, so that
    /// repeated inventory scans can re-register everything they see.
    pub fn register(&mut self, record: DeviceRecord) {
        if self.devices.contains_key(&record.serial) {
            debug!(serial = %record.serial, "duplicate registration ignored");
            return;
        }
        self.devices.insert(record.serial.clone(), record);
    }

    /// Lease one eligible board of the given type to `requester`.
    ///
    /// Eligible means: matching type, not leased, enabled. When several
    /// candidates qualify the pick is uniformly random among them. Returns
    /// `None` when no candidate exists; that is a normal outcome, not an
    /// error, and the registry never waits for availability.
    pub fn allocate(&mut self, board: BoardType, requester: &str) -> Option<DeviceSnapshot> {
        let mut candidates: Vec<&str> = self
            .devices
            .values()
            .filter(|d| d.board == board && !d.leased && d.enabled)
            .map(|d| d.serial.as_str())
            .collect();
        if candidates.is_empty() {
            return None;
        }
        // Stable candidate order so a seeded RNG yields a reproducible draw.
        candidates.sort_unstable();

        let pick = candidates[self.rng.gen_range(0..candidates.len())].to_string();
        let record = self.devices.get_mut(&pick)?;
        record.leased = true;
        record.holder = Some(requester.to_string());
        debug!(serial = %record.serial, board = %board, holder = %requester, "board leased");
        Some(record.snapshot())
    }

    /// Clear the lease on `serial`. Idempotent; releasing an unleased board
    /// is a no-op. Returns false when the serial is not in the inventory.
    pub fn release(&mut self, serial: &str) -> bool {
        match self.devices.get_mut(serial) {
            Some(record) => {
                record.leased = false;
                record.holder = None;
                debug!(serial = %serial, "board released");
                true
            }
            None => false,
        }
    }

    /// Enable or disable a board. Returns whether a match was found.
    ///
    /// Disabling never evicts the current holder; it only blocks future
    /// allocations, observed on the next call.
    pub fn set_enabled(&mut self, serial: &str, enabled: bool) -> bool {
        match self.devices.get_mut(serial) {
            Some(record) => {
                record.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Snapshot of the whole inventory, ordered by board type then serial,
    /// both case-insensitive, for display and audit.
    pub fn list_all(&self) -> Vec<DeviceSnapshot> {
        let mut all: Vec<DeviceSnapshot> = self.devices.values().map(|d| d.snapshot()).collect();
        all.sort_by(|a, b| {
            let key_a = (a.board.as_str(), a.serial.to_lowercase());
            let key_b = (b.board.as_str(), b.serial.to_lowercase());
            key_a.cmp(&key_b)
        });
        all
    }

    /// Board type registered under `serial`, if any.
    pub fn lookup_board(&self, serial: &str) -> Option<BoardType> {
        self.devices.get(serial).map(|d| d.board)
    }

    /// One representative snapshot per distinct board type present.
    /// Discovery uses this to know which types to probe.
    pub fn boards_present(&self) -> Vec<DeviceSnapshot> {
        let mut seen: Vec<BoardType> = Vec::new();
        let mut reps = Vec::new();
        for device in self.list_all() {
            if !seen.contains(&device.board) {
                seen.push(device.board);
                reps.push(device);
            }
        }
        reps
    }

    /// Any record of the given type, regardless of lease/enable state.
    /// Recovers vendor/product ids for a type independent of current leases.
    pub fn find_by_board(&self, board: BoardType) -> Option<DeviceSnapshot> {
        self.devices
            .values()
            .find(|d| d.board == board)
            .map(|d| d.snapshot())
    }

    /// Number of registered boards.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// True when the inventory is empty.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Render the inventory as an aligned text table in [`list_all`] order.
    ///
    /// [`list_all`]: DeviceRegistry::list_all
    pub fn render_table(&self) -> String {
        const HEADERS: [&str; 6] = ["#", "Type", "Serial", "Available", "Holder", "Enabled"];

        let mut rows: Vec<Vec<String>> = vec![HEADERS.iter().map(|h| h.to_string()).collect()];
        for (i, d) in self.list_all().iter().enumerate() {
            rows.push(vec![
                i.to_string(),
                d.board.to_string(),
                d.serial.clone(),
                (!d.leased).to_string(),
                d.holder.clone().unwrap_or_else(|| "-".to_string()),
                d.enabled.to_string(),
            ]);
        }

        let mut widths = [0usize; 6];
        for row in &rows {
            for (w, cell) in widths.iter_mut().zip(row.iter()) {
                *w = (*w).max(cell.len());
            }
        }

        let format_row = |row: &[String]| -> String {
            let line = row
                .iter()
                .zip(widths.iter().copied())
                .map(|(cell, w)| format!("{cell:<w$}"))
                .collect::<Vec<_>>()
                .join("  ");
            line.trim_end().to_string()
        };

        let separator: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
        rows.insert(1, separator);

        rows.iter().map(|r| format_row(r)).collect::<Vec<_>>().join("\n")
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
