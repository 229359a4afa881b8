//! Configuration management: server settings and the device table document.
//!
//! Settings come from `config/<name>.toml` via the `config` crate; CLI flags
//! override them in `main`. The device table is the read-only JSON inventory
//! document, keyed by board type:
//!
//! ```json
//! {
//!   "nucleo_f746zg": {
//!     "vid_hex": "0483",
//!     "pid_hex": "374b",
//!     "instances": ["066DFF3", "066EFF4"]
//!   }
//! }
//! ```
//!
//! The broker never writes this document. A malformed table (including a key
//! outside the supported board set) fails the load, which is fatal at
//! startup only.

use config::Config;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{AppResult, BrokerError};
use crate::registry::{BoardType, DeviceRecord};

/// Server settings with `config/default.toml` defaults.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub log_level: String,
    pub port: u16,
}

impl Settings {
    /// Load `config/<config_name>.toml` (default: `config/default`).
    pub fn new(config_name: Option<&str>) -> AppResult<Self> {
        let config_path = format!("config/{}", config_name.unwrap_or("default"));
        let s = Config::builder()
            .add_source(config::File::with_name(&config_path))
            .build()
            .map_err(BrokerError::Config)?;

        s.try_deserialize().map_err(BrokerError::Config)
    }
}

/// One board type's entry in the device table document.
#[derive(Debug, Deserialize, Clone)]
pub struct TableEntry {
    pub vid_hex: String,
    pub pid_hex: String,
    pub instances: Vec<String>,
}

/// The parsed inventory document.
#[derive(Debug, Deserialize, Clone)]
pub struct DeviceTable(pub BTreeMap<BoardType, TableEntry>);

impl DeviceTable {
    /// Parse the JSON table at `path`.
    pub fn load(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| {
            BrokerError::Inventory(format!("malformed device table {}: {e}", path.display()))
        })
    }

    /// Expand the table into one record per listed serial.
    pub fn to_records(&self) -> Vec<DeviceRecord> {
        self.0
            .iter()
            .flat_map(|(board, entry)| {
                entry.instances.iter().map(|serial| {
                    DeviceRecord::new(*board, serial, &entry.vid_hex, &entry.pid_hex)
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const TABLE: &str = r#"{
        "nucleo_f746zg": {
            "vid_hex": "0483",
            "pid_hex": "374b",
            "instances": ["066DFF3", "066EFF4"]
        },
        "due": {
            "vid_hex": "2341",
            "pid_hex": "003d",
            "instances": ["DUE-1"]
        }
    }"#;

    fn write_table(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_table_and_expands_records() {
        let file = write_table(TABLE);
        let table = DeviceTable::load(file.path()).unwrap();
        let records = table.to_records();

        assert_eq!(records.len(), 3);
    }

    #[test]
    fn unknown_board_key_fails_the_load() {
        let file = write_table(r#"{"esp32": {"vid_hex": "1", "pid_hex": "2", "instances": []}}"#);
        let err = DeviceTable::load(file.path()).unwrap_err();
        assert!(matches!(err, BrokerError::Inventory(_)));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = DeviceTable::load(Path::new("/nonexistent/table.json")).unwrap_err();
        assert!(matches!(err, BrokerError::Io(_)));
    }
}
