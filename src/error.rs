//! Custom error types for the broker.
//!
//! `BrokerError` is the single error enum used throughout the library. The
//! variants follow the failure taxonomy of the allocation protocol:
//!
//! - **`Validation`**: a request is missing or carries malformed mandatory
//!   fields. Rejected synchronously, before any state mutation.
//! - **`UnknownSession`**: a lease was requested under a session id that was
//!   never opened (or has already been closed).
//! - **`UnknownBoard`**: a board type outside the supported set, or a type
//!   for which no record is registered when identity info is required.
//! - **`Automation`**: the external attach/detach collaborator failed, e.g.
//!   the device is physically absent. Propagated so the caller can
//!   compensate by releasing the just-acquired lease.
//! - **`Inventory`**: the device table document is malformed. Fatal at
//!   startup; never produced afterwards.
//! - **`Config`** / **`Io`**: ambient wrappers created via `#[from]` so `?`
//!   works against the underlying crates.
//!
//! "No device available" is deliberately NOT an error: allocation returns
//! `Option::None` and the wire layer encodes it as an empty reply.

use thiserror::Error;

/// Convenience alias for results using the broker error type.
pub type AppResult<T> = std::result::Result<T, BrokerError>;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Unknown board type: {0}")]
    UnknownBoard(String),

    #[error("Automation error: {0}")]
    Automation(String),

    #[error("Inventory error: {0}")]
    Inventory(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
