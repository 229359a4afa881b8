//! Session bookkeeping for the lease protocol.
//!
//! A session is the client-visible grouping of leases: every serial a client
//! acquires is recorded under its session id, and closing the session drains
//! the whole list so the service can reclaim the boards as a unit. That bulk
//! reclaim is the crash-recovery path for clients that never got around to
//! releasing individually.
//!
//! Ids are fixed-length numeric strings. On the (unlikely) collision the
//! generator draws again instead of silently replacing an existing session's
//! lease list.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use tracing::debug;

use crate::error::BrokerError;

/// Number of digits in a session id.
const SESSION_ID_LEN: usize = 10;

/// Maps session ids to the serials leased under them.
pub struct SessionTable {
    sessions: HashMap<String, Vec<String>>,
    rng: StdRng,
}

impl SessionTable {
    /// Create an empty table with an entropy-seeded id generator.
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            rng: StdRng::from_entropy(),
        }
    }

    /// Create an empty table with a fixed RNG seed, for deterministic ids in
    /// tests.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            sessions: HashMap::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Open a new session and return its id.
    pub fn open(&mut self) -> String {
        loop {
            let id: String = (0..SESSION_ID_LEN)
                .map(|_| char::from(b'0' + self.rng.gen_range(0..10u8)))
                .collect();
            if !self.sessions.contains_key(&id) {
                debug!(session = %id, "session opened");
                self.sessions.insert(id.clone(), Vec::new());
                return id;
            }
        }
    }

    /// True when `session_id` is currently open.
    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Append `serial` to the session's lease list.
    ///
    /// # Errors
    /// `UnknownSession` when the session was never opened or is already
    /// closed.
    pub fn record_lease(&mut self, session_id: &str, serial: &str) -> Result<(), BrokerError> {
        match self.sessions.get_mut(session_id) {
            Some(serials) => {
                serials.push(serial.to_string());
                Ok(())
            }
            None => Err(BrokerError::UnknownSession(session_id.to_string())),
        }
    }

    /// Remove `serial` from the session's list after an individual release,
    /// keeping the table consistent with registry lease state.
    pub fn forget_lease(&mut self, serial: &str) {
        for serials in self.sessions.values_mut() {
            serials.retain(|s| s != serial);
        }
    }

    /// Close a session, returning every serial still recorded under it so
    /// the caller can release them against the registry.
    ///
    /// Closing an unknown or already-closed session yields an empty list; a
    /// double close is therefore a well-defined no-op.
    pub fn close(&mut self, session_id: &str) -> Vec<String> {
        match self.sessions.remove(session_id) {
            Some(serials) => {
                debug!(session = %session_id, leases = serials.len(), "session closed");
                serials
            }
            None => Vec::new(),
        }
    }

    /// Serials currently recorded under a session, if it is open.
    pub fn leases(&self, session_id: &str) -> Option<Vec<String>> {
        self.sessions.get(session_id).cloned()
    }

    /// Number of open sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// True when no session is open.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}
