//! The allocation façade: registry + session table behind one guard.
//!
//! [`AllocationService`] implements the leasing protocol the wire surface
//! exposes. Both the device registry and the session table live inside a
//! single `tokio::sync::RwLock`; every mutating operation takes the write
//! guard, so allocate's select-then-mark and close's drain-then-release are
//! atomic with respect to each other. Two in-flight requests can never lease
//! the same board.
//!
//! Nothing here blocks on device availability, and no lock is held across an
//! automation call: liveness probes copy the identity they need under the
//! read guard, drop it, and then talk to the collaborator. Long-running
//! physical work can therefore never stall allocation traffic.

use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::automation::DeviceAutomation;
use crate::config::DeviceTable;
use crate::error::{AppResult, BrokerError};
use crate::registry::{BoardType, DeviceRecord, DeviceRegistry, DeviceSnapshot};
use crate::session::SessionTable;

/// Registry and session table, mutated only together.
struct BrokerState {
    registry: DeviceRegistry,
    sessions: SessionTable,
}

/// Request-handling façade composing the registry and the session table.
pub struct AllocationService {
    state: RwLock<BrokerState>,
    automation: Arc<dyn DeviceAutomation>,
}

impl AllocationService {
    /// Wrap a populated registry and a fresh session table.
    pub fn new(registry: DeviceRegistry, automation: Arc<dyn DeviceAutomation>) -> Self {
        Self {
            state: RwLock::new(BrokerState {
                registry,
                sessions: SessionTable::new(),
            }),
            automation,
        }
    }

    /// Open a new lease session.
    pub async fn open_session(&self) -> String {
        self.state.write().await.sessions.open()
    }

    /// Close a session, releasing every serial still leased under it.
    ///
    /// Returns whether the session existed. Closing twice, or closing a
    /// session whose serials were already individually released, is a safe
    /// no-op.
    pub async fn close_session(&self, session_id: &str) -> bool {
        let mut state = self.state.write().await;
        let existed = state.sessions.contains(session_id);
        for serial in state.sessions.close(session_id) {
            state.registry.release(&serial);
            info!(session = %session_id, serial = %serial, "lease reclaimed");
        }
        if !existed {
            warn!(session = %session_id, "close for unknown session ignored");
        }
        existed
    }

    /// Lease one eligible board of `board` to `requester` under
    /// `session_id`.
    ///
    /// `Ok(None)` means no eligible board right now; the caller retries on
    /// its own schedule, the broker never waits.
    ///
    /// # Errors
    /// `UnknownSession` when the session was never opened. Nothing is
    /// mutated in that case.
    pub async fn request_device(
        &self,
        board: BoardType,
        session_id: &str,
        requester: &str,
    ) -> AppResult<Option<DeviceSnapshot>> {
        let mut state = self.state.write().await;
        if !state.sessions.contains(session_id) {
            return Err(BrokerError::UnknownSession(session_id.to_string()));
        }
        match state.registry.allocate(board, requester) {
            Some(snapshot) => {
                state.sessions.record_lease(session_id, &snapshot.serial)?;
                info!(
                    serial = %snapshot.serial,
                    board = %board,
                    session = %session_id,
                    requester = %requester,
                    "board assigned"
                );
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    /// Release one board by serial and forget it from its session.
    /// Idempotent; unknown serials are logged and ignored.
    pub async fn release_device(&self, serial: &str) -> bool {
        let mut state = self.state.write().await;
        let found = state.registry.release(serial);
        state.sessions.forget_lease(serial);
        if !found {
            warn!(serial = %serial, "release for unknown serial ignored");
        }
        found
    }

    /// Enable or disable a board. Disable never evicts the current holder.
    pub async fn set_enabled(&self, serial: &str, enabled: bool) -> bool {
        self.state.write().await.registry.set_enabled(serial, enabled)
    }

    /// Point-in-time liveness probe, delegated entirely to automation.
    /// Never touches lease state.
    ///
    /// # Errors
    /// `UnknownBoard` when no record of the type exists (its vendor/product
    /// ids cannot be recovered); `Automation` when the probe itself fails.
    pub async fn is_alive(&self, board: BoardType, serial: &str) -> AppResult<bool> {
        // Copy identity under the read guard, probe after dropping it.
        let probe = {
            let state = self.state.read().await;
            let mut template = state
                .registry
                .find_by_board(board)
                .ok_or_else(|| BrokerError::UnknownBoard(board.to_string()))?;
            template.serial = serial.to_string();
            template
        };
        self.automation.is_alive(&probe).await
    }

    /// Tabular inventory snapshot for display/audit.
    pub async fn list_devices(&self) -> String {
        self.state.read().await.registry.render_table()
    }

    /// Value snapshots of every record, in listing order.
    pub async fn snapshots(&self) -> Vec<DeviceSnapshot> {
        self.state.read().await.registry.list_all()
    }

    /// Vendor/product ids for a board type, independent of current leases.
    pub async fn type_info(&self, board: BoardType) -> Option<DeviceSnapshot> {
        self.state.read().await.registry.find_by_board(board)
    }

    /// Serials currently recorded under a session, if it is open.
    pub async fn session_leases(&self, session_id: &str) -> Option<Vec<String>> {
        self.state.read().await.sessions.leases(session_id)
    }

    /// Number of registered boards.
    pub async fn device_count(&self) -> usize {
        self.state.read().await.registry.len()
    }
}

// =============================================================================
// Inventory bootstrap
// =============================================================================

/// Build the registry the service will own from the device table.
///
/// With `dry_run` the table is registered verbatim. Otherwise each listed
/// serial is probed through automation, one board type at a time, and only
/// devices actually visible on the host make it into the registry. A probe
/// failure here is fatal: a broker that cannot see its farm must not start.
pub async fn bootstrap_inventory(
    table: &DeviceTable,
    automation: &dyn DeviceAutomation,
    dry_run: bool,
) -> AppResult<DeviceRegistry> {
    let mut staged = DeviceRegistry::new();
    for record in table.to_records() {
        staged.register(record);
    }
    if dry_run {
        info!(devices = staged.len(), "dry run, registering table verbatim");
        return Ok(staged);
    }

    let all = staged.list_all();
    let mut live = DeviceRegistry::new();
    for representative in staged.boards_present() {
        let board = representative.board;
        for device in all.iter().filter(|d| d.board == board) {
            if automation.is_alive(device).await? {
                live.register(DeviceRecord::new(
                    device.board,
                    &device.serial,
                    &device.vendor_id,
                    &device.product_id,
                ));
            } else {
                warn!(serial = %device.serial, board = %board, "listed board not visible, skipping");
            }
        }
    }
    info!(devices = live.len(), "inventory loaded");
    Ok(live)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::MockAutomation;
    use std::path::Path;

    fn service_with(devices: &[(&str, BoardType)]) -> AllocationService {
        let mut registry = DeviceRegistry::with_seed(11);
        for (serial, board) in devices {
            registry.register(DeviceRecord::new(*board, *serial, "0483", "374b"));
        }
        AllocationService::new(registry, Arc::new(MockAutomation::new()))
    }

    #[tokio::test]
    async fn request_requires_open_session() {
        let service = service_with(&[("SN-A", BoardType::NucleoF746zg)]);
        let err = service
            .request_device(BoardType::NucleoF746zg, "0000000000", "u")
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::UnknownSession(_)));

        // Nothing was mutated by the rejected request.
        assert!(!service.snapshots().await[0].leased);
    }

    #[tokio::test]
    async fn lease_release_lease_again() {
        let service = service_with(&[("SN-A", BoardType::NucleoF746zg)]);
        let session = service.open_session().await;

        let snap = service
            .request_device(BoardType::NucleoF746zg, &session, "u")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snap.serial, "SN-A");

        assert!(service.release_device("SN-A").await);
        // Released serial is also gone from the session list.
        assert!(service.session_leases(&session).await.unwrap().is_empty());

        let again = service
            .request_device(BoardType::NucleoF746zg, &session, "u")
            .await
            .unwrap();
        assert!(again.is_some());
    }

    #[tokio::test]
    async fn close_session_reclaims_everything() {
        let service = service_with(&[
            ("SN-A", BoardType::NucleoF746zg),
            ("SN-B", BoardType::NucleoF746zg),
        ]);
        let session = service.open_session().await;

        for _ in 0..2 {
            service
                .request_device(BoardType::NucleoF746zg, &session, "u")
                .await
                .unwrap()
                .unwrap();
        }
        assert!(service
            .request_device(BoardType::NucleoF746zg, &session, "u")
            .await
            .unwrap()
            .is_none());

        assert!(service.close_session(&session).await);
        assert!(service.snapshots().await.iter().all(|d| !d.leased));

        // Double close: no error, no double release.
        assert!(!service.close_session(&session).await);

        let fresh = service.open_session().await;
        assert!(service
            .request_device(BoardType::NucleoF746zg, &fresh, "u")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn disable_blocks_allocation_without_evicting() {
        let service = service_with(&[("SN-A", BoardType::NucleoF746zg)]);
        let session = service.open_session().await;

        let snap = service
            .request_device(BoardType::NucleoF746zg, &session, "holder")
            .await
            .unwrap()
            .unwrap();
        assert!(service.set_enabled(&snap.serial, false).await);

        // Holder keeps the lease.
        let listed = &service.snapshots().await[0];
        assert!(listed.leased);
        assert_eq!(listed.holder.as_deref(), Some("holder"));

        // Released while disabled, the sole instance stays unavailable.
        service.release_device(&snap.serial).await;
        assert!(service
            .request_device(BoardType::NucleoF746zg, &session, "u")
            .await
            .unwrap()
            .is_none());

        service.set_enabled(&snap.serial, true).await;
        assert!(service
            .request_device(BoardType::NucleoF746zg, &session, "u")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn is_alive_uses_automation_and_registry_identity() {
        let mut registry = DeviceRegistry::with_seed(11);
        registry.register(DeviceRecord::new(BoardType::Due, "DUE-1", "2341", "003d"));
        let automation = Arc::new(MockAutomation::with_visible(["DUE-1"]));
        let service = AllocationService::new(registry, automation);

        assert!(service.is_alive(BoardType::Due, "DUE-1").await.unwrap());
        assert!(!service.is_alive(BoardType::Due, "DUE-9").await.unwrap());

        let err = service
            .is_alive(BoardType::Spresense, "X")
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::UnknownBoard(_)));
    }

    #[tokio::test]
    async fn bootstrap_filters_by_visibility() {
        let table = DeviceTable::load(Path::new("nonexistent")).err();
        assert!(table.is_some()); // sanity: loading bad paths errors

        let table: DeviceTable = serde_json::from_str(
            r#"{"due": {"vid_hex": "2341", "pid_hex": "003d",
                "instances": ["DUE-1", "DUE-2"]}}"#,
        )
        .unwrap();

        let automation = MockAutomation::with_visible(["DUE-2"]);
        let registry = bootstrap_inventory(&table, &automation, false).await.unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup_board("DUE-2").is_some());

        let registry = bootstrap_inventory(&table, &automation, true).await.unwrap();
        assert_eq!(registry.len(), 2);
    }
}
