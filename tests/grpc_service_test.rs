//! Drives the gRPC service implementation directly with request values, the
//! way a transport worker would, covering the full protocol surface.

use board_broker::automation::MockAutomation;
use board_broker::grpc::{
    BrokerService, DeviceBroker, DeviceRequest, EnableRequest, ListDevicesRequest,
    LivenessRequest, ReleaseRequest, SessionCloseRequest, SessionRequest, TypeInfoRequest,
};
use board_broker::registry::{BoardType, DeviceRecord, DeviceRegistry};
use board_broker::service::AllocationService;
use std::sync::Arc;
use tonic::Request;

fn broker() -> BrokerService {
    let mut registry = DeviceRegistry::with_seed(21);
    registry.register(DeviceRecord::new(
        BoardType::NucleoF746zg,
        "066DFF3",
        "0483",
        "374b",
    ));
    registry.register(DeviceRecord::new(
        BoardType::NucleoF746zg,
        "066EFF4",
        "0483",
        "374b",
    ));
    registry.register(DeviceRecord::new(BoardType::Due, "DUE-1", "2341", "003d"));

    let automation = Arc::new(MockAutomation::with_visible(["066DFF3", "DUE-1"]));
    BrokerService::new(Arc::new(AllocationService::new(registry, automation)))
}

async fn open_session(broker: &BrokerService) -> String {
    broker
        .open_session(Request::new(SessionRequest {}))
        .await
        .unwrap()
        .into_inner()
        .session_id
}

#[tokio::test]
async fn session_ids_are_fixed_length_numeric() {
    let broker = broker();
    let id = open_session(&broker).await;
    assert_eq!(id.len(), 10);
    assert!(id.chars().all(|c| c.is_ascii_digit()));
}

#[tokio::test]
async fn full_lease_lifecycle_over_the_wire_types() {
    let broker = broker();
    let session = open_session(&broker).await;

    // Drain the nucleo pool.
    let mut serials = Vec::new();
    for _ in 0..2 {
        let reply = broker
            .request_device(Request::new(DeviceRequest {
                board_type: "nucleo_f746zg".into(),
                session_id: session.clone(),
                requester: "ci@runner".into(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(!reply.serial.is_empty());
        serials.push(reply.serial);
    }
    serials.sort();
    assert_eq!(serials, vec!["066DFF3", "066EFF4"]);

    // Third request of the type: empty reply.
    let empty = broker
        .request_device(Request::new(DeviceRequest {
            board_type: "nucleo_f746zg".into(),
            session_id: session.clone(),
            requester: "ci@runner".into(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(empty.serial.is_empty());

    // The other type is unaffected.
    let due = broker
        .request_device(Request::new(DeviceRequest {
            board_type: "due".into(),
            session_id: session.clone(),
            requester: "ci@runner".into(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(due.serial, "DUE-1");

    // Close reclaims all three at once.
    let closed = broker
        .close_session(Request::new(SessionCloseRequest {
            session_id: session,
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(closed.closed);

    let fresh = open_session(&broker).await;
    let reply = broker
        .request_device(Request::new(DeviceRequest {
            board_type: "due".into(),
            session_id: fresh,
            requester: "ci@runner".into(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(reply.serial, "DUE-1");
}

#[tokio::test]
async fn release_of_unknown_serial_is_a_non_fatal_no_op() {
    let broker = broker();

    let reply = broker
        .release_device(Request::new(ReleaseRequest {
            board_type: "due".into(),
            serial: "never-registered".into(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(!reply.released);

    // The broker still serves requests afterwards.
    let session = open_session(&broker).await;
    let reply = broker
        .request_device(Request::new(DeviceRequest {
            board_type: "due".into(),
            session_id: session,
            requester: "u".into(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(reply.serial, "DUE-1");
}

#[tokio::test]
async fn liveness_probe_reflects_host_visibility() {
    let broker = broker();

    let alive = broker
        .is_alive(Request::new(LivenessRequest {
            board_type: "nucleo_f746zg".into(),
            serial: "066DFF3".into(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(alive.is_alive);

    // Listed in the registry but not visible on the host.
    let gone = broker
        .is_alive(Request::new(LivenessRequest {
            board_type: "nucleo_f746zg".into(),
            serial: "066EFF4".into(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(!gone.is_alive);

    // A type with no registered record cannot be probed.
    let status = broker
        .is_alive(Request::new(LivenessRequest {
            board_type: "spresense".into(),
            serial: "X".into(),
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::NotFound);
}

#[tokio::test]
async fn queries_do_not_mutate_lease_state() {
    let broker = broker();
    let session = open_session(&broker).await;

    broker
        .request_device(Request::new(DeviceRequest {
            board_type: "due".into(),
            session_id: session,
            requester: "holder".into(),
        }))
        .await
        .unwrap();

    for _ in 0..3 {
        broker
            .list_devices(Request::new(ListDevicesRequest {}))
            .await
            .unwrap();
        broker
            .get_type_info(Request::new(TypeInfoRequest {
                board_type: "due".into(),
            }))
            .await
            .unwrap();
        broker
            .is_alive(Request::new(LivenessRequest {
                board_type: "due".into(),
                serial: "DUE-1".into(),
            }))
            .await
            .unwrap();
    }

    let table = broker
        .list_devices(Request::new(ListDevicesRequest {}))
        .await
        .unwrap()
        .into_inner()
        .table;
    let due_line = table.lines().find(|l| l.contains("DUE-1")).unwrap();
    assert!(due_line.contains("holder"), "lease survived the queries");
}

#[tokio::test]
async fn disable_is_observed_on_the_next_request() {
    let broker = broker();

    let reply = broker
        .disable_device(Request::new(EnableRequest {
            serial: "DUE-1".into(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(reply.found);

    let session = open_session(&broker).await;
    let empty = broker
        .request_device(Request::new(DeviceRequest {
            board_type: "due".into(),
            session_id: session.clone(),
            requester: "u".into(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(empty.serial.is_empty());

    broker
        .enable_device(Request::new(EnableRequest {
            serial: "DUE-1".into(),
        }))
        .await
        .unwrap();

    let reply = broker
        .request_device(Request::new(DeviceRequest {
            board_type: "due".into(),
            session_id: session,
            requester: "u".into(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(reply.serial, "DUE-1");
}
