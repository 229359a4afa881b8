//! DeviceBroker gRPC service implementation.
//!
//! A thin adapter over [`AllocationService`]: mandatory fields are validated
//! here, before any state mutation, and broker errors are mapped onto gRPC
//! status codes. Lease arbitration itself lives entirely in the service; a
//! single bad request can never abort the process.

use crate::grpc::proto::device_broker_server::{DeviceBroker, DeviceBrokerServer};
use crate::grpc::proto::{
    DeviceReply, DeviceRequest, EnableReply, EnableRequest, ListDevicesReply, ListDevicesRequest,
    LivenessReply, LivenessRequest, ReleaseReply, ReleaseRequest, SessionCloseReply,
    SessionCloseRequest, SessionReply, SessionRequest, TypeInfoReply, TypeInfoRequest,
};
use crate::error::BrokerError;
use crate::registry::BoardType;
use crate::service::AllocationService;
use std::sync::Arc;
use tonic::{transport::Server, Request, Response, Status};
use tracing::info;

/// Concurrent in-flight requests allowed per client connection.
const WORKER_LIMIT: usize = 10;

/// gRPC adapter around the allocation service.
pub struct BrokerService {
    service: Arc<AllocationService>,
}

impl BrokerService {
    /// Wrap an allocation service for serving.
    pub fn new(service: Arc<AllocationService>) -> Self {
        Self { service }
    }
}

/// Reject empty mandatory fields before anything is mutated.
fn require<'a>(value: &'a str, field: &str) -> Result<&'a str, Status> {
    if value.is_empty() {
        Err(Status::invalid_argument(format!(
            "missing mandatory field: {field}"
        )))
    } else {
        Ok(value)
    }
}

fn parse_board(value: &str) -> Result<BoardType, Status> {
    value
        .parse()
        .map_err(|_| Status::not_found(format!("unknown board type: {value}")))
}

fn map_error(err: BrokerError) -> Status {
    match err {
        BrokerError::Validation(msg) => Status::invalid_argument(msg),
        BrokerError::UnknownSession(id) => Status::not_found(format!("unknown session: {id}")),
        BrokerError::UnknownBoard(board) => Status::not_found(format!("unknown board type: {board}")),
        BrokerError::Automation(msg) => Status::internal(msg),
        other => Status::internal(other.to_string()),
    }
}

#[tonic::async_trait]
impl DeviceBroker for BrokerService {
    async fn open_session(
        &self,
        _request: Request<SessionRequest>,
    ) -> Result<Response<SessionReply>, Status> {
        let session_id = self.service.open_session().await;
        Ok(Response::new(SessionReply { session_id }))
    }

    async fn close_session(
        &self,
        request: Request<SessionCloseRequest>,
    ) -> Result<Response<SessionCloseReply>, Status> {
        let req = request.into_inner();
        require(&req.session_id, "session_id")?;

        let closed = self.service.close_session(&req.session_id).await;
        Ok(Response::new(SessionCloseReply {
            session_id: req.session_id,
            closed,
        }))
    }

    async fn request_device(
        &self,
        request: Request<DeviceRequest>,
    ) -> Result<Response<DeviceReply>, Status> {
        let req = request.into_inner();
        let board = parse_board(require(&req.board_type, "board_type")?)?;
        require(&req.session_id, "session_id")?;
        require(&req.requester, "requester")?;

        let assigned = self
            .service
            .request_device(board, &req.session_id, &req.requester)
            .await
            .map_err(map_error)?;

        // An all-empty reply encodes "nothing available right now".
        Ok(Response::new(match assigned {
            Some(device) => DeviceReply {
                serial: device.serial,
                vendor_id: device.vendor_id,
                product_id: device.product_id,
            },
            None => DeviceReply::default(),
        }))
    }

    async fn release_device(
        &self,
        request: Request<ReleaseRequest>,
    ) -> Result<Response<ReleaseReply>, Status> {
        let req = request.into_inner();
        require(&req.board_type, "board_type")?;
        require(&req.serial, "serial")?;

        let released = self.service.release_device(&req.serial).await;
        Ok(Response::new(ReleaseReply { released }))
    }

    async fn is_alive(
        &self,
        request: Request<LivenessRequest>,
    ) -> Result<Response<LivenessReply>, Status> {
        let req = request.into_inner();
        let board = parse_board(require(&req.board_type, "board_type")?)?;
        require(&req.serial, "serial")?;

        let is_alive = self
            .service
            .is_alive(board, &req.serial)
            .await
            .map_err(map_error)?;
        Ok(Response::new(LivenessReply { is_alive }))
    }

    async fn list_devices(
        &self,
        _request: Request<ListDevicesRequest>,
    ) -> Result<Response<ListDevicesReply>, Status> {
        let table = self.service.list_devices().await;
        Ok(Response::new(ListDevicesReply { table }))
    }

    async fn enable_device(
        &self,
        request: Request<EnableRequest>,
    ) -> Result<Response<EnableReply>, Status> {
        let req = request.into_inner();
        require(&req.serial, "serial")?;

        let found = self.service.set_enabled(&req.serial, true).await;
        Ok(Response::new(EnableReply {
            found,
            message: enable_message("Enable", found),
        }))
    }

    async fn disable_device(
        &self,
        request: Request<EnableRequest>,
    ) -> Result<Response<EnableReply>, Status> {
        let req = request.into_inner();
        require(&req.serial, "serial")?;

        let found = self.service.set_enabled(&req.serial, false).await;
        Ok(Response::new(EnableReply {
            found,
            message: enable_message("Disable", found),
        }))
    }

    async fn get_type_info(
        &self,
        request: Request<TypeInfoRequest>,
    ) -> Result<Response<TypeInfoReply>, Status> {
        let req = request.into_inner();
        let board = parse_board(require(&req.board_type, "board_type")?)?;

        match self.service.type_info(board).await {
            Some(device) => Ok(Response::new(TypeInfoReply {
                vendor_id: device.vendor_id,
                product_id: device.product_id,
            })),
            None => Err(Status::not_found(format!(
                "no registered device of type {board}"
            ))),
        }
    }
}

fn enable_message(action: &str, found: bool) -> String {
    if found {
        format!("{action} success.")
    } else {
        format!("{action} failed: serial not found.")
    }
}

/// Serve the broker until the process is stopped.
///
/// In-flight requests per connection are bounded; the registry lock keeps
/// every mutation serialized regardless of how many workers are active.
pub async fn start_server(
    addr: std::net::SocketAddr,
    service: Arc<AllocationService>,
) -> Result<(), Box<dyn std::error::Error>> {
    info!(%addr, "device broker listening");

    Server::builder()
        .concurrency_limit_per_connection(WORKER_LIMIT)
        .add_service(DeviceBrokerServer::new(BrokerService::new(service)))
        .serve(addr)
        .await?;

    Ok(())
}
