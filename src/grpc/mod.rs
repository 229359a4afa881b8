/// gRPC surface for the device broker.
///
/// One RPC per protocol message: session open/close, device request and
/// release, liveness probes, inventory listing, enable/disable and type
/// info. The transport never blocks on availability; "no device" is an
/// empty reply the client polls on its own schedule.
///
/// # Example
/// ```no_run
/// use std::sync::Arc;
/// use board_broker::automation::MockAutomation;
/// use board_broker::grpc::start_server;
/// use board_broker::registry::DeviceRegistry;
/// use board_broker::service::AllocationService;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let service = Arc::new(AllocationService::new(
///         DeviceRegistry::new(),
///         Arc::new(MockAutomation::new()),
///     ));
///     let addr = "127.0.0.1:50051".parse()?;
///     start_server(addr, service).await?;
///     Ok(())
/// }
/// ```
pub mod server;

/// Protocol Buffer definitions for the broker service.
pub mod proto {
    //! Generated Protocol Buffer definitions from `proto/broker.proto`.

    tonic::include_proto!("broker");
}

pub use server::{start_server, BrokerService};

// Re-export commonly used proto types.
pub use proto::device_broker_client::DeviceBrokerClient;
pub use proto::device_broker_server::{DeviceBroker, DeviceBrokerServer};
pub use proto::{
    DeviceReply, DeviceRequest, EnableReply, EnableRequest, ListDevicesReply, ListDevicesRequest,
    LivenessReply, LivenessRequest, ReleaseReply, ReleaseRequest, SessionCloseReply,
    SessionCloseRequest, SessionReply, SessionRequest, TypeInfoReply, TypeInfoRequest,
};
