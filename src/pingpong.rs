//! The ping/pong sample protocol and the routes that serve it.
//!
//! Messages are prost structs; on the wire they match:
//!
//! ```proto
//! package pingpong;
//! message PingRequest  { string ping_name = 1; int32 ping_id = 2; }
//! message PongResponse { string pong_name = 1; int32 pong_id = 2; }
//! service PingPong {
//!   rpc PingSyncSync   (PingRequest)        returns (PongResponse);
//!   rpc PingSyncAsync  (PingRequest)        returns (stream PongResponse);
//!   rpc PingAsyncSync  (stream PingRequest) returns (PongResponse);
//!   rpc PingAsyncAsync (stream PingRequest) returns (stream PongResponse);
//! }
//! ```

use std::sync::Arc;

use grpc_route::{
    Body, CallShape, ConsumerService, Exchange, GrpcConsumer, GrpcPath, MethodDescriptor,
    PathError, RouteContext, RouteError, TypedReplyStream,
};
use tonic::server::NamedService;
use tonic::{Request, Response, Status};

pub const SERVICE: &str = "pingpong.PingPong";

pub const PING_SYNC_SYNC: &str = "PingSyncSync";
pub const PING_SYNC_ASYNC: &str = "PingSyncAsync";
pub const PING_ASYNC_SYNC: &str = "PingAsyncSync";
pub const PING_ASYNC_ASYNC: &str = "PingAsyncAsync";

/// Suffix the echo route appends to every pong name.
pub const PONG_SUFFIX: &str = "PONG";

#[derive(Clone, PartialEq, prost::Message)]
pub struct PingRequest {
    #[prost(string, tag = "1")]
    pub ping_name: String,
    #[prost(int32, tag = "2")]
    pub ping_id: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PongResponse {
    #[prost(string, tag = "1")]
    pub pong_name: String,
    #[prost(int32, tag = "2")]
    pub pong_id: i32,
}

impl PingRequest {
    pub fn new(ping_id: i32, ping_name: impl Into<String>) -> Self {
        Self {
            ping_name: ping_name.into(),
            ping_id,
        }
    }
}

/// Every PingPong method with its declared shape.
pub const METHODS: [(&str, CallShape); 4] = [
    (PING_SYNC_SYNC, CallShape::UNARY),
    (PING_SYNC_ASYNC, CallShape::SERVER_STREAMING),
    (PING_ASYNC_SYNC, CallShape::CLIENT_STREAMING),
    (PING_ASYNC_ASYNC, CallShape::BIDI_STREAMING),
];

/// The declared shape of a PingPong method, if it is one.
pub fn shape_of(method: &str) -> Option<CallShape> {
    METHODS
        .iter()
        .find(|(name, _)| *name == method)
        .map(|(_, shape)| *shape)
}

/// Names the PingPong service on a tonic server.
#[derive(Debug, Clone, Copy)]
pub struct PingPong;

impl NamedService for PingPong {
    const NAME: &'static str = SERVICE;
}

/// The PingPong service, ready for `Server::builder().add_service(..)`.
pub fn server(consumer: Arc<GrpcConsumer>) -> ConsumerService<PingPong> {
    ConsumerService::new(consumer, METHODS)
}

pub fn descriptor(method: &str) -> Result<MethodDescriptor, PathError> {
    let shape = shape_of(method)
        .ok_or_else(|| PathError::Invalid(format!("unknown PingPong method '{method}'")))?;
    Ok(MethodDescriptor::new(GrpcPath::from_service(SERVICE, method)?, shape))
}

pub fn pong(ping: &PingRequest) -> PongResponse {
    PongResponse {
        pong_name: format!("{}{PONG_SUFFIX}", ping.ping_name),
        pong_id: ping.ping_id,
    }
}

/// Answer every ping in the exchange body with its pong, keeping order.
///
/// A single-message body gets a single-message reply. Bodies without pings
/// (terminal markers) pass through empty.
pub fn answer(exchange: Exchange) -> Result<Exchange, RouteError> {
    if let Body::Error(status) = exchange.body() {
        return Err(RouteError::Failed(status.clone()));
    }
    if exchange.body().is_empty() {
        return Ok(exchange);
    }

    if matches!(exchange.body(), Body::Message(_)) {
        let ping: PingRequest = exchange.decode()?;
        return Ok(exchange.with_message(&pong(&ping)));
    }

    let pongs: Vec<PongResponse> = exchange
        .decode_all::<PingRequest>()?
        .iter()
        .map(pong)
        .collect();
    Ok(exchange.with_messages(&pongs))
}

/// Register a route at `destination` that answers pings with pongs.
pub fn echo_route(context: &RouteContext, destination: &str) -> Arc<grpc_route::Route> {
    context.route(destination, |exchange: Exchange| async move { answer(exchange) })
}

/// Typed PingPong calls made in process against a consumer endpoint.
///
/// Nothing goes over the network; use [`server`] to expose the same
/// consumer to remote callers.
pub struct PingPongHandlers {
    consumer: Arc<GrpcConsumer>,
}

impl PingPongHandlers {
    pub fn new(consumer: Arc<GrpcConsumer>) -> Self {
        Self { consumer }
    }

    pub fn consumer(&self) -> &Arc<GrpcConsumer> {
        &self.consumer
    }

    pub async fn ping_sync_sync(
        &self,
        request: Request<PingRequest>,
    ) -> Result<Response<PongResponse>, Status> {
        self.consumer.unary(PING_SYNC_SYNC, request).await
    }

    pub fn ping_sync_async(
        &self,
        request: Request<PingRequest>,
    ) -> Result<Response<TypedReplyStream<PongResponse>>, Status> {
        self.consumer.server_streaming(PING_SYNC_ASYNC, request)
    }

    pub async fn ping_async_sync<S>(
        &self,
        request: Request<S>,
    ) -> Result<Response<PongResponse>, Status>
    where
        S: futures::Stream<Item = Result<PingRequest, Status>> + Send + 'static,
    {
        self.consumer.client_streaming(PING_ASYNC_SYNC, request).await
    }

    pub fn ping_async_async<S>(
        &self,
        request: Request<S>,
    ) -> Result<Response<TypedReplyStream<PongResponse>>, Status>
    where
        S: futures::Stream<Item = Result<PingRequest, Status>> + Send + 'static,
    {
        self.consumer.bidi_streaming(PING_ASYNC_ASYNC, request)
    }
}
