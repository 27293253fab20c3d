mod common;

use std::sync::Arc;

use futures::{StreamExt, stream};
use grpc_route::{
    ConsumerStrategy, Exchange, GrpcConfiguration, GrpcConsumer, GrpcProducer, LoopbackTransport,
    Route, RouteContext, RouteError,
};
use route_bridge::pingpong::{self, PingPongHandlers, PingRequest, PongResponse};
use tonic::{Code, Request, Status};

use common::init_test_logging;

/// A route that answers each inbound ping by calling the backend and writing
/// the pong straight onto the caller's observer.
fn proxy_route(context: &RouteContext, backend: Arc<GrpcProducer>) -> Arc<Route> {
    context.route("direct:proxy", move |exchange: Exchange| {
        let backend = Arc::clone(&backend);
        async move {
            let observer = exchange
                .response_observer()
                .cloned()
                .ok_or_else(|| Status::internal("missing response observer"))?;
            let ping: PingRequest = exchange.decode()?;

            let reply = backend
                .process(Exchange::from_message(&ping))
                .await
                .map_err(|e| RouteError::Failed(e.into_status()))?;
            let pong: PongResponse = reply.decode()?;
            observer
                .on_message(&pong)
                .map_err(|e| RouteError::Failed(e.into_status()))?;
            Ok(exchange)
        }
    })
}

fn front(transport: Arc<LoopbackTransport>) -> PingPongHandlers {
    let context = Arc::new(RouteContext::new());
    let backend = GrpcProducer::new(
        GrpcConfiguration::new().with_method(pingpong::PING_SYNC_SYNC),
        pingpong::descriptor(pingpong::PING_SYNC_SYNC).unwrap(),
        transport,
        Arc::clone(&context),
    )
    .unwrap();

    let route = proxy_route(&context, Arc::new(backend));
    let config = GrpcConfiguration::new()
        .with_consumer_strategy(ConsumerStrategy::Delegation)
        .with_route_controlled_stream_observer(true);
    PingPongHandlers::new(Arc::new(GrpcConsumer::new(config, route).unwrap()))
}

type Pings = stream::Iter<std::vec::IntoIter<Result<PingRequest, Status>>>;

fn pings(ids: std::ops::RangeInclusive<i32>) -> Request<Pings> {
    let pings: Vec<_> = ids
        .map(|id| Ok(PingRequest::new(id, format!("ping-{id}"))))
        .collect();
    Request::new(stream::iter(pings))
}

#[tokio::test]
async fn test_proxy_relays_each_ping_through_backend() {
    init_test_logging();
    let backend_context = RouteContext::new();
    let backend = GrpcConsumer::new(
        GrpcConfiguration::new().with_consumer_strategy(ConsumerStrategy::Aggregation),
        pingpong::echo_route(&backend_context, "direct:backend"),
    )
    .unwrap();
    let transport = Arc::new(LoopbackTransport::new());
    transport.bind(pingpong::SERVICE, Arc::new(backend));

    let handlers = front(transport);
    let replies: Vec<_> = handlers
        .ping_async_async(pings(1..=5))
        .unwrap()
        .into_inner()
        .collect()
        .await;

    let pongs: Vec<PongResponse> = replies.into_iter().map(|r| r.unwrap()).collect();
    assert_eq!(
        pongs.iter().map(|p| p.pong_id).collect::<Vec<_>>(),
        vec![1, 2, 3, 4, 5]
    );
    assert_eq!(pongs[0].pong_name, "ping-1PONG");
}

#[tokio::test]
async fn test_proxy_surfaces_backend_failure() {
    init_test_logging();
    // Nothing bound: every backend call is unimplemented.
    let handlers = front(Arc::new(LoopbackTransport::new()));

    let replies: Vec<_> = handlers
        .ping_async_async(pings(1..=3))
        .unwrap()
        .into_inner()
        .collect()
        .await;

    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].as_ref().unwrap_err().code(), Code::Unimplemented);
}
