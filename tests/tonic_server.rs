mod common;

use std::sync::Arc;
use std::time::Duration;

use grpc_route::{
    Body, CallShape, ChannelTransport, ConsumerStrategy, EventType, Exchange, GrpcConfiguration,
    GrpcConsumer, GrpcProducer, MethodDescriptor, ProducerStrategy, RouteContext,
};
use route_bridge::pingpong::{self, PingRequest, PongResponse};
use tokio::net::TcpListener;
use tonic::Code;
use tonic::transport::Server;
use tonic::transport::server::TcpIncoming;

use common::{RecordingRoute, eventually, init_test_logging};

const REPLIES: &str = "direct:replies";
const WAIT: Duration = Duration::from_secs(5);

struct Fixture {
    context: Arc<RouteContext>,
    server: Arc<RecordingRoute>,
    consumer: Arc<GrpcConsumer>,
    transport: Arc<ChannelTransport>,
}

/// An AGGREGATION consumer answering pings, served by tonic on a loopback socket.
async fn fixture() -> Fixture {
    let server = RecordingRoute::new("direct:echo", |exchange: Exchange| async move {
        pingpong::answer(exchange)
    });
    let consumer = Arc::new(
        GrpcConsumer::new(
            GrpcConfiguration::new().with_consumer_strategy(ConsumerStrategy::Aggregation),
            server.clone(),
        )
        .unwrap(),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(
        Server::builder()
            .add_service(pingpong::server(Arc::clone(&consumer)))
            .serve_with_incoming(TcpIncoming::from(listener)),
    );

    let transport = ChannelTransport::connect_lazy(&format!("http://{addr}")).unwrap();
    Fixture {
        context: Arc::new(RouteContext::new()),
        server,
        consumer,
        transport: Arc::new(transport),
    }
}

impl Fixture {
    fn producer(&self, config: GrpcConfiguration, method: MethodDescriptor) -> GrpcProducer {
        GrpcProducer::new(
            config,
            method,
            self.transport.clone(),
            Arc::clone(&self.context),
        )
        .unwrap()
    }

    fn simple(&self, method: &str) -> GrpcProducer {
        self.producer(
            GrpcConfiguration::new().with_method(method),
            pingpong::descriptor(method).unwrap(),
        )
    }
}

fn pings(ids: impl IntoIterator<Item = i32>) -> Exchange {
    let pings: Vec<PingRequest> = ids
        .into_iter()
        .map(|id| PingRequest::new(id, format!("ping-{id}")))
        .collect();
    Exchange::default().with_messages(&pings)
}

fn pong_ids(exchange: &Exchange) -> Vec<i32> {
    exchange
        .decode_all::<PongResponse>()
        .unwrap()
        .iter()
        .map(|p| p.pong_id)
        .collect()
}

#[tokio::test]
async fn test_unary_over_socket() {
    init_test_logging();
    let fixture = fixture().await;
    let producer = fixture.simple(pingpong::PING_SYNC_SYNC);

    let reply = producer
        .process(Exchange::from_message(&PingRequest::new(1, "ping-1")))
        .await
        .unwrap();

    assert!(matches!(reply.body(), Body::Message(_)));
    let pong: PongResponse = reply.decode().unwrap();
    assert_eq!(pong.pong_id, 1);
    assert_eq!(pong.pong_name, "ping-1PONG");
    assert_eq!(fixture.server.count(), 1);
}

#[tokio::test]
async fn test_server_streaming_over_socket() {
    init_test_logging();
    let fixture = fixture().await;
    let producer = fixture.simple(pingpong::PING_SYNC_ASYNC);

    let reply = producer.process(pings([7])).await.unwrap();

    assert!(matches!(reply.body(), Body::Messages(_)));
    assert_eq!(pong_ids(&reply), vec![7]);
}

#[tokio::test]
async fn test_client_streaming_over_socket() {
    init_test_logging();
    let fixture = fixture().await;
    let producer = fixture.simple(pingpong::PING_ASYNC_SYNC);

    let reply = producer.process(pings(1..=3)).await.unwrap();

    // One unit of work for the whole stream; the first pong is the answer.
    let pong: PongResponse = reply.decode().unwrap();
    assert_eq!(pong.pong_id, 1);
    let seen = fixture.server.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(
        seen[0].pings().iter().map(|p| p.ping_id).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
}

#[tokio::test]
async fn test_bidi_streaming_over_socket() {
    init_test_logging();
    let fixture = fixture().await;
    let producer = fixture.simple(pingpong::PING_ASYNC_ASYNC);

    let reply = producer.process(pings(1..=4)).await.unwrap();

    assert_eq!(pong_ids(&reply), vec![1, 2, 3, 4]);
    assert!(eventually(WAIT, || fixture.consumer.active_calls() == 0).await);
}

#[tokio::test]
async fn test_undeclared_method_is_unimplemented() {
    init_test_logging();
    let fixture = fixture().await;
    let method =
        MethodDescriptor::parse(&format!("{}/PingNever", pingpong::SERVICE), CallShape::UNARY)
            .unwrap();
    let producer = fixture.producer(GrpcConfiguration::new().with_method("PingNever"), method);

    let err = producer
        .process(Exchange::from_message(&PingRequest::new(1, "ping-1")))
        .await
        .unwrap_err();

    assert_eq!(err.into_status().code(), Code::Unimplemented);
    assert_eq!(fixture.server.count(), 0);
}

#[tokio::test]
async fn test_route_controlled_client_stream_returns_before_remote_answers() {
    init_test_logging();
    let fixture = fixture().await;
    let replies = RecordingRoute::new(REPLIES, |exchange: Exchange| async move { Ok(exchange) });
    fixture.context.add_route(REPLIES, replies.clone());
    let producer = fixture.producer(
        GrpcConfiguration::new()
            .with_method(pingpong::PING_ASYNC_SYNC)
            .with_producer_strategy(ProducerStrategy::Streaming)
            .with_stream_replies_to(REPLIES)
            .with_route_controlled_stream_observer(true),
        pingpong::descriptor(pingpong::PING_ASYNC_SYNC).unwrap(),
    );

    // The remote answers only after the request stream ends, which is up to the route.
    let sent = tokio::time::timeout(Duration::from_secs(2), producer.process(pings([1])))
        .await
        .expect("process waited for the remote to answer")
        .unwrap();
    assert_eq!(replies.count(), 0);

    let observer = sent.request_observer().cloned().unwrap();
    observer.on_message(&PingRequest::new(2, "ping-2")).unwrap();
    observer.on_completed().unwrap();

    assert!(eventually(WAIT, || replies.count() == 1).await);
    let reply = &replies.seen()[0];
    assert_eq!(reply.event, Some(EventType::OnNext));
    assert_eq!(reply.pongs()[0].pong_id, 1);
    assert_eq!(
        fixture.server.seen()[0]
            .pings()
            .iter()
            .map(|p| p.ping_id)
            .collect::<Vec<_>>(),
        vec![1, 2]
    );
    assert!(eventually(WAIT, || producer.active_calls() == 0).await);
}
