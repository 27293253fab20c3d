use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use grpc_route::{
    ChannelTransport, EventType, Exchange, GrpcConsumer, GrpcEndpoint, GrpcProducer, RouteContext,
};
use route_bridge::pingpong::{self, PingRequest, PongResponse};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tonic::transport::Server;
use tonic::transport::server::TcpIncoming;
use tracing::{error, info, warn};

const SERVER_ROUTE: &str = "direct:pingpong-server";
const REPLIES: &str = "direct:pong-replies";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let count: i32 = std::env::var("PING_COUNT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(5);
    let port: u16 = std::env::var("PINGPONG_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(50051);

    let context = Arc::new(RouteContext::new());

    // Server side: every inbound ping becomes its own unit of work.
    let server_route = pingpong::echo_route(&context, SERVER_ROUTE);
    let server = GrpcEndpoint::parse(&format!(
        "grpc://127.0.0.1:{port}/{}?consumerStrategy=PROPAGATION",
        pingpong::SERVICE
    ))?;
    let consumer = Arc::new(GrpcConsumer::new(server.config, server_route)?);

    let listener = TcpListener::bind((server.host.as_str(), server.port)).await?;
    info!(addr = %listener.local_addr()?, "PingPong server listening");
    let service = pingpong::server(Arc::clone(&consumer));
    tokio::spawn(async move {
        if let Err(e) = Server::builder()
            .add_service(service)
            .serve_with_incoming(TcpIncoming::from(listener))
            .await
        {
            error!(error = %e, "PingPong server failed");
        }
    });

    // Client side: pongs stream back into REPLIES as they arrive.
    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel();
    context.route(REPLIES, move |exchange: Exchange| {
        let pong_tx = pong_tx.clone();
        async move {
            match exchange.event_type() {
                Some(EventType::OnNext) => {
                    let pong: PongResponse = exchange.decode()?;
                    info!(
                        correlation_id = ?exchange.correlation_id(),
                        pong_id = pong.pong_id,
                        pong_name = %pong.pong_name,
                        "Received pong"
                    );
                    let _ = pong_tx.send(pong.pong_id);
                }
                other => info!(
                    correlation_id = ?exchange.correlation_id(),
                    event = ?other,
                    "Reply stream ended"
                ),
            }
            Ok(exchange)
        }
    });

    let client = GrpcEndpoint::parse(&format!(
        "grpc://127.0.0.1:{port}/{}?method={}&producerStrategy=STREAMING&streamRepliesTo={REPLIES}&forwardOnCompleted=true",
        pingpong::SERVICE,
        pingpong::PING_ASYNC_ASYNC
    ))?;
    let method = pingpong::descriptor(pingpong::PING_ASYNC_ASYNC)?;
    let transport = Arc::new(
        ChannelTransport::connect_lazy(&client.address())?.with_metadata(&client.config.metadata)?,
    );
    let producer = GrpcProducer::new(client.config, method, transport, Arc::clone(&context))?;

    let pings: Vec<PingRequest> = (1..=count)
        .map(|id| PingRequest::new(id, format!("ping-{id}")))
        .collect();
    let sent = producer
        .process(Exchange::default().with_messages(&pings))
        .await?;
    info!(
        correlation_id = ?sent.correlation_id(),
        pings = pings.len(),
        "Sent pings"
    );

    let mut received = 0;
    while received < count {
        match tokio::time::timeout(Duration::from_secs(5), pong_rx.recv()).await {
            Ok(Some(_)) => received += 1,
            _ => {
                warn!(received, expected = count, "Timed out waiting for pongs");
                break;
            }
        }
    }

    info!(received, active_calls = consumer.active_calls(), "Done");
    Ok(())
}
