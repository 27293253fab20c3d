#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use futures::StreamExt;
use grpc_route::{Body, Completion, EventType, Exchange, ReplyStream, Route, RouteEngine, RouteError};
use route_bridge::pingpong::{PingRequest, PongResponse};
use tonic::Status;

static INIT_LOGGING: Once = Once::new();

pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

/// What a [`RecordingRoute`] saw, captured at submission time.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub event: Option<EventType>,
    pub method: Option<String>,
    pub correlation_id: Option<String>,
    pub body: Body,
    pub has_response_observer: bool,
    pub property_keys: Vec<String>,
}

impl Recorded {
    pub fn pings(&self) -> Vec<PingRequest> {
        Exchange::new(self.body.clone()).decode_all().unwrap_or_default()
    }

    pub fn pongs(&self) -> Vec<PongResponse> {
        Exchange::new(self.body.clone()).decode_all().unwrap_or_default()
    }
}

/// Records every submitted unit of work synchronously, then runs it on a [`Route`].
pub struct RecordingRoute {
    inner: Route,
    seen: Mutex<Vec<Recorded>>,
}

impl RecordingRoute {
    pub fn new<F, Fut>(name: &str, f: F) -> Arc<Self>
    where
        F: Fn(Exchange) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Exchange, RouteError>> + Send + 'static,
    {
        Arc::new(Self {
            inner: Route::new(name, f),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn seen(&self) -> Vec<Recorded> {
        self.seen.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn events(&self) -> Vec<Option<EventType>> {
        self.seen().iter().map(|r| r.event).collect()
    }
}

impl RouteEngine for RecordingRoute {
    fn submit(&self, exchange: Exchange) -> Result<Completion, RouteError> {
        self.seen.lock().unwrap().push(Recorded {
            event: exchange.event_type(),
            method: exchange.method_name().map(str::to_owned),
            correlation_id: exchange.correlation_id().map(str::to_owned),
            body: exchange.body().clone(),
            has_response_observer: exchange.response_observer().is_some(),
            property_keys: exchange.properties().keys().cloned().collect(),
        });
        self.inner.submit(exchange)
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Drain a reply stream, failing the test if it does not end in time.
pub async fn collect_replies(replies: ReplyStream) -> Vec<Result<bytes::Bytes, Status>> {
    tokio::time::timeout(Duration::from_secs(5), replies.collect::<Vec<_>>())
        .await
        .expect("reply stream did not end")
}

pub fn decode_pong(reply: &Result<bytes::Bytes, Status>) -> PongResponse {
    let bytes = reply.as_ref().expect("expected a reply, got an error").clone();
    <PongResponse as prost::Message>::decode(bytes).expect("reply is not a pong")
}

pub fn encode_ping(id: i32) -> bytes::Bytes {
    bytes::Bytes::from(prost::Message::encode_to_vec(&PingRequest::new(id, format!("ping-{id}"))))
}
