use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::future;
use futures::stream::{self, Stream, StreamExt};
use prost::Message;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

use crate::bridge::ResponseObserver;
use crate::config::GrpcConfiguration;
use crate::consumer::adapter::ServerCallAdapter;
use crate::consumer::strategy::CallContext;
use crate::engine::RouteEngine;
use crate::error::ConfigError;
use crate::path::CallShape;
use crate::registry::CallRegistry;
use crate::transport::ReplyStream;

/// Reply stream decoded into typed messages, for use as a tonic response stream.
pub struct TypedReplyStream<M> {
    inner: ReplyStream,
    _marker: PhantomData<fn() -> M>,
}

impl<M> TypedReplyStream<M> {
    pub fn new(inner: ReplyStream) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }
}

impl<M> Stream for TypedReplyStream<M>
where
    M: Message + Default,
{
    type Item = Result<M, Status>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx).map(|item| {
            item.map(|reply| {
                reply.and_then(|bytes| {
                    M::decode(bytes)
                        .map_err(|e| Status::internal(format!("failed to decode reply: {e}")))
                })
            })
        })
    }
}

fn encode_inbound<S, Req>(inbound: S) -> impl Stream<Item = Result<Bytes, Status>> + Send + 'static
where
    S: Stream<Item = Result<Req, Status>> + Send + 'static,
    Req: Message + 'static,
{
    inbound.map(|item| item.map(|request| Bytes::from(request.encode_to_vec())))
}

/// The reply of a call whose response is unary. Replies past the first are dropped.
pub(crate) async fn single_reply(mut replies: ReplyStream) -> Result<Bytes, Status> {
    replies
        .next()
        .await
        .unwrap_or_else(|| Err(Status::internal("route produced no reply")))
}

async fn first_reply<M: Message + Default>(replies: ReplyStream) -> Result<M, Status> {
    let reply = single_reply(replies).await?;
    M::decode(reply).map_err(|e| Status::internal(format!("failed to decode reply: {e}")))
}

/// A consumer endpoint: binds inbound gRPC calls to a routing engine.
///
/// The configuration is validated once here and never changes afterwards.
/// Each call gets its own [`ServerCallAdapter`] and registry entry.
pub struct GrpcConsumer {
    config: Arc<GrpcConfiguration>,
    engine: Arc<dyn RouteEngine>,
    calls: Arc<CallRegistry>,
}

impl GrpcConsumer {
    pub fn new(config: GrpcConfiguration, engine: Arc<dyn RouteEngine>) -> Result<Self, ConfigError> {
        config.validate_consumer()?;
        info!(
            strategy = %config.consumer_strategy,
            forward_on_completed = config.forward_on_completed,
            forward_on_error = config.forward_on_error,
            "Created gRPC consumer"
        );
        Ok(Self {
            config: Arc::new(config),
            engine,
            calls: Arc::new(CallRegistry::new()),
        })
    }

    pub fn config(&self) -> &GrpcConfiguration {
        &self.config
    }

    /// Open a call and return the adapter to drive it plus the caller-facing reply stream.
    pub fn open_call(&self, method: &str, shape: CallShape) -> (ServerCallAdapter, ReplyStream) {
        let guard = self.calls.open(method, shape);
        let call_id = guard.id();
        let (observer, replies) = ResponseObserver::channel(call_id);

        debug!(call_id = %call_id, method, shape = %shape, "Opened consumer call");

        let context = CallContext {
            call_id,
            method: method.to_owned(),
            shape,
            config: Arc::clone(&self.config),
            engine: Arc::clone(&self.engine),
            observer,
        };
        (ServerCallAdapter::new(context, guard), replies)
    }

    /// Pump `inbound` into a new call and return its replies.
    ///
    /// The first inbound error ends the call with that error.
    pub fn serve<S>(&self, method: &str, shape: CallShape, inbound: S) -> ReplyStream
    where
        S: Stream<Item = Result<Bytes, Status>> + Send + 'static,
    {
        let (mut adapter, replies) = self.open_call(method, shape);

        tokio::spawn(async move {
            let mut inbound = Box::pin(inbound);
            while let Some(item) = inbound.next().await {
                match item {
                    Ok(payload) => adapter.on_next(payload),
                    Err(status) => {
                        adapter.on_error(status);
                        return;
                    }
                }
            }
            adapter.on_completed();
        });

        replies
    }

    /// Serve a unary call. A route that produces no reply fails the call with `INTERNAL`.
    pub async fn unary<Req, Resp>(
        &self,
        method: &str,
        request: Request<Req>,
    ) -> Result<Response<Resp>, Status>
    where
        Req: Message,
        Resp: Message + Default,
    {
        let payload = Bytes::from(request.into_inner().encode_to_vec());
        let inbound = stream::once(future::ready(Ok(payload)));
        let replies = self.serve(method, CallShape::UNARY, inbound);
        first_reply(replies).await.map(Response::new)
    }

    pub fn server_streaming<Req, Resp>(
        &self,
        method: &str,
        request: Request<Req>,
    ) -> Result<Response<TypedReplyStream<Resp>>, Status>
    where
        Req: Message,
        Resp: Message + Default,
    {
        let payload = Bytes::from(request.into_inner().encode_to_vec());
        let inbound = stream::once(future::ready(Ok(payload)));
        let replies = self.serve(method, CallShape::SERVER_STREAMING, inbound);
        Ok(Response::new(TypedReplyStream::new(replies)))
    }

    /// Serve a client-streaming call. `S` is typically `tonic::Streaming<Req>`.
    pub async fn client_streaming<S, Req, Resp>(
        &self,
        method: &str,
        request: Request<S>,
    ) -> Result<Response<Resp>, Status>
    where
        S: Stream<Item = Result<Req, Status>> + Send + 'static,
        Req: Message + 'static,
        Resp: Message + Default,
    {
        let inbound = encode_inbound(request.into_inner());
        let replies = self.serve(method, CallShape::CLIENT_STREAMING, inbound);
        first_reply(replies).await.map(Response::new)
    }

    pub fn bidi_streaming<S, Req, Resp>(
        &self,
        method: &str,
        request: Request<S>,
    ) -> Result<Response<TypedReplyStream<Resp>>, Status>
    where
        S: Stream<Item = Result<Req, Status>> + Send + 'static,
        Req: Message + 'static,
        Resp: Message + Default,
    {
        let inbound = encode_inbound(request.into_inner());
        let replies = self.serve(method, CallShape::BIDI_STREAMING, inbound);
        Ok(Response::new(TypedReplyStream::new(replies)))
    }

    /// Number of calls that have not finished yet.
    pub fn active_calls(&self) -> usize {
        self.calls.len()
    }
}
