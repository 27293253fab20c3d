use std::collections::HashMap;
use std::convert::Infallible;
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use futures::future;
use futures::stream;
use tonic::body::Body;
use tonic::codegen::{BoxFuture, Context, Poll, Service, StdError, http};
use tonic::server::{
    ClientStreamingService, Grpc, NamedService, ServerStreamingService, StreamingService,
    UnaryService,
};
use tonic::{Request, Response, Status, Streaming};
use tracing::debug;

use crate::consumer::GrpcConsumer;
use crate::consumer::binding::single_reply;
use crate::path::{Cardinality, CallShape, GrpcPath};
use crate::transport::{BytesCodec, ReplyStream};

/// A [`GrpcConsumer`] served on a tonic server as the service `N::NAME`.
///
/// Each declared method is dispatched to the consumer with its call shape.
/// Messages stay encoded, so no generated server code is involved. Methods
/// that were not declared answer `UNIMPLEMENTED`.
///
/// ```ignore
/// Server::builder()
///     .add_service(ConsumerService::<PingPong>::new(consumer, methods))
///     .serve(addr)
///     .await?;
/// ```
pub struct ConsumerService<N> {
    consumer: Arc<GrpcConsumer>,
    methods: Arc<HashMap<String, CallShape, ahash::RandomState>>,
    _name: PhantomData<fn() -> N>,
}

impl<N> ConsumerService<N> {
    pub fn new<I, S>(consumer: Arc<GrpcConsumer>, methods: I) -> Self
    where
        I: IntoIterator<Item = (S, CallShape)>,
        S: Into<String>,
    {
        let methods = methods
            .into_iter()
            .map(|(name, shape)| (name.into(), shape))
            .collect();
        Self {
            consumer,
            methods: Arc::new(methods),
            _name: PhantomData,
        }
    }

    pub fn consumer(&self) -> &Arc<GrpcConsumer> {
        &self.consumer
    }
}

impl<N> Clone for ConsumerService<N> {
    fn clone(&self) -> Self {
        Self {
            consumer: Arc::clone(&self.consumer),
            methods: Arc::clone(&self.methods),
            _name: PhantomData,
        }
    }
}

impl<N: NamedService> NamedService for ConsumerService<N> {
    const NAME: &'static str = N::NAME;
}

impl<N, B> Service<http::Request<B>> for ConsumerService<N>
where
    N: NamedService,
    B: tonic::codegen::Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<Body>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let method = GrpcPath::parse(req.uri().path())
            .ok()
            .filter(|path| path.full_service() == N::NAME)
            .and_then(|path| {
                let shape = self.methods.get(&path.method).copied()?;
                Some((path.method, shape))
            });

        let Some((method, shape)) = method else {
            debug!(path = %req.uri().path(), "No such method");
            let status = Status::unimplemented(format!("unknown method '{}'", req.uri().path()));
            return Box::pin(future::ready(Ok(status.into_http())));
        };

        debug!(method = %method, shape = %shape, "Serving inbound call");
        let call = MethodCall {
            consumer: Arc::clone(&self.consumer),
            method,
        };
        Box::pin(async move {
            let mut grpc = Grpc::new(BytesCodec);
            let response = match (shape.request, shape.response) {
                (Cardinality::Unary, Cardinality::Unary) => grpc.unary(call, req).await,
                (Cardinality::Unary, Cardinality::Streaming) => {
                    grpc.server_streaming(call, req).await
                }
                (Cardinality::Streaming, Cardinality::Unary) => {
                    grpc.client_streaming(call, req).await
                }
                (Cardinality::Streaming, Cardinality::Streaming) => {
                    grpc.streaming(call, req).await
                }
            };
            Ok(response)
        })
    }
}

/// One inbound call of a known method, in whichever shape tonic asks for.
struct MethodCall {
    consumer: Arc<GrpcConsumer>,
    method: String,
}

impl MethodCall {
    fn serve_one(&self, shape: CallShape, request: Request<Bytes>) -> ReplyStream {
        let inbound = stream::once(future::ready(Ok(request.into_inner())));
        self.consumer.serve(&self.method, shape, inbound)
    }
}

impl UnaryService<Bytes> for MethodCall {
    type Response = Bytes;
    type Future = BoxFuture<Response<Bytes>, Status>;

    fn call(&mut self, request: Request<Bytes>) -> Self::Future {
        let replies = self.serve_one(CallShape::UNARY, request);
        Box::pin(async move { single_reply(replies).await.map(Response::new) })
    }
}

impl ServerStreamingService<Bytes> for MethodCall {
    type Response = Bytes;
    type ResponseStream = ReplyStream;
    type Future = BoxFuture<Response<ReplyStream>, Status>;

    fn call(&mut self, request: Request<Bytes>) -> Self::Future {
        let replies = self.serve_one(CallShape::SERVER_STREAMING, request);
        Box::pin(future::ready(Ok(Response::new(replies))))
    }
}

impl ClientStreamingService<Bytes> for MethodCall {
    type Response = Bytes;
    type Future = BoxFuture<Response<Bytes>, Status>;

    fn call(&mut self, request: Request<Streaming<Bytes>>) -> Self::Future {
        let replies = self
            .consumer
            .serve(&self.method, CallShape::CLIENT_STREAMING, request.into_inner());
        Box::pin(async move { single_reply(replies).await.map(Response::new) })
    }
}

impl StreamingService<Bytes> for MethodCall {
    type Response = Bytes;
    type ResponseStream = ReplyStream;
    type Future = BoxFuture<Response<ReplyStream>, Status>;

    fn call(&mut self, request: Request<Streaming<Bytes>>) -> Self::Future {
        let replies = self
            .consumer
            .serve(&self.method, CallShape::BIDI_STREAMING, request.into_inner());
        Box::pin(future::ready(Ok(Response::new(replies))))
    }
}
