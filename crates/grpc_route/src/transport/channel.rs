use std::str::FromStr;

use bytes::Bytes;
use futures::future::{self, BoxFuture};
use futures::stream::{self, StreamExt};
use tonic::client::Grpc;
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue};
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Status};
use tracing::debug;

use crate::error::ClientError;
use crate::path::{Cardinality, MethodDescriptor};
use crate::transport::codec::BytesCodec;
use crate::transport::{ClientTransport, PayloadStream, ReplyStream};

/// Opens calls on a tonic [`Channel`] without generated client stubs.
#[derive(Clone)]
pub struct ChannelTransport {
    channel: Channel,
    metadata: Vec<(AsciiMetadataKey, AsciiMetadataValue)>,
}

impl ChannelTransport {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            metadata: Vec::new(),
        }
    }

    /// Connect to `addr` (e.g. `http://localhost:50051`).
    pub async fn connect(addr: &str) -> Result<Self, ClientError> {
        let channel = endpoint(addr)?.connect().await?;
        Ok(Self::new(channel))
    }

    /// Build a transport whose channel connects on first use.
    pub fn connect_lazy(addr: &str) -> Result<Self, ClientError> {
        Ok(Self::new(endpoint(addr)?.connect_lazy()))
    }

    /// Attach ASCII metadata to every call opened by this transport.
    pub fn with_metadata(mut self, pairs: &[(String, String)]) -> Result<Self, ClientError> {
        for (key, value) in pairs {
            let parsed_key = AsciiMetadataKey::from_str(key)
                .map_err(|_| ClientError::InvalidMetadataKey(key.clone()))?;
            let parsed_value = AsciiMetadataValue::from_str(value)
                .map_err(|_| ClientError::InvalidMetadataValue(key.clone()))?;
            self.metadata.push((parsed_key, parsed_value));
        }
        Ok(self)
    }

    fn request<T>(&self, message: T) -> Request<T> {
        let mut request = Request::new(message);
        for (key, value) in &self.metadata {
            request.metadata_mut().insert(key.clone(), value.clone());
        }
        request
    }
}

fn endpoint(addr: &str) -> Result<Endpoint, ClientError> {
    Endpoint::from_shared(addr.to_owned()).map_err(|e| ClientError::InvalidUri {
        addr: addr.to_owned(),
        reason: e.to_string(),
    })
}

async fn single_payload(mut requests: PayloadStream) -> Result<Bytes, Status> {
    requests
        .next()
        .await
        .ok_or_else(|| Status::invalid_argument("unary request stream ended without a payload"))
}

fn single_reply(reply: Bytes) -> ReplyStream {
    stream::once(future::ready(Ok(reply))).boxed()
}

impl ClientTransport for ChannelTransport {
    fn open_call(
        &self,
        method: &MethodDescriptor,
        requests: PayloadStream,
    ) -> BoxFuture<'static, Result<ReplyStream, Status>> {
        let this = self.clone();
        let method = method.clone();

        Box::pin(async move {
            let path = method
                .path
                .http_path()
                .map_err(|e| Status::invalid_argument(e.to_string()))?;

            let mut grpc = Grpc::new(this.channel.clone());
            grpc.ready()
                .await
                .map_err(|e| Status::unavailable(format!("channel not ready: {e}")))?;

            debug!(method = %method.path, shape = %method.shape, "Opening client call");

            match (method.shape.request, method.shape.response) {
                (Cardinality::Unary, Cardinality::Unary) => {
                    let payload = single_payload(requests).await?;
                    let response = grpc.unary(this.request(payload), path, BytesCodec).await?;
                    Ok(single_reply(response.into_inner()))
                }
                (Cardinality::Unary, Cardinality::Streaming) => {
                    let payload = single_payload(requests).await?;
                    let response = grpc
                        .server_streaming(this.request(payload), path, BytesCodec)
                        .await?;
                    Ok(response.into_inner().boxed())
                }
                (Cardinality::Streaming, Cardinality::Unary) => {
                    let response = grpc
                        .client_streaming(this.request(requests), path, BytesCodec)
                        .await?;
                    Ok(single_reply(response.into_inner()))
                }
                (Cardinality::Streaming, Cardinality::Streaming) => {
                    let response = grpc
                        .streaming(this.request(requests), path, BytesCodec)
                        .await?;
                    Ok(response.into_inner().boxed())
                }
            }
        })
    }
}
