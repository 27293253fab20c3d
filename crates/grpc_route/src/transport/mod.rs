//! Client-side transports a producer opens calls on.

mod channel;
mod codec;
mod loopback;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tonic::Status;

use crate::path::MethodDescriptor;

pub use channel::ChannelTransport;
pub use codec::BytesCodec;
pub use loopback::LoopbackTransport;

/// Replies of one call, in arrival order. Ends after the last reply or the first error.
pub type ReplyStream = BoxStream<'static, Result<Bytes, Status>>;

/// Requests of one call, in send order. Ending the stream half-closes the call.
pub type PayloadStream = BoxStream<'static, Bytes>;

/// A call being opened; resolves to its replies once the remote answers.
pub type OpenCall = BoxFuture<'static, Result<ReplyStream, Status>>;

/// Opens client calls.
///
/// Every call shape is normalized to a request stream and a reply stream:
/// unary requests are a one-element stream and unary replies a one-element
/// reply stream. For a unary-response shape the remote only answers after
/// the request stream ends, so the returned future must not be awaited by
/// whoever is responsible for ending it.
pub trait ClientTransport: Send + Sync + 'static {
    fn open_call(&self, method: &MethodDescriptor, requests: PayloadStream) -> OpenCall;
}
