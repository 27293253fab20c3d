use std::sync::Arc;

use dashmap::DashMap;
use futures::StreamExt;
use futures::future::{self, BoxFuture};
use tonic::Status;
use tracing::{debug, info};

use crate::consumer::GrpcConsumer;
use crate::path::MethodDescriptor;
use crate::transport::{ClientTransport, PayloadStream, ReplyStream};

/// In-process transport: calls go straight to a bound [`GrpcConsumer`].
///
/// Consumers are bound per full service name (`package.Service`), so every
/// method of that service reaches the same consumer.
#[derive(Default)]
pub struct LoopbackTransport {
    services: DashMap<String, Arc<GrpcConsumer>, ahash::RandomState>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, service: impl Into<String>, consumer: Arc<GrpcConsumer>) {
        let service = service.into();
        info!(service = %service, "Bound loopback service");
        self.services.insert(service, consumer);
    }

    pub fn unbind(&self, service: &str) -> Option<Arc<GrpcConsumer>> {
        self.services.remove(service).map(|(_, consumer)| consumer)
    }
}

impl ClientTransport for LoopbackTransport {
    fn open_call(
        &self,
        method: &MethodDescriptor,
        requests: PayloadStream,
    ) -> BoxFuture<'static, Result<ReplyStream, Status>> {
        let service = method.path.full_service();
        let result = match self.services.get(&service) {
            Some(consumer) => {
                debug!(method = %method.path, shape = %method.shape, "Opening loopback call");
                let inbound = requests.map(Ok::<_, Status>);
                Ok(consumer.serve(method.method_name(), method.shape, inbound))
            }
            None => Err(Status::unimplemented(format!(
                "no service bound for '{}'",
                method.path
            ))),
        };
        Box::pin(future::ready(result))
    }
}
