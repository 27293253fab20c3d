use std::sync::Arc;

use bytes::Bytes;
use futures::TryStreamExt;
use tracing::{debug, info};

use crate::bridge::RequestObserver;
use crate::config::{GrpcConfiguration, ProducerStrategy};
use crate::engine::{RouteContext, RouteEngine};
use crate::error::{ConfigError, ProducerError};
use crate::exchange::{Body, Exchange, GRPC_CORRELATION_ID, GRPC_REQUEST_OBSERVER, Property};
use crate::path::MethodDescriptor;
use crate::producer::reply_router::ReplyRouter;
use crate::producer::request_stream::RequestStream;
use crate::registry::CallRegistry;
use crate::transport::ClientTransport;

/// Where a STREAMING producer sends replies.
struct ReplyDestination {
    name: String,
    engine: Arc<dyn RouteEngine>,
}

/// A producer endpoint: invokes one remote method per exchange.
///
/// With [`ProducerStrategy::Simple`] the replies become the exchange body.
/// With [`ProducerStrategy::Streaming`] the exchange returns as soon as the
/// request payloads are handed to the call, and replies are routed to
/// `stream_replies_to` one by one. A call that fails to open is reported
/// there like any other remote error.
pub struct GrpcProducer {
    config: GrpcConfiguration,
    method: MethodDescriptor,
    transport: Arc<dyn ClientTransport>,
    destination: Option<ReplyDestination>,
    calls: Arc<CallRegistry>,
}

impl GrpcProducer {
    pub fn new(
        config: GrpcConfiguration,
        method: MethodDescriptor,
        transport: Arc<dyn ClientTransport>,
        context: Arc<RouteContext>,
    ) -> Result<Self, ConfigError> {
        config.validate_producer()?;

        let destination = match (config.producer_strategy, config.stream_replies_to.as_deref()) {
            (ProducerStrategy::Streaming, Some(name)) => {
                let engine = context
                    .resolve(name)
                    .ok_or_else(|| ConfigError::UnknownDestination(name.to_owned()))?;
                Some(ReplyDestination {
                    name: name.to_owned(),
                    engine,
                })
            }
            _ => None,
        };

        info!(
            method = %method.path,
            shape = %method.shape,
            strategy = %config.producer_strategy,
            stream_replies_to = ?config.stream_replies_to,
            "Created gRPC producer"
        );

        Ok(Self {
            config,
            method,
            transport,
            destination,
            calls: Arc::new(CallRegistry::new()),
        })
    }

    pub fn method(&self) -> &MethodDescriptor {
        &self.method
    }

    /// Invoke the method with the exchange body as request payload(s).
    pub async fn process(&self, mut exchange: Exchange) -> Result<Exchange, ProducerError> {
        let mut requests = RequestStream::from_body(exchange.take_body(), self.method.shape)?;

        // A route-controlled call keeps its request stream open for the route.
        let route_controlled = self.destination.is_some()
            && self.config.route_controlled_stream_observer
            && self.method.shape.streaming_request();
        if !route_controlled {
            requests.complete()?;
        }

        let guard = self.calls.open(self.method.method_name(), self.method.shape);
        let call_id = guard.id();
        let (observer, payloads, cancel) = RequestObserver::channel(call_id);

        debug!(
            call_id = %call_id,
            method = %self.method.path,
            requests = requests.len(),
            route_controlled,
            "Invoking remote method"
        );
        requests.flush(&observer)?;

        let opening = self.transport.open_call(&self.method, payloads);

        let Some(destination) = &self.destination else {
            let replies: Vec<Bytes> = opening.await?.try_collect().await?;
            debug!(call_id = %call_id, replies = replies.len(), "Remote call completed");
            drop(guard);
            return Ok(exchange.with_body(self.reply_body(replies)));
        };

        let origin = self.config.inherit_exchange_properties_for_replies.then(|| {
            let mut origin = Exchange::default();
            origin.inherit_properties(&exchange);
            origin
        });
        let router = ReplyRouter {
            call_id,
            method: self.method.method_name().to_owned(),
            destination: destination.name.clone(),
            engine: Arc::clone(&destination.engine),
            forward_on_completed: self.config.forward_on_completed,
            forward_on_error: self.config.forward_on_error,
            origin,
        };
        // The call opens inside the router task: a client-streaming call only
        // answers after its request stream ends, which a route-controlled
        // call leaves to the route.
        tokio::spawn(router.run(opening, cancel, guard));

        exchange.set_header(GRPC_CORRELATION_ID, call_id.to_string());
        if route_controlled {
            exchange.set_property(GRPC_REQUEST_OBSERVER, Property::Request(observer));
        }
        Ok(exchange)
    }

    fn reply_body(&self, mut replies: Vec<Bytes>) -> Body {
        if !self.method.shape.streaming_response() && replies.len() == 1 {
            Body::Message(replies.swap_remove(0))
        } else {
            Body::Messages(replies)
        }
    }

    /// Number of client calls still open.
    pub fn active_calls(&self) -> usize {
        self.calls.len()
    }
}
