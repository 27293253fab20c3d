//! Per-call state machines behind a [`ServerCallAdapter`](super::ServerCallAdapter).
//!
//! Each strategy decides how the inbound events of one call become units of
//! work, and who sends what on the outbound observer.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tonic::Status;
use tracing::{debug, error, warn};

use crate::bridge::ResponseObserver;
use crate::config::{ConsumerStrategy, GrpcConfiguration};
use crate::engine::{Completion, RouteEngine};
use crate::error::RouteError;
use crate::exchange::{Body, EventType, Exchange, GRPC_METHOD_NAME, GRPC_RESPONSE_OBSERVER, Property};
use crate::path::CallShape;
use crate::registry::{CallGuard, CallId};

/// How an inbound call ended.
#[derive(Debug, Clone)]
pub(crate) enum Terminal {
    Completed,
    Failed(Status),
}

impl Terminal {
    pub(crate) fn signal(&self) -> &'static str {
        match self {
            Terminal::Completed => "onCompleted",
            Terminal::Failed(_) => "onError",
        }
    }
}

/// Everything one call's tasks share. Never shared across calls.
pub(crate) struct CallContext {
    pub(crate) call_id: CallId,
    pub(crate) method: String,
    pub(crate) shape: CallShape,
    pub(crate) config: Arc<GrpcConfiguration>,
    pub(crate) engine: Arc<dyn RouteEngine>,
    pub(crate) observer: ResponseObserver,
}

impl CallContext {
    fn submit(&self, exchange: Exchange) -> Result<Completion, RouteError> {
        debug!(
            call_id = %self.call_id,
            method = %self.method,
            event = ?exchange.event_type(),
            "Submitting unit of work"
        );
        let submitted = panic::catch_unwind(AssertUnwindSafe(|| self.engine.submit(exchange)));
        submitted.unwrap_or_else(|_| {
            error!(
                call_id = %self.call_id,
                method = %self.method,
                "Routing engine panicked on submit"
            );
            Err(RouteError::Panicked)
        })
    }

    /// Send the outcome of a unit of work back to the caller.
    fn deliver(&self, result: Result<Exchange, RouteError>) {
        let body = match result {
            Ok(exchange) => exchange.into_body(),
            Err(err) => {
                warn!(
                    call_id = %self.call_id,
                    method = %self.method,
                    error = %err,
                    "Unit of work failed"
                );
                Body::Error(err.into_status())
            }
        };

        match body.into_replies() {
            Ok(replies) => {
                for reply in replies {
                    if self.observer.is_terminated() {
                        debug!(call_id = %self.call_id, "Dropping reply for terminated call");
                        return;
                    }
                    let _ = self.observer.on_next(reply);
                }
            }
            Err(status) => self.fail(status),
        }
    }

    fn complete(&self) {
        if !self.observer.is_terminated() {
            let _ = self.observer.on_completed();
        }
    }

    pub(crate) fn fail(&self, status: Status) {
        if !self.observer.is_terminated() {
            let _ = self.observer.on_error(status);
        }
    }

    fn event(&self, kind: EventType, body: Body) -> Exchange {
        Exchange::event(kind, &self.method, body)
    }
}

/// The strategy state of one call, picked from the endpoint configuration.
pub(crate) enum CallStrategy {
    Aggregation(Aggregation),
    Propagation(Propagation),
    Delegation(Delegation),
}

impl CallStrategy {
    pub(crate) fn for_call(ctx: &Arc<CallContext>) -> Self {
        match ctx.config.consumer_strategy {
            ConsumerStrategy::Aggregation => CallStrategy::Aggregation(Aggregation::default()),
            ConsumerStrategy::Propagation => CallStrategy::Propagation(Propagation::default()),
            ConsumerStrategy::Delegation => CallStrategy::Delegation(Delegation::start(ctx)),
        }
    }

    pub(crate) fn on_next(&mut self, ctx: &Arc<CallContext>, payload: Bytes) {
        match self {
            CallStrategy::Aggregation(state) => state.on_next(payload),
            CallStrategy::Propagation(state) => state.on_next(ctx, payload),
            CallStrategy::Delegation(state) => state.on_next(ctx, payload),
        }
    }

    pub(crate) fn finish(&mut self, ctx: &Arc<CallContext>, terminal: Terminal, guard: CallGuard) {
        match self {
            CallStrategy::Aggregation(state) => state.finish(ctx, terminal, guard),
            CallStrategy::Propagation(state) => state.finish(ctx, terminal, guard),
            CallStrategy::Delegation(state) => state.finish(ctx, terminal, guard),
        }
    }
}

/// Buffers every payload and submits one unit of work when the call completes.
#[derive(Default)]
pub(crate) struct Aggregation {
    buffer: Vec<Bytes>,
}

impl Aggregation {
    fn on_next(&mut self, payload: Bytes) {
        self.buffer.push(payload);
    }

    fn finish(&mut self, ctx: &Arc<CallContext>, terminal: Terminal, guard: CallGuard) {
        let mut buffer = std::mem::take(&mut self.buffer);

        if let Terminal::Failed(status) = terminal {
            debug!(
                call_id = %ctx.call_id,
                discarded = buffer.len(),
                "Discarding aggregated payloads of failed call"
            );
            ctx.fail(status);
            return;
        }

        let body = if !ctx.shape.streaming_request() && buffer.len() == 1 {
            Body::Message(buffer.swap_remove(0))
        } else {
            Body::Messages(buffer)
        };
        let mut exchange = Exchange::new(body);
        exchange.set_header(GRPC_METHOD_NAME, ctx.method.as_str());

        match ctx.submit(exchange) {
            Ok(completion) => {
                let ctx = Arc::clone(ctx);
                tokio::spawn(async move {
                    let _guard = guard;
                    ctx.deliver(completion.await);
                    ctx.complete();
                });
            }
            Err(err) => ctx.fail(err.into_status()),
        }
    }
}

/// Submits one unit of work per inbound event, without waiting on earlier ones.
#[derive(Default)]
pub(crate) struct Propagation {
    in_flight: Vec<JoinHandle<()>>,
}

impl Propagation {
    fn on_next(&mut self, ctx: &Arc<CallContext>, payload: Bytes) {
        self.in_flight.retain(|handle| !handle.is_finished());

        match ctx.submit(ctx.event(EventType::OnNext, Body::Message(payload))) {
            Ok(completion) => {
                let ctx = Arc::clone(ctx);
                self.in_flight.push(tokio::spawn(async move {
                    ctx.deliver(completion.await);
                }));
            }
            Err(err) => ctx.fail(err.into_status()),
        }
    }

    fn finish(&mut self, ctx: &Arc<CallContext>, terminal: Terminal, guard: CallGuard) {
        let in_flight = std::mem::take(&mut self.in_flight);

        // Submitted here rather than in the finisher so it stays behind every onNext unit.
        let forwarded = match &terminal {
            Terminal::Completed if ctx.config.forward_on_completed => {
                Some(ctx.submit(ctx.event(EventType::OnCompleted, Body::Empty)))
            }
            Terminal::Failed(status) if ctx.config.forward_on_error => {
                Some(ctx.submit(ctx.event(EventType::OnError, Body::Error(status.clone()))))
            }
            _ => None,
        };

        let ctx = Arc::clone(ctx);
        tokio::spawn(async move {
            let _guard = guard;
            for handle in in_flight {
                if let Err(e) = handle.await {
                    warn!(call_id = %ctx.call_id, error = %e, "Reply task failed");
                }
            }

            match forwarded {
                Some(Ok(completion)) => ctx.deliver(completion.await),
                Some(Err(err)) => ctx.fail(err.into_status()),
                None => {}
            }

            match terminal {
                Terminal::Completed => ctx.complete(),
                Terminal::Failed(status) => ctx.fail(status),
            }
        });
    }
}

enum Delegated {
    Unit(Exchange),
    Finish { terminal: Terminal, guard: CallGuard },
}

/// Hands the live outbound observer to the route, one unit of work at a time.
pub(crate) struct Delegation {
    queue: mpsc::UnboundedSender<Delegated>,
}

impl Delegation {
    fn start(ctx: &Arc<CallContext>) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_delegation(Arc::clone(ctx), rx));
        Self { queue }
    }

    fn on_next(&mut self, ctx: &Arc<CallContext>, payload: Bytes) {
        let exchange = ctx.event(EventType::OnNext, Body::Message(payload));
        self.enqueue(ctx, Delegated::Unit(exchange));
    }

    fn finish(&mut self, ctx: &Arc<CallContext>, terminal: Terminal, guard: CallGuard) {
        self.enqueue(ctx, Delegated::Finish { terminal, guard });
    }

    fn enqueue(&self, ctx: &CallContext, item: Delegated) {
        if self.queue.send(item).is_err() {
            warn!(call_id = %ctx.call_id, "Delegation worker is gone");
            ctx.fail(Status::internal("delegation worker stopped"));
        }
    }
}

async fn run_delegation(ctx: Arc<CallContext>, mut queue: mpsc::UnboundedReceiver<Delegated>) {
    while let Some(item) = queue.recv().await {
        match item {
            Delegated::Unit(exchange) => run_delegated(&ctx, exchange).await,
            Delegated::Finish { terminal, guard } => {
                let _guard = guard;
                match terminal {
                    // The route owns completion once it is told about it.
                    Terminal::Completed if ctx.config.forward_on_completed => {
                        run_delegated(&ctx, ctx.event(EventType::OnCompleted, Body::Empty)).await;
                    }
                    Terminal::Completed => ctx.complete(),
                    Terminal::Failed(status) => {
                        if ctx.config.forward_on_error {
                            let body = Body::Error(status.clone());
                            run_delegated(&ctx, ctx.event(EventType::OnError, body)).await;
                        }
                        ctx.fail(status);
                    }
                }
                break;
            }
        }
    }
    debug!(call_id = %ctx.call_id, "Delegation worker finished");
}

/// Run one delegated unit. The route's result body is ignored: replies go
/// through the observer it was handed.
async fn run_delegated(ctx: &CallContext, mut exchange: Exchange) {
    exchange.set_property(
        GRPC_RESPONSE_OBSERVER,
        Property::Response(ctx.observer.clone()),
    );

    let result = match ctx.submit(exchange) {
        Ok(completion) => completion.await,
        Err(err) => Err(err),
    };

    if let Err(err) = result {
        warn!(
            call_id = %ctx.call_id,
            method = %ctx.method,
            error = %err,
            "Delegated unit of work failed"
        );
        ctx.fail(err.into_status());
    }
}
