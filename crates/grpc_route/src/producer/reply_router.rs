use std::sync::Arc;

use futures::StreamExt;
use tonic::Status;
use tracing::{debug, info, warn};

use crate::bridge::CancelSignal;
use crate::engine::RouteEngine;
use crate::exchange::{Body, EventType, Exchange, GRPC_CORRELATION_ID};
use crate::registry::{CallGuard, CallId};
use crate::transport::OpenCall;

/// Forwards the replies of one streaming client call to a destination route.
///
/// Every reply becomes an independent unit of work tagged with the call's
/// correlation id, submitted in arrival order.
pub(crate) struct ReplyRouter {
    pub(crate) call_id: CallId,
    pub(crate) method: String,
    pub(crate) destination: String,
    pub(crate) engine: Arc<dyn RouteEngine>,
    pub(crate) forward_on_completed: bool,
    pub(crate) forward_on_error: bool,
    /// Exchange whose properties are copied onto each forwarded reply.
    pub(crate) origin: Option<Exchange>,
}

impl ReplyRouter {
    /// Open the call, then route its replies until it ends or the route aborts it.
    /// Dropping the call on abort cancels it.
    pub(crate) async fn run(
        self,
        mut opening: OpenCall,
        mut cancel: CancelSignal,
        guard: CallGuard,
    ) {
        let _guard = guard;
        let mut cancel_live = true;
        let mut forwarded = 0usize;

        let mut replies = loop {
            tokio::select! {
                status = &mut cancel, if cancel_live => match status {
                    Ok(status) => return self.aborted(&status),
                    Err(_) => cancel_live = false,
                },
                opened = &mut opening => match opened {
                    Ok(replies) => break replies,
                    Err(status) => return self.on_remote_error(status),
                },
            }
        };

        loop {
            tokio::select! {
                status = &mut cancel, if cancel_live => match status {
                    Ok(status) => return self.aborted(&status),
                    // Every request observer is gone without aborting; keep routing.
                    Err(_) => cancel_live = false,
                },
                reply = replies.next() => match reply {
                    Some(Ok(payload)) => {
                        forwarded += 1;
                        self.forward(EventType::OnNext, Body::Message(payload));
                    }
                    Some(Err(status)) => {
                        self.on_remote_error(status);
                        return;
                    }
                    None => {
                        debug!(
                            call_id = %self.call_id,
                            method = %self.method,
                            forwarded,
                            "Client call completed"
                        );
                        if self.forward_on_completed {
                            self.forward(EventType::OnCompleted, Body::Empty);
                        }
                        return;
                    }
                },
            }
        }
    }

    fn aborted(&self, status: &Status) {
        info!(
            call_id = %self.call_id,
            method = %self.method,
            reason = %status,
            "Client call aborted by route"
        );
    }

    fn on_remote_error(&self, status: Status) {
        if self.forward_on_error {
            self.forward(EventType::OnError, Body::Error(status));
        } else {
            warn!(
                call_id = %self.call_id,
                method = %self.method,
                error = %status,
                "Client call failed; error not forwarded"
            );
        }
    }

    fn forward(&self, kind: EventType, body: Body) {
        let mut exchange = Exchange::event(kind, &self.method, body);
        exchange.set_header(GRPC_CORRELATION_ID, self.call_id.to_string());
        if let Some(origin) = &self.origin {
            exchange.inherit_properties(origin);
        }

        let completion = match self.engine.submit(exchange) {
            Ok(completion) => completion,
            Err(err) => {
                warn!(
                    call_id = %self.call_id,
                    destination = %self.destination,
                    error = %err,
                    "Failed to forward reply"
                );
                return;
            }
        };

        let call_id = self.call_id;
        let destination = self.destination.clone();
        tokio::spawn(async move {
            if let Err(err) = completion.await {
                warn!(
                    call_id = %call_id,
                    destination = %destination,
                    error = %err,
                    "Forwarded reply failed"
                );
            }
        });
    }
}
