use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use bytes::Bytes;
use tonic::Status;
use tracing::{debug, error, trace, warn};

use crate::consumer::strategy::{CallContext, CallStrategy, Terminal};
use crate::path::CallShape;
use crate::registry::{CallGuard, CallId};

/// The observer the transport drives for one inbound call.
///
/// Events are dispatched to the call's strategy without waiting on the
/// routing engine. After the first terminal signal the call is closed:
/// later events are logged and ignored. A call whose outbound stream has
/// already ended, or whose dispatch panicked, is closed the same way.
///
/// Dropping an adapter before its terminal signal fails the caller with
/// `CANCELLED`, so an abandoned call never looks like a success.
pub struct ServerCallAdapter {
    context: Arc<CallContext>,
    strategy: CallStrategy,
    // Present until the call is closed.
    guard: Option<CallGuard>,
    // Closed without an inbound terminal signal.
    closed_early: bool,
}

impl ServerCallAdapter {
    pub(crate) fn new(context: CallContext, guard: CallGuard) -> Self {
        let context = Arc::new(context);
        let strategy = CallStrategy::for_call(&context);
        Self {
            context,
            strategy,
            guard: Some(guard),
            closed_early: false,
        }
    }

    pub fn call_id(&self) -> CallId {
        self.context.call_id
    }

    pub fn method(&self) -> &str {
        &self.context.method
    }

    pub fn shape(&self) -> CallShape {
        self.context.shape
    }

    /// True once the call is closed: a terminal signal arrived, the outbound
    /// stream ended first, or dispatch failed.
    pub fn is_terminal(&self) -> bool {
        self.guard.is_none()
    }

    pub fn on_next(&mut self, payload: Bytes) {
        if self.is_terminal() {
            self.ignore("onNext");
            return;
        }
        if self.context.observer.is_terminated() {
            debug!(
                call_id = %self.context.call_id,
                method = %self.context.method,
                "Outbound stream already ended; closing call"
            );
            self.close_early();
            return;
        }

        trace!(call_id = %self.context.call_id, len = payload.len(), "onNext");
        let (context, strategy) = (&self.context, &mut self.strategy);
        let dispatched =
            panic::catch_unwind(AssertUnwindSafe(|| strategy.on_next(context, payload)));
        if dispatched.is_err() {
            self.abort("onNext");
        }
    }

    pub fn on_error(&mut self, status: Status) {
        self.finish(Terminal::Failed(status));
    }

    pub fn on_completed(&mut self) {
        self.finish(Terminal::Completed);
    }

    fn finish(&mut self, terminal: Terminal) {
        let signal = terminal.signal();
        let Some(guard) = self.guard.take() else {
            self.ignore(signal);
            return;
        };

        debug!(
            call_id = %self.context.call_id,
            method = %self.context.method,
            signal,
            "Inbound call finished"
        );
        let (context, strategy) = (&self.context, &mut self.strategy);
        let dispatched =
            panic::catch_unwind(AssertUnwindSafe(|| strategy.finish(context, terminal, guard)));
        if dispatched.is_err() {
            self.abort(signal);
        }
    }

    fn ignore(&self, signal: &'static str) {
        if self.closed_early {
            debug!(
                call_id = %self.context.call_id,
                signal,
                "Ignoring signal on closed call"
            );
        } else {
            warn!(
                call_id = %self.context.call_id,
                method = %self.context.method,
                signal,
                "Ignoring signal after terminal signal"
            );
        }
    }

    fn close_early(&mut self) {
        self.guard = None;
        self.closed_early = true;
    }

    /// Dispatch panicked: fail the caller instead of letting the stream end cleanly.
    fn abort(&mut self, signal: &'static str) {
        error!(
            call_id = %self.context.call_id,
            method = %self.context.method,
            signal,
            "Dispatch panicked; failing call"
        );
        self.context
            .fail(Status::internal(format!("failed to dispatch {signal}")));
        self.close_early();
    }
}

impl Drop for ServerCallAdapter {
    fn drop(&mut self) {
        if self.guard.is_some() {
            warn!(
                call_id = %self.context.call_id,
                method = %self.context.method,
                "Call dropped before its terminal signal"
            );
            self.context
                .fail(Status::cancelled("call dropped before it finished"));
        }
    }
}

impl fmt::Debug for ServerCallAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCallAdapter")
            .field("call_id", &self.context.call_id)
            .field("method", &self.context.method)
            .field("shape", &self.context.shape)
            .field("terminal", &self.is_terminal())
            .finish()
    }
}
