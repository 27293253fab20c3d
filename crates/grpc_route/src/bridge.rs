//! Outbound stream observers that can be handed to route logic.
//!
//! A [`ResponseObserver`] writes replies back to the caller of a consumer
//! call; a [`RequestObserver`] writes requests onto a producer's client call.
//! Both are cheap handles over one exclusive slot: the first terminal signal
//! closes the stream, and anything after it is rejected as a protocol
//! violation instead of reaching the transport.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_stream::stream;
use bytes::Bytes;
use futures::StreamExt;
use prost::Message;
use tokio::sync::{mpsc, oneshot};
use tonic::Status;
use tracing::{debug, warn};

use crate::error::ObserverError;
use crate::registry::CallId;
use crate::transport::{PayloadStream, ReplyStream};

struct ObserverSlot<T> {
    sender: Mutex<Option<mpsc::UnboundedSender<T>>>,
}

impl<T> ObserverSlot<T> {
    fn new(sender: mpsc::UnboundedSender<T>) -> Self {
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<T>>> {
        self.sender.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send(&self, item: T) -> Result<(), ObserverError> {
        let guard = self.lock();
        let sender = guard.as_ref().ok_or(ObserverError::AlreadyTerminated)?;
        sender.send(item).map_err(|_| ObserverError::Closed)
    }

    /// Take the sender, optionally flushing one last item. Dropping the
    /// sender ends the stream on the receiving side.
    fn terminate(&self, last: Option<T>) -> Result<(), ObserverError> {
        let sender = self.lock().take().ok_or(ObserverError::AlreadyTerminated)?;
        match last {
            Some(item) => sender.send(item).map_err(|_| ObserverError::Closed),
            None => Ok(()),
        }
    }

    fn is_terminated(&self) -> bool {
        self.lock().is_none()
    }
}

fn log_violation(call_id: CallId, role: &str, signal: &str, result: &Result<(), ObserverError>) {
    match result {
        Err(ObserverError::AlreadyTerminated) => warn!(
            call_id = %call_id,
            observer = role,
            signal,
            "Rejected signal on terminated stream observer"
        ),
        Err(ObserverError::Closed) => debug!(
            call_id = %call_id,
            observer = role,
            signal,
            "Stream observer receiver is gone"
        ),
        Ok(()) => {}
    }
}

/// Writes replies of one consumer call back to its caller.
#[derive(Clone)]
pub struct ResponseObserver {
    call_id: CallId,
    slot: Arc<ObserverSlot<Result<Bytes, Status>>>,
}

impl ResponseObserver {
    /// Create an observer and the reply stream it feeds.
    pub fn channel(call_id: CallId) -> (Self, ReplyStream) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let observer = Self {
            call_id,
            slot: Arc::new(ObserverSlot::new(tx)),
        };
        let replies = stream! {
            while let Some(item) = rx.recv().await {
                yield item;
            }
        };
        (observer, replies.boxed())
    }

    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    pub fn on_next(&self, payload: Bytes) -> Result<(), ObserverError> {
        let result = self.slot.send(Ok(payload));
        log_violation(self.call_id, "response", "onNext", &result);
        result
    }

    /// Encode and send a typed reply.
    pub fn on_message<M: Message>(&self, message: &M) -> Result<(), ObserverError> {
        self.on_next(Bytes::from(message.encode_to_vec()))
    }

    pub fn on_error(&self, status: Status) -> Result<(), ObserverError> {
        let result = self.slot.terminate(Some(Err(status)));
        log_violation(self.call_id, "response", "onError", &result);
        result
    }

    pub fn on_completed(&self) -> Result<(), ObserverError> {
        let result = self.slot.terminate(None);
        log_violation(self.call_id, "response", "onCompleted", &result);
        result
    }

    pub fn is_terminated(&self) -> bool {
        self.slot.is_terminated()
    }
}

impl fmt::Debug for ResponseObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseObserver")
            .field("call_id", &self.call_id)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

/// Receives the reason a route aborted a producer call.
pub type CancelSignal = oneshot::Receiver<Status>;

/// Writes requests onto one producer client call.
///
/// Payloads are kept in call order. Once completed or failed, further
/// payloads are rejected with [`ObserverError::AlreadyTerminated`].
#[derive(Clone)]
pub struct RequestObserver {
    call_id: CallId,
    slot: Arc<ObserverSlot<Bytes>>,
    cancel: Arc<Mutex<Option<oneshot::Sender<Status>>>>,
}

impl RequestObserver {
    /// Create an observer, the payload stream handed to the transport, and
    /// the signal fired when the call is aborted via `on_error`.
    pub fn channel(call_id: CallId) -> (Self, PayloadStream, CancelSignal) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let observer = Self {
            call_id,
            slot: Arc::new(ObserverSlot::new(tx)),
            cancel: Arc::new(Mutex::new(Some(cancel_tx))),
        };
        let payloads = stream! {
            while let Some(payload) = rx.recv().await {
                yield payload;
            }
        };
        (observer, payloads.boxed(), cancel_rx)
    }

    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    pub fn on_next(&self, payload: Bytes) -> Result<(), ObserverError> {
        let result = self.slot.send(payload);
        log_violation(self.call_id, "request", "onNext", &result);
        result
    }

    pub fn on_message<M: Message>(&self, message: &M) -> Result<(), ObserverError> {
        self.on_next(Bytes::from(message.encode_to_vec()))
    }

    /// Half-close the request stream.
    pub fn on_completed(&self) -> Result<(), ObserverError> {
        let result = self.slot.terminate(None);
        log_violation(self.call_id, "request", "onCompleted", &result);
        result
    }

    /// Close the request stream and cancel the call.
    pub fn on_error(&self, status: Status) -> Result<(), ObserverError> {
        let result = self.slot.terminate(None);
        log_violation(self.call_id, "request", "onError", &result);
        if result.is_err() {
            return result;
        }

        let cancel = self
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(cancel) = cancel {
            // The call may already be finished, in which case nobody listens.
            let _ = cancel.send(status);
        }
        result
    }

    pub fn is_terminated(&self) -> bool {
        self.slot.is_terminated()
    }
}

impl fmt::Debug for RequestObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestObserver")
            .field("call_id", &self.call_id)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_response_observer_delivers_in_order_then_closes() {
        let (observer, replies) = ResponseObserver::channel(CallId::new());

        observer.on_next(Bytes::from_static(b"a")).unwrap();
        observer.on_next(Bytes::from_static(b"b")).unwrap();
        observer.on_completed().unwrap();

        let items: Vec<_> = replies.collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), &Bytes::from_static(b"a"));
        assert_eq!(items[1].as_ref().unwrap(), &Bytes::from_static(b"b"));
    }

    #[tokio::test]
    async fn test_response_observer_rejects_double_completion() {
        let (observer, replies) = ResponseObserver::channel(CallId::new());
        let clone = observer.clone();

        observer.on_completed().unwrap();
        assert_eq!(clone.on_completed(), Err(ObserverError::AlreadyTerminated));
        assert_eq!(
            clone.on_error(Status::internal("late")),
            Err(ObserverError::AlreadyTerminated)
        );
        assert_eq!(
            clone.on_next(Bytes::from_static(b"late")),
            Err(ObserverError::AlreadyTerminated)
        );
        assert!(clone.is_terminated());

        let items: Vec<_> = replies.collect().await;
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn test_response_observer_error_is_last_item() {
        let (observer, replies) = ResponseObserver::channel(CallId::new());

        observer.on_next(Bytes::from_static(b"a")).unwrap();
        observer.on_error(Status::aborted("boom")).unwrap();

        let items: Vec<_> = replies.collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].as_ref().unwrap_err().code(), tonic::Code::Aborted);
    }

    #[tokio::test]
    async fn test_response_observer_reports_closed_receiver() {
        let (observer, replies) = ResponseObserver::channel(CallId::new());
        drop(replies);

        assert_eq!(
            observer.on_next(Bytes::from_static(b"a")),
            Err(ObserverError::Closed)
        );
    }

    #[tokio::test]
    async fn test_request_observer_rejects_append_after_completion() {
        let (observer, payloads, _cancel) = RequestObserver::channel(CallId::new());

        observer.on_next(Bytes::from_static(b"1")).unwrap();
        observer.on_completed().unwrap();
        assert_eq!(
            observer.on_next(Bytes::from_static(b"2")),
            Err(ObserverError::AlreadyTerminated)
        );

        let items: Vec<_> = payloads.collect().await;
        assert_eq!(items, vec![Bytes::from_static(b"1")]);
    }

    #[tokio::test]
    async fn test_request_observer_error_fires_cancel_once() {
        let (observer, payloads, cancel) = RequestObserver::channel(CallId::new());

        observer.on_error(Status::cancelled("route gave up")).unwrap();
        assert_eq!(
            observer.on_error(Status::cancelled("again")),
            Err(ObserverError::AlreadyTerminated)
        );

        let status = cancel.await.unwrap();
        assert_eq!(status.message(), "route gave up");
        let items: Vec<_> = payloads.collect().await;
        assert!(items.is_empty());
    }
}
