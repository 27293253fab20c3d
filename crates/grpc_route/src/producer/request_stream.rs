use bytes::Bytes;
use tonic::Status;

use crate::bridge::RequestObserver;
use crate::error::ProducerError;
use crate::exchange::Body;
use crate::path::CallShape;

/// The terminal marker of a [`RequestStream`].
#[derive(Debug, Clone)]
pub enum RequestTerminal {
    Completed,
    Failed(Status),
}

/// Ordered outbound payloads of one client call plus at most one terminal marker.
///
/// Appending after the marker is rejected with
/// [`ProducerError::AppendAfterTerminal`].
#[derive(Debug, Default)]
pub struct RequestStream {
    payloads: Vec<Bytes>,
    terminal: Option<RequestTerminal>,
}

impl RequestStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the request payloads of an exchange body for a call of `shape`.
    ///
    /// A unary request takes exactly one message. A streaming request takes
    /// any number, including none.
    pub fn from_body(body: Body, shape: CallShape) -> Result<Self, ProducerError> {
        let payloads = match body {
            Body::Message(payload) => vec![payload],
            Body::Messages(payloads) if shape.streaming_request() || payloads.len() == 1 => {
                payloads
            }
            Body::Messages(payloads) => {
                return Err(ProducerError::UnsupportedBody(format!(
                    "{shape} call takes one request message, got {}",
                    payloads.len()
                )));
            }
            Body::Empty if shape.streaming_request() => Vec::new(),
            Body::Empty => {
                return Err(ProducerError::UnsupportedBody(format!(
                    "{shape} call needs a request message"
                )));
            }
            Body::Error(status) => {
                return Err(ProducerError::UnsupportedBody(format!(
                    "cannot send an error body: {status}"
                )));
            }
        };

        Ok(Self {
            payloads,
            terminal: None,
        })
    }

    pub fn push(&mut self, payload: Bytes) -> Result<(), ProducerError> {
        if self.terminal.is_some() {
            return Err(ProducerError::AppendAfterTerminal);
        }
        self.payloads.push(payload);
        Ok(())
    }

    pub fn complete(&mut self) -> Result<(), ProducerError> {
        self.terminate(RequestTerminal::Completed)
    }

    pub fn fail(&mut self, status: Status) -> Result<(), ProducerError> {
        self.terminate(RequestTerminal::Failed(status))
    }

    fn terminate(&mut self, terminal: RequestTerminal) -> Result<(), ProducerError> {
        if self.terminal.is_some() {
            return Err(ProducerError::AppendAfterTerminal);
        }
        self.terminal = Some(terminal);
        Ok(())
    }

    pub fn is_terminated(&self) -> bool {
        self.terminal.is_some()
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    /// Send every payload in order, then the terminal marker if one was recorded.
    /// Without a marker the request stream stays open for the route.
    pub fn flush(self, observer: &RequestObserver) -> Result<(), ProducerError> {
        for payload in self.payloads {
            observer.on_next(payload)?;
        }
        match self.terminal {
            Some(RequestTerminal::Completed) => observer.on_completed()?,
            Some(RequestTerminal::Failed(status)) => observer.on_error(status)?,
            None => {}
        }
        Ok(())
    }
}
