//! The unit of work passed between the gRPC adapters and the routing engine.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use prost::Message;
use tonic::Status;
use uuid::Uuid;

use crate::bridge::{RequestObserver, ResponseObserver};

/// Header carrying the gRPC method name that produced the exchange.
pub const GRPC_METHOD_NAME: &str = "GrpcMethodName";
/// Header carrying the stream event kind (`onNext`, `onCompleted`, `onError`).
pub const GRPC_EVENT_TYPE: &str = "GrpcEventType";
/// Header tying a forwarded reply back to the call that produced it.
pub const GRPC_CORRELATION_ID: &str = "GrpcCorrelationId";
/// Property holding the live [`ResponseObserver`] of a delegated consumer call.
pub const GRPC_RESPONSE_OBSERVER: &str = "GrpcResponseObserver";
/// Property holding the live [`RequestObserver`] of a route-controlled producer call.
pub const GRPC_REQUEST_OBSERVER: &str = "GrpcRequestObserver";

/// Kind of stream event an exchange represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    OnNext,
    OnCompleted,
    OnError,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::OnNext => "onNext",
            EventType::OnCompleted => "onCompleted",
            EventType::OnError => "onError",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "onNext" => Ok(EventType::OnNext),
            "onCompleted" => Ok(EventType::OnCompleted),
            "onError" => Ok(EventType::OnError),
            other => Err(format!("unknown event type '{other}'")),
        }
    }
}

/// Exchange payload. Messages are prost-encoded bytes.
#[derive(Debug, Clone, Default)]
pub enum Body {
    #[default]
    Empty,
    Message(Bytes),
    Messages(Vec<Bytes>),
    Error(Status),
}

impl Body {
    /// Turn the body into the list of replies to send, or the error to signal.
    pub fn into_replies(self) -> Result<Vec<Bytes>, Status> {
        match self {
            Body::Empty => Ok(Vec::new()),
            Body::Message(payload) => Ok(vec![payload]),
            Body::Messages(payloads) => Ok(payloads),
            Body::Error(status) => Err(status),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Body::Empty => true,
            Body::Messages(payloads) => payloads.is_empty(),
            Body::Message(_) | Body::Error(_) => false,
        }
    }
}

/// An exchange property value.
#[derive(Debug, Clone)]
pub enum Property {
    Text(String),
    Flag(bool),
    Response(ResponseObserver),
    Request(RequestObserver),
}

impl From<&str> for Property {
    fn from(value: &str) -> Self {
        Property::Text(value.to_owned())
    }
}

impl From<String> for Property {
    fn from(value: String) -> Self {
        Property::Text(value)
    }
}

impl From<bool> for Property {
    fn from(value: bool) -> Self {
        Property::Flag(value)
    }
}

/// One unit of work: a body plus headers (per message) and properties (per exchange).
#[derive(Debug, Clone)]
pub struct Exchange {
    id: Uuid,
    headers: HashMap<String, String>,
    properties: HashMap<String, Property>,
    body: Body,
}

impl Exchange {
    pub fn new(body: Body) -> Self {
        Self {
            id: Uuid::new_v4(),
            headers: HashMap::new(),
            properties: HashMap::new(),
            body,
        }
    }

    /// An exchange for one stream event of `method`.
    pub fn event(kind: EventType, method: &str, body: Body) -> Self {
        let mut exchange = Self::new(body);
        exchange.set_header(GRPC_EVENT_TYPE, kind.as_str());
        exchange.set_header(GRPC_METHOD_NAME, method);
        exchange
    }

    /// An exchange whose body is the encoded `message`.
    pub fn from_message<M: Message>(message: &M) -> Self {
        Self::new(Body::Message(Bytes::from(message.encode_to_vec())))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut Body {
        &mut self.body
    }

    pub fn set_body(&mut self, body: Body) {
        self.body = body;
    }

    pub fn take_body(&mut self) -> Body {
        std::mem::take(&mut self.body)
    }

    pub fn into_body(self) -> Body {
        self.body
    }

    pub fn with_body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    pub fn with_message<M: Message>(self, message: &M) -> Self {
        self.with_body(Body::Message(Bytes::from(message.encode_to_vec())))
    }

    pub fn with_messages<M: Message>(self, messages: &[M]) -> Self {
        let payloads = messages
            .iter()
            .map(|m| Bytes::from(m.encode_to_vec()))
            .collect();
        self.with_body(Body::Messages(payloads))
    }

    /// Decode a single-message body.
    pub fn decode<M: Message + Default>(&self) -> Result<M, Status> {
        match &self.body {
            Body::Message(payload) => decode_payload(payload),
            Body::Messages(payloads) if payloads.len() == 1 => decode_payload(&payloads[0]),
            other => Err(Status::invalid_argument(format!(
                "expected a single message body, got {}",
                body_kind(other)
            ))),
        }
    }

    /// Decode every message of the body, in order.
    pub fn decode_all<M: Message + Default>(&self) -> Result<Vec<M>, Status> {
        match &self.body {
            Body::Empty => Ok(Vec::new()),
            Body::Message(payload) => Ok(vec![decode_payload(payload)?]),
            Body::Messages(payloads) => payloads.iter().map(decode_payload).collect(),
            Body::Error(status) => Err(status.clone()),
        }
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(key.into(), value.into());
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn property(&self, key: &str) -> Option<&Property> {
        self.properties.get(key)
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<Property>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn remove_property(&mut self, key: &str) -> Option<Property> {
        self.properties.remove(key)
    }

    pub fn properties(&self) -> &HashMap<String, Property> {
        &self.properties
    }

    /// Copy every property of `other` into this exchange, overwriting on conflict.
    pub fn inherit_properties(&mut self, other: &Exchange) {
        for (key, value) in &other.properties {
            self.properties.insert(key.clone(), value.clone());
        }
    }

    pub fn event_type(&self) -> Option<EventType> {
        self.header(GRPC_EVENT_TYPE).and_then(|v| v.parse().ok())
    }

    pub fn method_name(&self) -> Option<&str> {
        self.header(GRPC_METHOD_NAME)
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.header(GRPC_CORRELATION_ID)
    }

    /// The live reply observer, present on delegated consumer exchanges.
    pub fn response_observer(&self) -> Option<&ResponseObserver> {
        match self.properties.get(GRPC_RESPONSE_OBSERVER) {
            Some(Property::Response(observer)) => Some(observer),
            _ => None,
        }
    }

    /// The live request observer, present on route-controlled producer exchanges.
    pub fn request_observer(&self) -> Option<&RequestObserver> {
        match self.properties.get(GRPC_REQUEST_OBSERVER) {
            Some(Property::Request(observer)) => Some(observer),
            _ => None,
        }
    }
}

impl Default for Exchange {
    fn default() -> Self {
        Self::new(Body::Empty)
    }
}

fn decode_payload<M: Message + Default>(payload: &Bytes) -> Result<M, Status> {
    M::decode(payload.clone())
        .map_err(|e| Status::invalid_argument(format!("failed to decode message: {e}")))
}

fn body_kind(body: &Body) -> &'static str {
    match body {
        Body::Empty => "an empty body",
        Body::Message(_) => "a message",
        Body::Messages(_) => "a message list",
        Body::Error(_) => "an error",
    }
}
