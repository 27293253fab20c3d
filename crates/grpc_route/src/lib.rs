//! Bridges gRPC calls and a message routing engine in both directions.
//!
//! A [`GrpcConsumer`] turns inbound calls into units of work; a
//! [`GrpcProducer`] invokes remote methods for units of work, optionally
//! routing streamed replies to another destination.

pub mod bridge;
pub mod config;
pub mod consumer;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod path;
pub mod producer;
pub mod registry;
pub mod transport;

pub use bridge::{RequestObserver, ResponseObserver};
pub use config::{ConsumerStrategy, GrpcConfiguration, GrpcEndpoint, ProducerStrategy};
pub use consumer::{ConsumerService, GrpcConsumer, ServerCallAdapter, TypedReplyStream};
pub use engine::{Completion, Route, RouteContext, RouteEngine, processor_fn};
pub use error::{ClientError, ConfigError, ObserverError, PathError, ProducerError, RouteError};
pub use exchange::{Body, EventType, Exchange, Property};
pub use path::{CallShape, Cardinality, GrpcPath, MethodDescriptor};
pub use producer::{GrpcProducer, RequestStream};
pub use registry::{CallId, CallRegistry};
pub use transport::{ChannelTransport, ClientTransport, LoopbackTransport, ReplyStream};
