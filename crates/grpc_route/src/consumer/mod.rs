//! Server side: turns inbound gRPC stream events into units of work.

mod adapter;
mod binding;
mod service;
mod strategy;

pub use adapter::ServerCallAdapter;
pub use binding::{GrpcConsumer, TypedReplyStream};
pub use service::ConsumerService;
