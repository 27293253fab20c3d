//! Client side: invokes remote methods for units of work.

mod invoker;
mod reply_router;
mod request_stream;

pub use invoker::GrpcProducer;
pub use request_stream::{RequestStream, RequestTerminal};
