pub mod pingpong;

pub use pingpong::{PingPongHandlers, PingRequest, PongResponse};
