use thiserror::Error;
use tonic::Status;

/// Errors that can occur while parsing gRPC method paths or endpoint URIs.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PathError {
    #[error("invalid gRPC path: {0}")]
    Invalid(String),

    #[error("invalid endpoint uri '{uri}': {reason}")]
    Uri { uri: String, reason: String },
}

/// Static configuration errors, detected when an endpoint is constructed.
///
/// An endpoint that fails with one of these must not start.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// Aggregation already owns the terminal reply, so the route cannot control the observer.
    #[error("AGGREGATION consumer strategy cannot be combined with routeControlledStreamObserver")]
    AggregationWithRouteControlledObserver,

    /// Delegation hands reply dispatch to the route, which requires a route-controlled observer.
    #[error("DELEGATION consumer strategy requires routeControlledStreamObserver=true")]
    DelegationWithoutRouteControlledObserver,

    /// The STREAMING producer strategy needs somewhere to send replies.
    #[error("STREAMING producer strategy requires streamRepliesTo")]
    MissingStreamRepliesTo,

    /// `streamRepliesTo` names a destination with no registered route.
    #[error("no route registered for streamRepliesTo destination '{0}'")]
    UnknownDestination(String),

    /// The producer has no method to invoke.
    #[error("producer endpoint requires a method")]
    MissingMethod,

    #[error("unknown value '{value}' for option '{option}'")]
    InvalidOption { option: String, value: String },

    #[error("unknown endpoint option '{0}'")]
    UnknownOption(String),

    #[error(transparent)]
    Path(#[from] PathError),
}

/// Errors reported by the routing engine for a unit of work.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum RouteError {
    /// The route processed the exchange and failed.
    #[error("unit of work failed: {0}")]
    Failed(Status),

    /// The completion channel closed before a result was delivered.
    #[error("unit of work was cancelled before completing")]
    Cancelled,

    /// The processor panicked while running the unit of work.
    #[error("route processor panicked")]
    Panicked,

    /// The route is not accepting new units of work.
    #[error("route '{0}' is stopped")]
    Stopped(String),

    /// No route is registered under the given destination.
    #[error("no route registered for '{0}'")]
    NoRoute(String),
}

impl RouteError {
    /// Convert into the status sent to a gRPC peer.
    pub fn into_status(self) -> Status {
        match self {
            RouteError::Failed(status) => status,
            RouteError::Cancelled => Status::cancelled("unit of work was cancelled"),
            RouteError::Panicked => Status::internal("route processor panicked"),
            RouteError::Stopped(route) => Status::unavailable(format!("route '{route}' is stopped")),
            RouteError::NoRoute(route) => Status::unimplemented(format!("no route for '{route}'")),
        }
    }
}

impl From<Status> for RouteError {
    fn from(status: Status) -> Self {
        RouteError::Failed(status)
    }
}

/// Protocol violations on a stream observer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ObserverError {
    /// A terminal signal was already delivered on this observer.
    #[error("stream observer already terminated")]
    AlreadyTerminated,

    /// The receiving side of the stream went away.
    #[error("stream observer receiver closed")]
    Closed,
}

impl ObserverError {
    pub fn into_status(self) -> Status {
        match self {
            ObserverError::AlreadyTerminated => {
                Status::failed_precondition("stream observer already terminated")
            }
            ObserverError::Closed => Status::cancelled("stream observer receiver closed"),
        }
    }
}

/// Errors that can occur while a producer invokes a remote method.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProducerError {
    /// The exchange body cannot be sent on this call shape.
    #[error("unsupported request body: {0}")]
    UnsupportedBody(String),

    /// A payload was appended after the request stream recorded its terminal marker.
    #[error("request stream already terminated; payload rejected")]
    AppendAfterTerminal,

    /// The remote call failed (transport or application level).
    #[error("gRPC call failed: {0}")]
    Call(#[from] Status),

    #[error(transparent)]
    Route(#[from] RouteError),
}

impl ProducerError {
    pub fn into_status(self) -> Status {
        match self {
            ProducerError::UnsupportedBody(msg) => Status::invalid_argument(msg),
            ProducerError::AppendAfterTerminal => {
                Status::failed_precondition("request stream already terminated")
            }
            ProducerError::Call(status) => status,
            ProducerError::Route(e) => e.into_status(),
        }
    }
}

impl From<ObserverError> for ProducerError {
    fn from(err: ObserverError) -> Self {
        match err {
            ObserverError::AlreadyTerminated => ProducerError::AppendAfterTerminal,
            ObserverError::Closed => ProducerError::Call(err.into_status()),
        }
    }
}

/// Errors that can occur while setting up a client channel.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    #[error("invalid uri '{addr}': {reason}")]
    InvalidUri { addr: String, reason: String },

    #[error("failed to connect: {0}")]
    ConnectionFailed(#[from] tonic::transport::Error),

    #[error("invalid metadata key '{0}'")]
    InvalidMetadataKey(String),

    #[error("invalid metadata value for key '{0}'")]
    InvalidMetadataValue(String),
}
