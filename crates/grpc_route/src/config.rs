use std::fmt;
use std::str::FromStr;

use url::Url;

use crate::error::{ConfigError, PathError};
use crate::path::GrpcPath;

/// How a consumer turns inbound stream events into units of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConsumerStrategy {
    /// Collapse the whole call into one unit of work.
    Aggregation,
    /// One unit of work per inbound event.
    #[default]
    Propagation,
    /// One unit of work per inbound event, with the reply observer handed to the route.
    Delegation,
}

impl fmt::Display for ConsumerStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConsumerStrategy::Aggregation => "AGGREGATION",
            ConsumerStrategy::Propagation => "PROPAGATION",
            ConsumerStrategy::Delegation => "DELEGATION",
        })
    }
}

impl FromStr for ConsumerStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "AGGREGATION" => Ok(ConsumerStrategy::Aggregation),
            "PROPAGATION" => Ok(ConsumerStrategy::Propagation),
            "DELEGATION" => Ok(ConsumerStrategy::Delegation),
            _ => Err(invalid("consumerStrategy", s)),
        }
    }
}

/// How a producer handles the replies of the remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProducerStrategy {
    /// Wait for every reply and return them as the unit-of-work result.
    #[default]
    Simple,
    /// Forward each reply to `stream_replies_to` as it arrives.
    Streaming,
}

impl fmt::Display for ProducerStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProducerStrategy::Simple => "SIMPLE",
            ProducerStrategy::Streaming => "STREAMING",
        })
    }
}

impl FromStr for ProducerStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SIMPLE" | "DEFAULT" => Ok(ProducerStrategy::Simple),
            "STREAMING" => Ok(ProducerStrategy::Streaming),
            _ => Err(invalid("producerStrategy", s)),
        }
    }
}

/// Configuration for a gRPC endpoint. Immutable once the endpoint is built.
#[derive(Debug, Clone, Default)]
pub struct GrpcConfiguration {
    pub consumer_strategy: ConsumerStrategy,
    pub producer_strategy: ProducerStrategy,

    /// Method invoked by a producer.
    pub method: Option<String>,

    /// Forward inbound `onCompleted` as a unit of work tagged `onCompleted`.
    pub forward_on_completed: bool,

    /// Forward inbound `onError` as a unit of work tagged `onError`.
    pub forward_on_error: bool,

    /// The route, not the adapter, drives the outbound stream observer.
    pub route_controlled_stream_observer: bool,

    /// Destination receiving replies of a STREAMING producer.
    pub stream_replies_to: Option<String>,

    /// Copy the originating exchange's properties onto each forwarded reply.
    pub inherit_exchange_properties_for_replies: bool,

    /// ASCII metadata attached to every client call.
    pub metadata: Vec<(String, String)>,
}

impl GrpcConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_consumer_strategy(mut self, strategy: ConsumerStrategy) -> Self {
        self.consumer_strategy = strategy;
        self
    }

    pub fn with_producer_strategy(mut self, strategy: ProducerStrategy) -> Self {
        self.producer_strategy = strategy;
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn with_forward_on_completed(mut self, forward: bool) -> Self {
        self.forward_on_completed = forward;
        self
    }

    pub fn with_forward_on_error(mut self, forward: bool) -> Self {
        self.forward_on_error = forward;
        self
    }

    pub fn with_route_controlled_stream_observer(mut self, route_controlled: bool) -> Self {
        self.route_controlled_stream_observer = route_controlled;
        self
    }

    pub fn with_stream_replies_to(mut self, destination: impl Into<String>) -> Self {
        self.stream_replies_to = Some(destination.into());
        self
    }

    pub fn with_inherit_exchange_properties_for_replies(mut self, inherit: bool) -> Self {
        self.inherit_exchange_properties_for_replies = inherit;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.push((key.into(), value.into()));
        self
    }

    /// Static checks for a consumer endpoint.
    pub fn validate_consumer(&self) -> Result<(), ConfigError> {
        match (
            self.consumer_strategy,
            self.route_controlled_stream_observer,
        ) {
            (ConsumerStrategy::Aggregation, true) => {
                Err(ConfigError::AggregationWithRouteControlledObserver)
            }
            (ConsumerStrategy::Delegation, false) => {
                Err(ConfigError::DelegationWithoutRouteControlledObserver)
            }
            _ => Ok(()),
        }
    }

    /// Static checks for a producer endpoint.
    pub fn validate_producer(&self) -> Result<(), ConfigError> {
        if self.method.as_deref().is_none_or(str::is_empty) {
            return Err(ConfigError::MissingMethod);
        }
        if self.producer_strategy == ProducerStrategy::Streaming
            && self.stream_replies_to.as_deref().is_none_or(str::is_empty)
        {
            return Err(ConfigError::MissingStreamRepliesTo);
        }
        Ok(())
    }

    /// Apply one `name=value` endpoint option.
    pub fn apply_option(&mut self, name: &str, value: &str) -> Result<(), ConfigError> {
        match name {
            "method" => self.method = Some(value.to_owned()),
            "consumerStrategy" => self.consumer_strategy = value.parse()?,
            "producerStrategy" => self.producer_strategy = value.parse()?,
            "forwardOnCompleted" => self.forward_on_completed = parse_bool(name, value)?,
            "forwardOnError" => self.forward_on_error = parse_bool(name, value)?,
            "routeControlledStreamObserver" => {
                self.route_controlled_stream_observer = parse_bool(name, value)?
            }
            "streamRepliesTo" => self.stream_replies_to = Some(value.to_owned()),
            "inheritExchangePropertiesForReplies" => {
                self.inherit_exchange_properties_for_replies = parse_bool(name, value)?
            }
            other => return Err(ConfigError::UnknownOption(other.to_owned())),
        }
        Ok(())
    }
}

fn parse_bool(option: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(invalid(option, value)),
    }
}

fn invalid(option: &str, value: &str) -> ConfigError {
    ConfigError::InvalidOption {
        option: option.to_owned(),
        value: value.to_owned(),
    }
}

/// An endpoint URI: `grpc://{host}:{port}/{package}.{service}?{options}`
#[derive(Debug, Clone)]
pub struct GrpcEndpoint {
    pub host: String,
    pub port: u16,
    pub service: String,
    pub config: GrpcConfiguration,
}

impl GrpcEndpoint {
    pub fn parse(uri: &str) -> Result<Self, ConfigError> {
        let url = Url::parse(uri).map_err(|e| uri_error(uri, e.to_string()))?;
        if url.scheme() != "grpc" {
            return Err(uri_error(uri, format!("unsupported scheme '{}'", url.scheme())));
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| uri_error(uri, "missing host".to_owned()))?
            .to_owned();
        let port = url
            .port()
            .ok_or_else(|| uri_error(uri, "missing port".to_owned()))?;

        let service = url.path().trim_start_matches('/').to_owned();
        if !service.contains('.') {
            return Err(uri_error(
                uri,
                format!("service must be package.Service: '{service}'"),
            ));
        }

        let mut config = GrpcConfiguration::default();
        for (name, value) in url.query_pairs() {
            config.apply_option(&name, &value)?;
        }

        Ok(Self {
            host,
            port,
            service,
            config,
        })
    }

    /// The address to dial, e.g. `http://localhost:50051`.
    pub fn address(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// The path of the configured producer method.
    pub fn method_path(&self) -> Result<GrpcPath, ConfigError> {
        let method = self.config.method.as_deref().ok_or(ConfigError::MissingMethod)?;
        Ok(GrpcPath::from_service(&self.service, method)?)
    }
}

fn uri_error(uri: &str, reason: String) -> ConfigError {
    ConfigError::Path(PathError::Uri {
        uri: uri.to_owned(),
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_strategies() {
        let config = GrpcConfiguration::default();
        assert_eq!(config.consumer_strategy, ConsumerStrategy::Propagation);
        assert_eq!(config.producer_strategy, ProducerStrategy::Simple);
        assert!(config.validate_consumer().is_ok());
    }

    #[test]
    fn test_aggregation_with_route_controlled_observer_rejected() {
        let config = GrpcConfiguration::new()
            .with_consumer_strategy(ConsumerStrategy::Aggregation)
            .with_route_controlled_stream_observer(true);
        assert!(matches!(
            config.validate_consumer(),
            Err(ConfigError::AggregationWithRouteControlledObserver)
        ));
    }

    #[test]
    fn test_delegation_requires_route_controlled_observer() {
        let config = GrpcConfiguration::new().with_consumer_strategy(ConsumerStrategy::Delegation);
        assert!(matches!(
            config.validate_consumer(),
            Err(ConfigError::DelegationWithoutRouteControlledObserver)
        ));
        assert!(
            config
                .with_route_controlled_stream_observer(true)
                .validate_consumer()
                .is_ok()
        );
    }

    #[test]
    fn test_streaming_producer_requires_destination() {
        let config = GrpcConfiguration::new()
            .with_method("PingAsyncAsync")
            .with_producer_strategy(ProducerStrategy::Streaming);
        assert!(matches!(
            config.validate_producer(),
            Err(ConfigError::MissingStreamRepliesTo)
        ));
        assert!(
            config
                .with_stream_replies_to("direct:replies")
                .validate_producer()
                .is_ok()
        );
    }

    #[test]
    fn test_producer_requires_method() {
        assert!(matches!(
            GrpcConfiguration::new().validate_producer(),
            Err(ConfigError::MissingMethod)
        ));
    }

    #[test]
    fn test_parse_endpoint_uri() {
        let endpoint = GrpcEndpoint::parse(
            "grpc://localhost:50051/pingpong.PingPong?method=PingAsyncAsync\
             &producerStrategy=STREAMING&streamRepliesTo=direct:replies\
             &forwardOnCompleted=true&inheritExchangePropertiesForReplies=true",
        )
        .unwrap();

        assert_eq!(endpoint.host, "localhost");
        assert_eq!(endpoint.port, 50051);
        assert_eq!(endpoint.address(), "http://localhost:50051");
        assert_eq!(endpoint.service, "pingpong.PingPong");
        assert_eq!(endpoint.config.producer_strategy, ProducerStrategy::Streaming);
        assert_eq!(
            endpoint.config.stream_replies_to.as_deref(),
            Some("direct:replies")
        );
        assert!(endpoint.config.forward_on_completed);
        assert!(endpoint.config.inherit_exchange_properties_for_replies);
        assert_eq!(
            endpoint.method_path().unwrap().full_path(),
            "pingpong.PingPong/PingAsyncAsync"
        );
    }

    #[test]
    fn test_parse_consumer_options() {
        let endpoint = GrpcEndpoint::parse(
            "grpc://0.0.0.0:8080/pingpong.PingPong?consumerStrategy=delegation\
             &routeControlledStreamObserver=true&forwardOnError=true",
        )
        .unwrap();
        assert_eq!(endpoint.config.consumer_strategy, ConsumerStrategy::Delegation);
        assert!(endpoint.config.route_controlled_stream_observer);
        assert!(endpoint.config.forward_on_error);
        assert!(endpoint.config.validate_consumer().is_ok());
    }

    #[test]
    fn test_parse_rejects_bad_options() {
        assert!(matches!(
            GrpcEndpoint::parse("grpc://localhost:1/a.B?bogus=1"),
            Err(ConfigError::UnknownOption(_))
        ));
        assert!(matches!(
            GrpcEndpoint::parse("grpc://localhost:1/a.B?forwardOnError=yes"),
            Err(ConfigError::InvalidOption { .. })
        ));
        assert!(matches!(
            GrpcEndpoint::parse("grpc://localhost:1/a.B?consumerStrategy=FANOUT"),
            Err(ConfigError::InvalidOption { .. })
        ));
        assert!(GrpcEndpoint::parse("http://localhost:1/a.B").is_err());
        assert!(GrpcEndpoint::parse("grpc://localhost/a.B").is_err());
        assert!(GrpcEndpoint::parse("grpc://localhost:1/NoPackage").is_err());
    }
}
