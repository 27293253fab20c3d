use std::fmt;
use std::str::FromStr;

use tonic::codegen::http::uri::PathAndQuery;

use crate::error::PathError;

/// Method path of a gRPC call, as it appears on the wire without the
/// leading slash (`pingpong.PingPong/PingSyncSync`).
///
/// The package may itself be dotted; the service is whatever follows the
/// last dot before the slash.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GrpcPath {
    pub package: String,
    pub service: String,
    pub method: String,
}

impl GrpcPath {
    pub fn parse(path: &str) -> Result<Self, PathError> {
        let trimmed = path.trim_start_matches('/');
        match trimmed.rsplit_once('/') {
            Some((full_service, method)) => Self::from_service(full_service, method),
            None => Err(PathError::Invalid(format!("no method in '{path}'"))),
        }
    }

    /// Join a `package.Service` name with a method name.
    pub fn from_service(full_service: &str, method: &str) -> Result<Self, PathError> {
        let Some((package, service)) = full_service.rsplit_once('.') else {
            return Err(PathError::Invalid(format!(
                "service '{full_service}' is not qualified by a package"
            )));
        };
        if [package, service, method].iter().any(|part| part.is_empty()) {
            return Err(PathError::Invalid(format!(
                "empty segment in '{full_service}/{method}'"
            )));
        }

        Ok(GrpcPath {
            package: package.to_owned(),
            service: service.to_owned(),
            method: method.to_owned(),
        })
    }

    /// `package.Service`, the key services are bound under.
    pub fn full_service(&self) -> String {
        format!("{}.{}", self.package, self.service)
    }

    pub fn full_path(&self) -> String {
        format!("{}/{}", self.full_service(), self.method)
    }

    /// Request path a tonic client sends and a tonic server routes on.
    pub fn http_path(&self) -> Result<PathAndQuery, PathError> {
        let path = format!("/{}", self.full_path());
        PathAndQuery::from_str(&path).map_err(|e| PathError::Invalid(format!("{path}: {e}")))
    }
}

impl fmt::Display for GrpcPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_path())
    }
}

/// Whether one side of a call carries a single message or a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cardinality {
    Unary,
    Streaming,
}

/// The shape of a gRPC call: request cardinality × response cardinality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallShape {
    pub request: Cardinality,
    pub response: Cardinality,
}

impl CallShape {
    pub const UNARY: CallShape = CallShape {
        request: Cardinality::Unary,
        response: Cardinality::Unary,
    };
    pub const SERVER_STREAMING: CallShape = CallShape {
        request: Cardinality::Unary,
        response: Cardinality::Streaming,
    };
    pub const CLIENT_STREAMING: CallShape = CallShape {
        request: Cardinality::Streaming,
        response: Cardinality::Unary,
    };
    pub const BIDI_STREAMING: CallShape = CallShape {
        request: Cardinality::Streaming,
        response: Cardinality::Streaming,
    };

    pub fn streaming_request(&self) -> bool {
        self.request == Cardinality::Streaming
    }

    pub fn streaming_response(&self) -> bool {
        self.response == Cardinality::Streaming
    }
}

impl fmt::Display for CallShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match (self.request, self.response) {
            (Cardinality::Unary, Cardinality::Unary) => "unary",
            (Cardinality::Unary, Cardinality::Streaming) => "server-streaming",
            (Cardinality::Streaming, Cardinality::Unary) => "client-streaming",
            (Cardinality::Streaming, Cardinality::Streaming) => "bidi-streaming",
        };
        f.write_str(name)
    }
}

/// A method to invoke: its path plus the call shape declared by the service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    pub path: GrpcPath,
    pub shape: CallShape,
}

impl MethodDescriptor {
    pub fn new(path: GrpcPath, shape: CallShape) -> Self {
        Self { path, shape }
    }

    /// Parse `{package}.{service}/{method}` and attach the call shape.
    pub fn parse(path: &str, shape: CallShape) -> Result<Self, PathError> {
        Ok(Self::new(GrpcPath::parse(path)?, shape))
    }

    pub fn method_name(&self) -> &str {
        &self.path.method
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grpc_path_parse() {
        let path = GrpcPath::parse("pingpong.PingPong/PingSyncSync").unwrap();
        assert_eq!(path.package, "pingpong");
        assert_eq!(path.service, "PingPong");
        assert_eq!(path.method, "PingSyncSync");
        assert_eq!(path.full_service(), "pingpong.PingPong");
        assert_eq!(path.full_path(), "pingpong.PingPong/PingSyncSync");
    }

    #[test]
    fn test_grpc_path_with_leading_slash() {
        let path = GrpcPath::parse("/pingpong.PingPong/PingSyncSync").unwrap();
        assert_eq!(path.package, "pingpong");
        assert_eq!(path.method, "PingSyncSync");
    }

    #[test]
    fn test_grpc_path_nested_package() {
        let path = GrpcPath::parse("org.example.pingpong.PingPong/PingAsyncAsync").unwrap();
        assert_eq!(path.package, "org.example.pingpong");
        assert_eq!(path.service, "PingPong");
        assert_eq!(path.method, "PingAsyncAsync");
    }

    #[test]
    fn test_from_service() {
        let path = GrpcPath::from_service("pingpong.PingPong", "PingAsyncSync").unwrap();
        assert_eq!(path.full_path(), "pingpong.PingPong/PingAsyncSync");
        assert_eq!(path.to_string(), path.full_path());
    }

    #[test]
    fn test_http_path() {
        let path = GrpcPath::parse("pingpong.PingPong/PingSyncSync").unwrap();
        assert_eq!(
            path.http_path().unwrap().as_str(),
            "/pingpong.PingPong/PingSyncSync"
        );
    }

    #[test]
    fn test_grpc_path_missing_method() {
        assert!(GrpcPath::parse("pingpong.PingPong").is_err());
        assert!(GrpcPath::parse("pingpong.PingPong/").is_err());
    }

    #[test]
    fn test_grpc_path_missing_package() {
        assert!(GrpcPath::parse("PingPong/PingSyncSync").is_err());
    }

    #[test]
    fn test_call_shape_names() {
        assert_eq!(CallShape::UNARY.to_string(), "unary");
        assert_eq!(CallShape::BIDI_STREAMING.to_string(), "bidi-streaming");
        assert!(CallShape::CLIENT_STREAMING.streaming_request());
        assert!(!CallShape::CLIENT_STREAMING.streaming_response());
    }
}
