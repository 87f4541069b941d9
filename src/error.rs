//! Error taxonomy and JSON error responses for the request path

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

use crate::ProxyBody;

/// Error kinds surfaced to clients on the request path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No service registered for the extracted subdomain
    NotFound,
    /// Could not connect to the upstream endpoint
    UpstreamUnreachable,
    /// Upstream connection succeeded but the exchange failed
    UpstreamProtocol,
    /// A transformer explicitly aborted the request
    TransformerRejected,
    /// A middleware-imposed deadline expired
    GatewayTimeout,
    /// Unexpected failure inside the gateway
    InternalError,
}

impl ErrorKind {
    /// Default HTTP status for this kind
    pub fn status(&self) -> StatusCode {
        match self {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::UpstreamUnreachable => StatusCode::BAD_GATEWAY,
            ErrorKind::UpstreamProtocol => StatusCode::BAD_GATEWAY,
            ErrorKind::TransformerRejected => StatusCode::BAD_REQUEST,
            ErrorKind::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The wire value of the `error` field
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::UpstreamUnreachable => "upstream_unreachable",
            ErrorKind::UpstreamProtocol => "upstream_protocol",
            ErrorKind::TransformerRejected => "transformer_rejected",
            ErrorKind::GatewayTimeout => "gateway_timeout",
            ErrorKind::InternalError => "internal_error",
        }
    }
}

/// A request-path error, caught and rendered at the dispatcher boundary
#[derive(Debug, Clone)]
pub struct GatewayError {
    kind: ErrorKind,
    message: String,
    /// Transformers may override the kind's default status
    status: Option<StatusCode>,
}

impl GatewayError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn upstream_unreachable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamUnreachable, message)
    }

    pub fn upstream_protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamProtocol, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }

    /// A transformer rejection carrying the status the transformer supplied
    pub fn rejection(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::TransformerRejected,
            message: message.into(),
            status: Some(status),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn status(&self) -> StatusCode {
        self.status.unwrap_or_else(|| self.kind.status())
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for GatewayError {}

/// JSON error body written to the client
#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: ErrorKind,
    error_description: &'a str,
}

/// Render a gateway error as a JSON response
pub fn error_response(err: &GatewayError) -> Response<ProxyBody> {
    let body = serde_json::to_string(&ErrorBody {
        error: err.kind(),
        error_description: err.message(),
    })
    .unwrap_or_else(|_| {
        format!(
            r#"{{"error":"{}","error_description":"{}"}}"#,
            err.kind().as_str(),
            err.message().replace('"', "\\\"")
        )
    });

    Response::builder()
        .status(err.status())
        .header("Content-Type", "application/json")
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static header")
}

/// Build a body from a fully-buffered payload
pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

/// An empty body
pub fn empty_body() -> ProxyBody {
    http_body_util::Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_status_codes() {
        assert_eq!(ErrorKind::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorKind::UpstreamUnreachable.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(ErrorKind::UpstreamProtocol.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(ErrorKind::TransformerRejected.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorKind::GatewayTimeout.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_rejection_overrides_status() {
        let err = GatewayError::rejection(StatusCode::FORBIDDEN, "key required");
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        assert_eq!(err.kind(), ErrorKind::TransformerRejected);

        let default = GatewayError::new(ErrorKind::TransformerRejected, "bad input");
        assert_eq!(default.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_error_response_body_shape() {
        let response = error_response(&GatewayError::not_found("no service for subdomain"));
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
    }

    #[test]
    fn test_display() {
        let err = GatewayError::upstream_unreachable("connection refused");
        assert_eq!(err.to_string(), "upstream_unreachable: connection refused");
    }
}
