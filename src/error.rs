//! Error taxonomy for the dispatch pipeline.
//!
//! Every failure is converted into a status code at the dispatcher; the
//! response body only ever carries the status line text, never details.

use thiserror::Error;

use crate::http::request::Method;
use crate::http::response::{Response, ResponseBuilder, StatusCode};

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// No valid upstream address was supplied
    #[error("no valid upstream addresses configured")]
    NoUpstreams,

    /// A protected route was registered without a verifier
    #[error("route {0} requires authentication but no credential verifier is configured")]
    MissingVerifier(String),

    #[error("no route matches {0}")]
    RouteNotFound(String),

    /// Dot segments or encoded separators in the request path
    #[error("path {0} is not in normal form")]
    InvalidPath(String),

    #[error("method {method} not allowed for {path}")]
    MethodNotAllowed { method: Method, path: String },

    /// The matched route names an upstream group with no balancer
    #[error("no balancer registered for upstream group {0}")]
    ServiceUnavailable(String),

    #[error("missing bearer credential")]
    MissingCredential,

    #[error("malformed Authorization header")]
    MalformedAuthorization,

    #[error("malformed credential: {0}")]
    MalformedCredential(String),

    #[error("unexpected signing algorithm {0}")]
    UnexpectedAlgorithm(String),

    #[error("credential signature is invalid")]
    InvalidSignature,

    #[error("credential has expired")]
    ExpiredCredential,

    #[error("credential is not valid yet")]
    ImmatureCredential,

    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    #[error("upstream {endpoint} unavailable: {source}")]
    UpstreamUnavailable {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("upstream {endpoint} timed out")]
    UpstreamTimeout { endpoint: String },

    #[error("forwarding to {endpoint} failed: {reason}")]
    ForwardFailed { endpoint: String, reason: String },

    #[error("malformed upstream issuance body: {0}")]
    MalformedUpstreamBody(String),

    #[error("access token missing from issuance response")]
    MissingAccessToken,

    #[error("refresh token missing from issuance response")]
    MissingRefreshToken,

    #[error("refresh token is not a valid cookie value")]
    InvalidRefreshToken,
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::RouteNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            GatewayError::NoUpstreams | GatewayError::ServiceUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::MalformedAuthorization | GatewayError::InvalidPath(_) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::MissingCredential
            | GatewayError::MalformedCredential(_)
            | GatewayError::UnexpectedAlgorithm(_)
            | GatewayError::InvalidSignature
            | GatewayError::ExpiredCredential
            | GatewayError::ImmatureCredential
            | GatewayError::InvalidCredential(_) => StatusCode::UNAUTHORIZED,
            GatewayError::UpstreamUnavailable { .. } | GatewayError::ForwardFailed { .. } => {
                StatusCode::BAD_GATEWAY
            }
            GatewayError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::MissingVerifier(_)
            | GatewayError::MalformedUpstreamBody(_)
            | GatewayError::MissingAccessToken
            | GatewayError::MissingRefreshToken
            | GatewayError::InvalidRefreshToken => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the caller's credential was rejected.
    pub fn is_auth_failure(&self) -> bool {
        self.status() == StatusCode::UNAUTHORIZED
    }

    /// The response sent to the caller for this error.
    pub fn to_response(&self) -> Response {
        let response = Response::status_only(self.status());
        if self.is_auth_failure() {
            return ResponseBuilder::new(response.status)
                .headers(response.headers)
                .header("WWW-Authenticate", "Bearer")
                .body(response.body)
                .build();
        }
        response
    }
}
