//! Token-issuance response rewriting.
//!
//! A successful issuance response carries both credentials in its JSON
//! body. The refresh token is moved into an HTTP-only cookie and removed
//! from the body before the response reaches the caller.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;
use tokio::time::timeout;

use crate::error::{GatewayError, Result};
use crate::http::headers::Headers;
use crate::http::response::{Response, ResponseBuilder, StatusCode};
use crate::proxy::upstream::UpstreamResponse;

/// Name of the cookie that carries the refresh token.
pub const REFRESH_TOKEN_COOKIE: &str = "refresh_token";

/// Refresh cookie lifetime: 30 days.
pub const REFRESH_TOKEN_MAX_AGE_SECS: u64 = 2_592_000;

/// Largest issuance body the gateway will buffer.
pub const MAX_ISSUANCE_BODY: usize = 1024 * 1024;

/// Upstream headers that are recomputed for the rewritten body.
const RECOMPUTED_HEADERS: &[&str] = &[
    "Content-Length",
    "Content-Type",
    "Transfer-Encoding",
    "Connection",
    "Keep-Alive",
];

#[derive(Debug, Deserialize)]
struct IssuanceBody {
    #[serde(default)]
    access_token: Option<Value>,
    #[serde(default)]
    refresh_token: Option<Value>,
    #[serde(flatten)]
    other: Map<String, Value>,
}

#[derive(Serialize)]
struct CallerBody<'a> {
    access_token: &'a str,
    #[serde(flatten)]
    other: &'a Map<String, Value>,
}

/// A parsed issuance response with both credentials present.
#[derive(Debug, Clone, PartialEq)]
pub struct IssuedCredentials {
    pub access_token: String,
    pub refresh_token: String,
    /// Every other field of the upstream document
    pub other: Map<String, Value>,
}

impl IssuedCredentials {
    /// Parses an upstream body. Access token is checked before the refresh
    /// token; both must be strings.
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        let parsed: IssuanceBody = serde_json::from_slice(body).map_err(|e| {
            // the serde message may quote body content, so only its position is kept
            GatewayError::MalformedUpstreamBody(format!(
                "{:?} error at line {} column {}",
                e.classify(),
                e.line(),
                e.column()
            ))
        })?;

        let access_token = match parsed.access_token {
            Some(Value::String(token)) => token,
            _ => return Err(GatewayError::MissingAccessToken),
        };
        let refresh_token = match parsed.refresh_token {
            Some(Value::String(token)) => token,
            _ => return Err(GatewayError::MissingRefreshToken),
        };

        Ok(Self {
            access_token,
            refresh_token,
            other: parsed.other,
        })
    }

    /// The JSON document returned to the caller: the access token and the
    /// other fields, without the refresh token.
    pub fn caller_body(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&CallerBody {
            access_token: &self.access_token,
            other: &self.other,
        })
        .map_err(|e| GatewayError::MalformedUpstreamBody(e.to_string()))
    }
}

/// `Set-Cookie` value for the refresh token.
#[derive(Debug, Clone, Copy)]
pub struct RefreshCookie<'a> {
    value: &'a str,
    secure: bool,
}

impl<'a> RefreshCookie<'a> {
    /// Fails when `value` is empty or holds bytes a cookie value cannot carry.
    pub fn new(value: &'a str, secure: bool) -> Result<Self> {
        if value.is_empty() || !value.bytes().all(is_cookie_octet) {
            return Err(GatewayError::InvalidRefreshToken);
        }
        Ok(Self { value, secure })
    }
}

impl fmt::Display for RefreshCookie<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}={}; Path=/; Max-Age={}; HttpOnly",
            REFRESH_TOKEN_COOKIE, self.value, REFRESH_TOKEN_MAX_AGE_SECS
        )?;
        if self.secure {
            f.write_str("; Secure")?;
        }
        Ok(())
    }
}

// RFC 6265 cookie-octet
fn is_cookie_octet(b: u8) -> bool {
    matches!(b, 0x21 | 0x23..=0x2B | 0x2D..=0x3A | 0x3C..=0x5B | 0x5D..=0x7E)
}

/// Rewrites successful issuance responses.
#[derive(Debug, Clone)]
pub struct IssuanceTransformer {
    cookie_secure: bool,
    body_limit: usize,
    read_timeout: Duration,
}

impl IssuanceTransformer {
    pub fn new(cookie_secure: bool, read_timeout: Duration) -> Self {
        Self {
            cookie_secure,
            body_limit: MAX_ISSUANCE_BODY,
            read_timeout,
        }
    }

    pub fn with_body_limit(mut self, body_limit: usize) -> Self {
        self.body_limit = body_limit;
        self
    }

    pub fn cookie_secure(&self) -> bool {
        self.cookie_secure
    }

    /// Buffers the upstream body and rewrites it.
    pub async fn transform(&self, upstream: UpstreamResponse) -> Result<Response> {
        let endpoint = upstream.endpoint().to_string();
        let status = upstream.status;
        let headers = upstream.headers.clone();

        let body = timeout(self.read_timeout, upstream.read_body(self.body_limit))
            .await
            .map_err(|_| GatewayError::UpstreamTimeout { endpoint })??;

        self.rewrite(status, &headers, &body)
    }

    /// Builds the caller response from a buffered upstream body.
    ///
    /// Nothing is produced unless every step succeeds, so a failure never
    /// leaves a cookie or a partial body behind.
    pub fn rewrite(&self, status: StatusCode, upstream_headers: &Headers, body: &[u8]) -> Result<Response> {
        let credentials = IssuedCredentials::from_slice(body)?;
        let cookie = RefreshCookie::new(&credentials.refresh_token, self.cookie_secure)?;
        let caller_body = credentials.caller_body()?;

        let kept: Headers = upstream_headers
            .iter()
            .filter(|(name, _)| !RECOMPUTED_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name)))
            .collect();

        Ok(ResponseBuilder::new(status)
            .headers(kept)
            .append_header("Set-Cookie", cookie.to_string())
            .header("Content-Type", "application/json")
            .body(caller_body)
            .build())
    }
}
