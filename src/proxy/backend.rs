//! Upstream endpoints and round-robin selection
//!
//! The upstream set is parsed once at startup and never changes; the only
//! mutable state shared between requests is the balancer cursor.

use crate::error::{GatewayError, Result};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("unsupported scheme {0:?}, only http is supported")]
    UnsupportedScheme(String),
    #[error("URL has no host")]
    MissingHost,
}

/// One backend instance, e.g. `http://identity-1:8080`.
///
/// Two endpoints are equal when their normalized URL strings are equal.
#[derive(Debug, Clone)]
pub struct Endpoint {
    url: String,
    host: String,
    port: u16,
    base_path: String,
}

impl Endpoint {
    pub fn parse(raw: &str) -> std::result::Result<Self, EndpointError> {
        let url = url::Url::parse(raw)?;
        if url.scheme() != "http" {
            return Err(EndpointError::UnsupportedScheme(url.scheme().to_string()));
        }
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or(EndpointError::MissingHost)?
            .to_string();
        let port = url.port_or_known_default().unwrap_or(80);
        let base_path = url.path().trim_end_matches('/').to_string();

        Ok(Self {
            url: url.to_string(),
            host,
            port,
            base_path,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.url
    }

    /// `host:port` to connect to.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Value for a `Host` header when the caller did not send one.
    pub fn host_header(&self) -> String {
        if self.port == 80 {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Joins the endpoint's base path with the caller's request target.
    pub fn target_for(&self, request_target: &str) -> String {
        if request_target.is_empty() {
            return format!("{}/", self.base_path);
        }
        if request_target == "*" {
            return request_target.to_string();
        }
        format!("{}{}", self.base_path, request_target)
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url
    }
}

impl Eq for Endpoint {}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

/// Non-empty, ordered, immutable list of endpoints for one service.
#[derive(Debug, Clone)]
pub struct UpstreamSet {
    endpoints: Arc<[Endpoint]>,
}

impl UpstreamSet {
    pub fn new(endpoints: Vec<Endpoint>) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(GatewayError::NoUpstreams);
        }
        Ok(Self {
            endpoints: endpoints.into(),
        })
    }

    /// Parses a comma-separated address list.
    ///
    /// Invalid entries are logged and skipped; the set must end up with at
    /// least one endpoint.
    pub fn parse(addresses: &str) -> Result<Self> {
        let endpoints = addresses
            .split(',')
            .map(str::trim)
            .filter(|address| !address.is_empty())
            .filter_map(|address| match Endpoint::parse(address) {
                Ok(endpoint) => Some(endpoint),
                Err(e) => {
                    tracing::warn!(address = %address, error = %e, "Skipping invalid upstream address");
                    None
                }
            })
            .collect();

        Self::new(endpoints)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }
}

/// Round-robin selection over an [`UpstreamSet`].
///
/// The Nth call to [`Balancer::next`] returns `set[(N - 1) % len]`. The
/// cursor is a single 64-bit atomic counter, so callers never block each
/// other and the sequence cannot wrap within the life of a process.
#[derive(Debug)]
pub struct Balancer {
    upstreams: UpstreamSet,
    cursor: AtomicU64,
}

impl Balancer {
    pub fn new(upstreams: UpstreamSet) -> Self {
        Self {
            upstreams,
            cursor: AtomicU64::new(0),
        }
    }

    pub fn from_endpoints(endpoints: Vec<Endpoint>) -> Result<Self> {
        UpstreamSet::new(endpoints).map(Self::new)
    }

    pub fn from_addresses(addresses: &str) -> Result<Self> {
        UpstreamSet::parse(addresses).map(Self::new)
    }

    /// Selects the next endpoint.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&self) -> &Endpoint {
        let n = self.cursor.fetch_add(1, Ordering::Relaxed);
        let index = n % self.upstreams.len() as u64;
        &self.upstreams.endpoints[index as usize]
    }

    pub fn upstreams(&self) -> &UpstreamSet {
        &self.upstreams
    }
}
