//! Request dispatch
//!
//! The dispatcher owns the route table, one balancer per upstream group, the
//! credential verifier, the forwarder and the issuance transformer. It is
//! built once at startup and shared read-only by every connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWrite;

use crate::auth::CredentialVerifier;
use crate::error::{GatewayError, Result};
use crate::gateway::issuance::IssuanceTransformer;
use crate::gateway::routes::{Access, Handling, Route};
use crate::http::request::{Method, Request};
use crate::http::response::{Response, StatusCode};
use crate::http::writer::ResponseWriter;
use crate::proxy::backend::Balancer;
use crate::proxy::upstream::{BodyFraming, Forwarder, UpstreamResponse};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// What the connection writes back for one request.
#[derive(Debug)]
pub enum Reply {
    /// A response produced by the gateway (errors, rewritten issuance bodies)
    Full(Response),
    /// An upstream response whose body is streamed to the caller
    Relay(UpstreamResponse),
}

impl Reply {
    pub fn status(&self) -> StatusCode {
        match self {
            Reply::Full(response) => response.status,
            Reply::Relay(upstream) => upstream.status,
        }
    }

    /// Whether the caller connection can be reused after this reply.
    pub fn keeps_connection(&self) -> bool {
        match self {
            Reply::Full(_) => true,
            Reply::Relay(upstream) => upstream.framing() != BodyFraming::UntilClose,
        }
    }

    /// Writes the reply. The status line and headers are always written
    /// before any body byte; a relay failure after that point is returned
    /// as an error and the connection must be dropped.
    pub async fn write_to<W>(self, writer: &mut W, head_only: bool, keep_alive: bool) -> anyhow::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        match self {
            Reply::Full(mut response) => {
                if !keep_alive {
                    response.headers.insert("Connection", "close");
                }
                ResponseWriter::with_body(&response, !head_only)
                    .write_to_stream(writer)
                    .await
            }
            Reply::Relay(mut upstream) => {
                let mut headers = std::mem::take(&mut upstream.headers);
                headers.remove("Connection");
                headers.remove("Keep-Alive");
                if !keep_alive {
                    headers.insert("Connection", "close");
                }
                ResponseWriter::head(upstream.status, &headers)
                    .write_to_stream(writer)
                    .await?;

                let endpoint = upstream.endpoint().clone();
                match upstream.relay(writer).await {
                    Ok(bytes) => {
                        tracing::trace!(backend = %endpoint, bytes, "Relayed upstream body");
                        Ok(())
                    }
                    Err(e) => {
                        tracing::warn!(
                            backend = %endpoint,
                            error = %e,
                            "Relaying upstream body failed after the response head was sent"
                        );
                        Err(e.into())
                    }
                }
            }
        }
    }
}

/// Routes requests to upstream groups.
#[derive(Debug)]
pub struct Dispatcher {
    routes: Vec<Route>,
    upstreams: HashMap<String, Arc<Balancer>>,
    verifier: Option<CredentialVerifier>,
    forwarder: Forwarder,
    issuance: IssuanceTransformer,
}

/// Builder for [`Dispatcher`].
#[derive(Debug, Default)]
pub struct DispatcherBuilder {
    routes: Vec<Route>,
    upstreams: HashMap<String, Arc<Balancer>>,
    verifier: Option<CredentialVerifier>,
    forwarder: Option<Forwarder>,
    issuance: Option<IssuanceTransformer>,
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, route: Route) -> Self {
        self.routes.push(route);
        self
    }

    pub fn routes(mut self, routes: impl IntoIterator<Item = Route>) -> Self {
        self.routes.extend(routes);
        self
    }

    /// Registers the balancer for an upstream group.
    pub fn upstream(mut self, name: impl Into<String>, balancer: impl Into<Arc<Balancer>>) -> Self {
        self.upstreams.insert(name.into(), balancer.into());
        self
    }

    pub fn verifier(mut self, verifier: CredentialVerifier) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn forwarder(mut self, forwarder: Forwarder) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    pub fn issuance(mut self, issuance: IssuanceTransformer) -> Self {
        self.issuance = Some(issuance);
        self
    }

    /// Fails if a protected route has no verifier to check it.
    ///
    /// Routes are ordered by descending prefix length, so a more specific
    /// prefix always wins over its parent; ties keep registration order.
    pub fn build(self) -> Result<Dispatcher> {
        if self.verifier.is_none() {
            if let Some(route) = self.routes.iter().find(|r| r.access() == Access::Bearer) {
                return Err(GatewayError::MissingVerifier(route.prefix().to_string()));
            }
        }

        let mut routes = self.routes;
        routes.sort_by(|a, b| b.prefix().len().cmp(&a.prefix().len()));

        Ok(Dispatcher {
            routes,
            upstreams: self.upstreams,
            verifier: self.verifier,
            forwarder: self
                .forwarder
                .unwrap_or_else(|| Forwarder::new(DEFAULT_CONNECT_TIMEOUT, DEFAULT_REQUEST_TIMEOUT)),
            issuance: self
                .issuance
                .unwrap_or_else(|| IssuanceTransformer::new(true, DEFAULT_REQUEST_TIMEOUT)),
        })
    }
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    /// Routes in match order.
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Finds the route for `method` and `path` (query excluded).
    pub fn resolve(&self, method: Method, path: &str) -> Result<&Route> {
        let mut path_matched = false;

        for route in &self.routes {
            if !route.matches_path(path) {
                continue;
            }
            if route.allows(method) {
                return Ok(route);
            }
            path_matched = true;
        }

        if path_matched {
            Err(GatewayError::MethodNotAllowed {
                method,
                path: path.to_string(),
            })
        } else {
            Err(GatewayError::RouteNotFound(path.to_string()))
        }
    }

    /// Handles one request. Every failure becomes an error response here.
    pub async fn dispatch(&self, request: &Request) -> Reply {
        match self.try_dispatch(request).await {
            Ok(reply) => reply,
            Err(err) => {
                let status = err.status();
                if status.as_u16() >= 500 {
                    tracing::error!(
                        error = %err,
                        status = status.as_u16(),
                        method = ?request.method,
                        path = %request.path,
                        "Request failed"
                    );
                } else {
                    tracing::warn!(
                        error = %err,
                        status = status.as_u16(),
                        method = ?request.method,
                        path = %request.path,
                        "Request rejected"
                    );
                }
                Reply::Full(err.to_response())
            }
        }
    }

    async fn try_dispatch(&self, request: &Request) -> Result<Reply> {
        // the raw target is forwarded, so it must already be in normal form
        if !request.has_clean_path() {
            return Err(GatewayError::InvalidPath(request.path_only().to_string()));
        }
        let route = self.resolve(request.method, request.path_only())?;

        let balancer = self
            .upstreams
            .get(route.upstream())
            .ok_or_else(|| GatewayError::ServiceUnavailable(route.upstream().to_string()))?;
        let endpoint = balancer.next();

        if route.access() == Access::Bearer {
            let verifier = self
                .verifier
                .as_ref()
                .ok_or_else(|| GatewayError::MissingVerifier(route.prefix().to_string()))?;
            let claims = verifier.verify_request(request)?;
            tracing::debug!(
                subject = claims.sub.as_deref().unwrap_or("-"),
                path = %request.path,
                "Credential verified"
            );
        }

        let upstream = self.forwarder.forward(request, endpoint).await?;

        tracing::info!(
            backend = %endpoint,
            status = upstream.status.as_u16(),
            method = ?request.method,
            path = %request.path,
            "Request forwarded"
        );

        match route.handling() {
            Handling::Issue if upstream.status.is_success() => {
                self.issuance.transform(upstream).await.map(Reply::Full)
            }
            _ => Ok(Reply::Relay(upstream)),
        }
    }
}
