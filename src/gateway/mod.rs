//! Request-dispatch pipeline
//!
//! ```text
//! request ─▶ Dispatcher::resolve ─▶ Balancer::next ─▶ CredentialVerifier (protected routes)
//!                                                          │
//!            caller ◀─ Reply ◀─ IssuanceTransformer ◀─ Forwarder::forward
//!                               (issuance route, 2xx only)
//! ```

pub mod dispatcher;
pub mod issuance;
pub mod routes;

pub use dispatcher::{Dispatcher, DispatcherBuilder, Reply};
pub use issuance::{IssuanceTransformer, IssuedCredentials, RefreshCookie};
pub use routes::{identity_routes, Access, Handling, Route};

use crate::auth::CredentialVerifier;
use crate::config::Config;
use crate::error::Result;
use crate::proxy::backend::Balancer;
use crate::proxy::upstream::Forwarder;

/// Builds the identity gateway's dispatcher from configuration.
///
/// Fails when no valid identity service address is configured.
pub fn build_dispatcher(cfg: &Config) -> Result<Dispatcher> {
    let identity = Balancer::from_addresses(&cfg.identity_service_addresses)?;
    for endpoint in identity.upstreams().endpoints() {
        tracing::info!(backend = %endpoint, "Identity service upstream");
    }

    let mut verifier = CredentialVerifier::new(cfg.secret.as_bytes());
    if let Some(issuer) = &cfg.token_issuer {
        verifier = verifier.with_issuer(issuer);
    }
    if let Some(audience) = &cfg.token_audience {
        verifier = verifier.with_audience(audience);
    }

    if !cfg.refresh_cookie_secure {
        tracing::warn!("Refresh token cookie is sent without the Secure attribute");
    }

    Dispatcher::builder()
        .upstream(routes::IDENTITY_SERVICE, identity)
        .routes(identity_routes())
        .verifier(verifier)
        .forwarder(Forwarder::new(
            cfg.upstream_connect_timeout,
            cfg.upstream_request_timeout,
        ))
        .issuance(IssuanceTransformer::new(
            cfg.refresh_cookie_secure,
            cfg.upstream_request_timeout,
        ))
        .build()
}
