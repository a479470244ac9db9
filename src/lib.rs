//! Identity Gateway - authenticated entry point for the identity service
//!
//! Core library: HTTP transport, upstream balancing and forwarding, bearer
//! credential verification and token-issuance response rewriting.

pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod http;
pub mod proxy;
pub mod server;

pub use error::{GatewayError, Result};
