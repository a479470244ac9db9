//! Reverse proxy functionality
//!
//! Upstream endpoint parsing, round-robin selection and request forwarding.

pub mod backend;
pub mod upstream;

pub use backend::{Balancer, Endpoint, UpstreamSet};
pub use upstream::{BodyFraming, Forwarder, UpstreamResponse};
