//! HTTP protocol implementation.
//!
//! This module implements the HTTP/1.1 side of the gateway that faces
//! callers, with support for keep-alive connections.
//!
//! # Architecture
//!
//! - **`connection`**: The per-client state machine
//! - **`parser`**: Parses incoming HTTP requests from byte buffers
//! - **`chunked`**: Decodes `Transfer-Encoding: chunked` bodies
//! - **`headers`**: Ordered, case-insensitive header multi-map
//! - **`request`**: HTTP request representation
//! - **`response`**: HTTP response representation with builder pattern
//! - **`writer`**: Serializes and writes responses to the client
//!
//! # Connection State Machine
//!
//! ```text
//!        ┌─────────────┐
//!        │   Reading   │ ← Wait for incoming request data
//!        └──────┬──────┘
//!               │ Request received (malformed → error reply, close)
//!               ▼
//!        ┌──────────────────┐
//!        │   Processing     │ ← Dispatch; abandoned if the client leaves
//!        └──────┬───────────┘
//!               │ Reply ready
//!               ▼
//!        ┌──────────────────┐
//!        │    Writing       │ ← Head first, then buffered or relayed body
//!        └──────┬───────────┘
//!               │ Response sent
//!               ├─ Keep-Alive → Reading (same connection)
//!               └─ Close → Closed
//! ```

pub mod chunked;
pub mod connection;
pub mod headers;
pub mod parser;
pub mod request;
pub mod response;
pub mod writer;
