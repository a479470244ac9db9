//! TCP listener and graceful shutdown.

pub mod listener;
