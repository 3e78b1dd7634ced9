//! Connection layer: accepts TCP connections, decodes package frames and
//! hands each package to the dispatcher.
//!
//! - [`listener`] - Accept loop with a connection limit and cancellable stop.
//! - [`connection`] - Per-connection reader and response writer.

pub mod connection;
pub mod listener;
