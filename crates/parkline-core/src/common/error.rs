//! Error types for the package dispatch service.
//!
//! This module defines the central `Error` enum shared by the dispatcher, its
//! workers and the connection layer. Most of these never reach a connected
//! client: they are logged where they occur and are not sent back over the
//! wire.
//!
//! ## Error Cases
//! - `ChannelError`: An internal communication failure between tasks or
//!   workers.
//! - `ServiceShutdown`: Work arrived after the dispatcher was drained.
//! - `PoolExhausted`: The optional worker cap was reached and no worker
//!   granted capacity in time.
//! - `InvalidPackage`: A frame on the wire was malformed or too large.
//! - `Processing`: A worker's package processor failed.
//! - `Io`: A socket or listener operation failed.

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the package dispatch service.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Internal channel send/receive failure (e.g., closed or full channel).
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    /// The dispatcher has been drained and admits no further work.
    #[error("Service is shutting down")]
    ServiceShutdown,

    /// Every worker is saturated and the pool may not grow past `limit`.
    #[error("Worker pool exhausted (limit = {limit})")]
    PoolExhausted { limit: usize },

    /// A package frame violated the wire protocol.
    #[error("Invalid package: {reason}")]
    InvalidPackage { reason: String },

    /// The package processor rejected or failed to handle an item.
    #[error("Processing failed: {reason}")]
    Processing { reason: String },

    /// Underlying socket failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
