//! Dispatch service: the connection layer's entry point into the worker pool.
//!
//! ## Structure
//!
//! - [`handler`] - [`DispatchService`](handler::DispatchService) and the
//!   non-blocking [`DispatchHandle`](handler::DispatchHandle).

pub mod handler;
