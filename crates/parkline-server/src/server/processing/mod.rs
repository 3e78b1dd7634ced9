//! Per-item work performed by pool workers.
//!
//! - [`processor`] - The [`PackageProcessor`](processor::PackageProcessor)
//!   contract and the default acknowledging processor.

pub mod processor;
