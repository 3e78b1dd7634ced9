pub mod config;
pub mod network;
pub mod pool;
pub mod processing;
pub mod service;
pub mod telemetry;
