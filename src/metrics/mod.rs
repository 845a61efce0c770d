//! Metrics Module
//! 
//! Prometheus metrics for relay sessions and the HTTP endpoint exporting them.

pub mod collector;
pub mod server;

pub use collector::Metrics;
pub use server::MetricsServer;
