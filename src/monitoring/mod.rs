//! Monitoring
//!
//! Health probes and Prometheus export for the cache engine.

pub mod exporter;
pub mod health;

pub use exporter::StatsExporter;
pub use health::{CheckOutcome, HealthCheck, HealthStatus, Readiness};
