//! Admin HTTP surface.
//!
//! - [`api`]: routes, handlers and error mapping
//! - [`metrics`]: Prometheus gauges fed from registry statistics

pub mod api;
pub mod metrics;
