//! HTTP admin server.
//!
//! - [`api`]: routes for health, cache statistics and prefix lookup
//! - [`metrics`]: Prometheus exposition

pub mod api;
pub mod metrics;
