//! Health and Prometheus endpoints.

pub mod health;
pub mod metrics;
