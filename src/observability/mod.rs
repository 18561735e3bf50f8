//! # Observability
//!
//! Prometheus metrics for the controller and its broker calls.

pub mod metrics;
