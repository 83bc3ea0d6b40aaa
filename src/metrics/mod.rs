//! Prometheus metrics for the Data Protection Operator
//!
//! This module exposes metrics for monitoring reconciliation and graph execution.

mod prometheus;

pub use prometheus::*;
