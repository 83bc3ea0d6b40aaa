//! Data Protection Kubernetes Operator
//!
//! Schedules database backups in Kubernetes. Each BackupSchedule is
//! reconciled by building a dependency graph of the objects it owns and
//! applying it in order against the API server.

pub mod config;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod events;
pub mod metrics;
pub mod model;
pub mod reconcilers;
pub mod store;

pub use error::{Error, Result};
