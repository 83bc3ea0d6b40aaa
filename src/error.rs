//! Error types for the Data Protection Operator

use thiserror::Error;

use crate::model::ObjectKey;

/// Result type alias using the operator's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by an [`ObjectStore`](crate::store::ObjectStore) call.
///
/// This is the store's own taxonomy; transport details are flattened into
/// strings so the in-memory store can produce the same kinds.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The object does not exist
    #[error("{0} not found")]
    NotFound(ObjectKey),

    /// Create hit an object that already exists
    #[error("{0} already exists")]
    AlreadyExists(ObjectKey),

    /// Optimistic concurrency check failed
    #[error("conflict on {key}: {message}")]
    Conflict { key: ObjectKey, message: String },

    /// The store rejected the request body
    #[error("invalid request for {key}: {message}")]
    Invalid { key: ObjectKey, message: String },

    /// Network or server-side failure
    #[error("transport error: {0}")]
    Transport(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists(_))
    }

    /// Conflicts and already-exists errors resolve on a later pass that
    /// re-reads fresh state.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Conflict { .. } | StoreError::AlreadyExists(_)
        )
    }
}

/// A single vertex that failed during a graph pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexFailure {
    pub key: ObjectKey,
    pub error: StoreError,
}

/// Operator error types
#[derive(Error, Debug)]
pub enum Error {
    /// Object store error
    #[error("{0}")]
    Store(#[from] StoreError),

    /// Precondition not met yet; reschedule without recording a failure
    #[error("requeue requested: {0}")]
    Requeue(String),

    /// An edge would close a cycle, or the graph contains one
    #[error("dependency cycle detected between {from} and {to}")]
    CycleDetected { from: ObjectKey, to: ObjectKey },

    /// Edge or lookup referencing a vertex that is not in the graph
    #[error("vertex {0} not found in graph")]
    VertexNotFound(ObjectKey),

    /// Vertex cannot be executed as declared
    #[error("invalid vertex {key}: {message}")]
    InvalidVertex { key: ObjectKey, message: String },

    /// One or more vertices failed during a graph pass
    #[error(
        "{} of {} vertices failed{}",
        .failures.len(),
        .failures.len() + .applied + .skipped,
        describe_failures(.failures)
    )]
    Apply {
        applied: usize,
        skipped: usize,
        failures: Vec<VertexFailure>,
    },

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn describe_failures(failures: &[VertexFailure]) -> String {
    failures
        .iter()
        .map(|f| format!(": {}", f.error))
        .collect::<Vec<_>>()
        .join("")
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Create a retry signal
    pub fn requeue(msg: impl Into<String>) -> Self {
        Error::Requeue(msg.into())
    }

    /// True for the retry signal and for transient store conflicts, whether
    /// from a single call or a whole graph pass. None are recorded in status.
    pub fn is_requeue(&self) -> bool {
        match self {
            Error::Requeue(_) => true,
            Error::Store(e) => e.is_transient(),
            Error::Apply { failures, .. } => {
                !failures.is_empty() && failures.iter().all(|f| f.error.is_transient())
            }
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Store(e) if e.is_not_found())
    }

    /// Short tag used as a metrics label
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::Store(_) => "store",
            Error::Requeue(_) => "requeue",
            Error::CycleDetected { .. } | Error::VertexNotFound(_) | Error::InvalidVertex { .. } => {
                "graph"
            }
            Error::Apply { .. } => "apply",
            Error::Validation(_) => "validation",
            Error::Config(_) => "config",
            Error::Serialization(_) => "serialization",
        }
    }
}
