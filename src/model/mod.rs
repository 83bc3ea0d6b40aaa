//! The dependency graph model
//!
//! Planners describe a reconciliation pass as a [`DependencyGraph`] of
//! [`Vertex`] values; the [`GraphExecutor`] turns it into ordered store calls.

mod diff;
mod executor;
mod graph;
mod object;
mod options;
mod vertex;

pub use diff::merge_diff;
pub use executor::GraphExecutor;
pub use graph::DependencyGraph;
pub use object::{strip_server_managed, KubeObject, ObjectKey, ObjectKind};
pub use options::{ClientOptions, GraphOption, GraphOptions};
pub use vertex::{Vertex, VertexAction};
