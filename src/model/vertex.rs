//! Vertices: one unit of desired change against the object store

use std::fmt;

use crate::error::{Error, Result};
use crate::model::{GraphOptions, KubeObject, ObjectKey};

/// What the executor should do with a vertex
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VertexAction {
    Create,
    Update,
    Patch,
    StatusPatch,
    Delete,
    Noop,
}

impl VertexAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            VertexAction::Create => "create",
            VertexAction::Update => "update",
            VertexAction::Patch => "patch",
            VertexAction::StatusPatch => "status_patch",
            VertexAction::Delete => "delete",
            VertexAction::Noop => "noop",
        }
    }
}

impl fmt::Display for VertexAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observed and desired state of one object plus how to converge them
#[derive(Clone, Debug)]
pub struct Vertex {
    key: ObjectKey,
    pub observed: Option<KubeObject>,
    pub desired: Option<KubeObject>,
    pub action: VertexAction,
    pub options: GraphOptions,
}

impl Vertex {
    /// Build a vertex; at least one side must be present to give it an identity.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if both sides are absent and `InvalidVertex` if
    /// they name different objects.
    pub fn new(
        observed: Option<KubeObject>,
        desired: Option<KubeObject>,
        action: VertexAction,
        options: GraphOptions,
    ) -> Result<Self> {
        let key = match (&observed, &desired) {
            (Some(o), Some(d)) => {
                let (ok, dk) = (o.key(), d.key());
                if ok != dk {
                    return Err(Error::InvalidVertex {
                        key: dk,
                        message: format!("observed object is {}", ok),
                    });
                }
                dk
            }
            (Some(o), None) => o.key(),
            (None, Some(d)) => d.key(),
            (None, None) => {
                return Err(Error::validation(
                    "vertex needs an observed or desired object",
                ))
            }
        };
        Ok(Self {
            key,
            observed,
            desired,
            action,
            options,
        })
    }

    pub fn create(desired: KubeObject, options: GraphOptions) -> Self {
        Self {
            key: desired.key(),
            observed: None,
            desired: Some(desired),
            action: VertexAction::Create,
            options,
        }
    }

    pub fn update(observed: KubeObject, desired: KubeObject, options: GraphOptions) -> Result<Self> {
        Self::new(Some(observed), Some(desired), VertexAction::Update, options)
    }

    pub fn patch(observed: KubeObject, desired: KubeObject, options: GraphOptions) -> Result<Self> {
        Self::new(Some(observed), Some(desired), VertexAction::Patch, options)
    }

    pub fn status_patch(
        observed: KubeObject,
        desired: KubeObject,
        options: GraphOptions,
    ) -> Result<Self> {
        Self::new(Some(observed), Some(desired), VertexAction::StatusPatch, options)
    }

    pub fn delete(observed: KubeObject, options: GraphOptions) -> Self {
        Self {
            key: observed.key(),
            observed: Some(observed),
            desired: None,
            action: VertexAction::Delete,
            options,
        }
    }

    /// A vertex that only anchors dependency edges
    pub fn noop(object: KubeObject) -> Self {
        Self {
            key: object.key(),
            observed: Some(object.clone()),
            desired: Some(object),
            action: VertexAction::Noop,
            options: GraphOptions::default(),
        }
    }

    pub fn key(&self) -> &ObjectKey {
        &self.key
    }
}
