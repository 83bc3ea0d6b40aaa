//! Per-vertex execution options
//!
//! Options are a closed set of tagged variants folded into a plain
//! [`GraphOptions`] record. Planners build them with
//! [`GraphOptions::from_options`] or the `with_*` helpers.

use kube::api::PropagationPolicy;

/// Pass-through parameters for the underlying store call.
///
/// The engine never looks inside; the store maps them onto request
/// parameters (field manager, dry-run).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientOptions {
    pub field_manager: Option<String>,
    pub dry_run: bool,
}

/// A single option attached to a vertex or a graph query
#[derive(Clone, Debug, PartialEq)]
pub enum GraphOption {
    /// On create conflict, adopt the stored object and update it instead
    ReplaceIfExisting,
    /// `find_all` selects vertices whose kind differs from the reference kind
    HaveDifferentTypeWith,
    /// Cascade mode forwarded to delete calls
    PropagationPolicy(PropagationPolicy),
    /// Target a named subresource instead of the main body
    SubResource(String),
    /// Opaque parameters forwarded to the store call
    ClientOption(ClientOptions),
}

/// Resolved options for one vertex
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GraphOptions {
    pub replace_if_existing: bool,
    pub have_different_type_with: bool,
    pub propagation_policy: Option<PropagationPolicy>,
    pub sub_resource: Option<String>,
    pub client: ClientOptions,
}

impl GraphOptions {
    pub fn from_options(options: impl IntoIterator<Item = GraphOption>) -> Self {
        let mut resolved = Self::default();
        for option in options {
            resolved.apply(option);
        }
        resolved
    }

    /// Later options override earlier ones of the same variant
    pub fn apply(&mut self, option: GraphOption) {
        match option {
            GraphOption::ReplaceIfExisting => self.replace_if_existing = true,
            GraphOption::HaveDifferentTypeWith => self.have_different_type_with = true,
            GraphOption::PropagationPolicy(policy) => self.propagation_policy = Some(policy),
            GraphOption::SubResource(name) => {
                self.sub_resource = if name.is_empty() { None } else { Some(name) }
            }
            GraphOption::ClientOption(client) => self.client = client,
        }
    }

    pub fn replace_if_existing(mut self) -> Self {
        self.replace_if_existing = true;
        self
    }

    pub fn with_propagation_policy(mut self, policy: PropagationPolicy) -> Self {
        self.propagation_policy = Some(policy);
        self
    }

    pub fn with_sub_resource(mut self, name: impl Into<String>) -> Self {
        self.apply(GraphOption::SubResource(name.into()));
        self
    }

    pub fn with_client_options(mut self, client: ClientOptions) -> Self {
        self.client = client;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_fold_in_order() {
        let options = GraphOptions::from_options([
            GraphOption::ReplaceIfExisting,
            GraphOption::PropagationPolicy(PropagationPolicy::Foreground),
            GraphOption::PropagationPolicy(PropagationPolicy::Background),
            GraphOption::SubResource("status".to_string()),
        ]);

        assert!(options.replace_if_existing);
        assert!(!options.have_different_type_with);
        assert_eq!(
            options.propagation_policy,
            Some(PropagationPolicy::Background)
        );
        assert_eq!(options.sub_resource.as_deref(), Some("status"));
    }

    #[test]
    fn test_empty_sub_resource_targets_main_body() {
        let options = GraphOptions::default().with_sub_resource("");
        assert_eq!(options.sub_resource, None);
    }
}
