//! JSON merge patch (RFC 7386) computation
//!
//! The executor sends the structural difference between an observed and a
//! desired object instead of the whole body, so an unchanged object costs no
//! network call at all.

use serde_json::{Map, Value};

/// Compute the merge patch that turns `from` into `to`.
///
/// Returns `None` when the two documents are already equal.
pub fn merge_diff(from: &Value, to: &Value) -> Option<Value> {
    match (from, to) {
        (Value::Object(from), Value::Object(to)) => {
            let mut patch = Map::new();
            for key in from.keys() {
                if !to.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            for (key, desired) in to {
                match from.get(key) {
                    None => {
                        patch.insert(key.clone(), desired.clone());
                    }
                    Some(current) => {
                        if let Some(nested) = merge_diff(current, desired) {
                            patch.insert(key.clone(), nested);
                        }
                    }
                }
            }
            if patch.is_empty() {
                None
            } else {
                Some(Value::Object(patch))
            }
        }
        (from, to) if from == to => None,
        (_, to) => Some(to.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_equal_documents_produce_no_patch() {
        let doc = json!({"spec": {"schedule": "0 3 * * *", "suspend": false}});
        assert_eq!(merge_diff(&doc, &doc), None);
    }

    #[test]
    fn test_changed_and_removed_fields() {
        let from = json!({
            "metadata": {"labels": {"a": "1", "b": "2"}},
            "spec": {"schedule": "0 3 * * *"}
        });
        let to = json!({
            "metadata": {"labels": {"a": "1", "c": "3"}},
            "spec": {"schedule": "0 4 * * *"}
        });

        let patch = merge_diff(&from, &to).unwrap();
        assert_eq!(
            patch,
            json!({
                "metadata": {"labels": {"b": null, "c": "3"}},
                "spec": {"schedule": "0 4 * * *"}
            })
        );

        let mut applied = from.clone();
        json_patch::merge(&mut applied, &patch);
        assert_eq!(applied, to);
    }

    #[test]
    fn test_arrays_are_replaced_whole() {
        let from = json!({"finalizers": ["a", "b"]});
        let to = json!({"finalizers": ["a"]});
        assert_eq!(merge_diff(&from, &to), Some(json!({"finalizers": ["a"]})));
    }
}
