//! Input normalization shared by the batch element operations.
//!
//! Callers may pass a single element object, an array of element objects,
//! or (for removal) bare id strings. Everything is turned into one array
//! form here before the controller sees it.

use itertools::Itertools;
use serde_json::{Map, Value};

use crate::error::{MbeeError, MbeeResult};
use crate::model::{BranchId, Id};

/// The local id carried by a raw payload, if it has a string one.
pub fn payload_id(payload: &Value) -> Option<&str> {
    payload.get("id").and_then(Value::as_str)
}

/// Accept one element object or an array of them.
pub fn normalize_elements(payload: Value) -> MbeeResult<Vec<Value>> {
    match payload {
        Value::Object(_) => Ok(vec![payload]),
        Value::Array(items) => {
            if let Some(pos) = items.iter().position(|item| !item.is_object()) {
                return Err(MbeeError::validation(format!(
                    "Element at index {} is not an object.",
                    pos
                )));
            }
            Ok(items)
        }
        _ => Err(MbeeError::validation(
            "Elements must be an object or an array of objects.",
        )),
    }
}

/// Accept one id, an array of ids, or element objects carrying ids.
pub fn normalize_ids(payload: Value) -> MbeeResult<Vec<Id>> {
    fn id_of(item: Value) -> MbeeResult<Id> {
        match item {
            Value::String(id) => Ok(id),
            Value::Object(obj) => match obj.get("id") {
                Some(Value::String(id)) => Ok(id.clone()),
                _ => Err(MbeeError::validation("Element ID not provided.")),
            },
            _ => Err(MbeeError::validation(
                "Element ids must be strings or objects with an id.",
            )),
        }
    }

    match payload {
        Value::Array(items) => items.into_iter().map(id_of).collect(),
        other => Ok(vec![id_of(other)?]),
    }
}

/// Reconcile the id named by the call path with the one in the body.
///
/// A missing body id is filled in from the path; a different one is an error.
pub fn reconcile_path_id(path_id: &str, payload: Value) -> MbeeResult<Value> {
    let mut obj = match payload {
        Value::Object(obj) => obj,
        _ => return Err(MbeeError::validation("Element must be an object.")),
    };
    match obj.get("id") {
        None => {
            obj.insert("id".to_string(), Value::String(path_id.to_string()));
        }
        Some(Value::String(body_id)) if body_id == path_id => {}
        Some(_) => {
            return Err(MbeeError::validation(
                "Element ID in the body does not match ID in the params.",
            ))
        }
    }
    Ok(Value::Object(obj))
}

/// Drop `org`/`project`/`branch` from each payload after checking they name
/// the branch the call runs on.
pub fn strip_namespace(elements: Vec<Value>, branch: &BranchId) -> MbeeResult<Vec<Value>> {
    elements
        .into_iter()
        .map(|element| {
            let id = payload_id(&element).unwrap_or_default().to_string();
            let mut obj: Map<String, Value> = match element {
                Value::Object(obj) => obj,
                _ => return Err(MbeeError::validation("Element must be an object.")),
            };
            for (key, expected) in [
                ("org", &branch.org),
                ("project", &branch.project),
                ("branch", &branch.branch),
            ] {
                if let Some(value) = obj.remove(key) {
                    if value.as_str() != Some(expected.as_str()) {
                        return Err(MbeeError::validation(format!(
                            "Element [{}] does not belong to {} [{}].",
                            id, key, expected
                        )));
                    }
                }
            }
            Ok(Value::Object(obj))
        })
        .collect()
}

/// Reject a batch that names the same id twice.
pub fn assert_unique(ids: &[Id]) -> MbeeResult<()> {
    let duplicates: Vec<&Id> = ids.iter().duplicates().collect();
    if duplicates.is_empty() {
        return Ok(());
    }
    Err(MbeeError::validation(format!(
        "Multiple elements with the same ID [{}] exist in the request.",
        duplicates.iter().join(", ")
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_single_object_becomes_one_element_batch() {
        let batch = normalize_elements(json!({"id": "e1"})).unwrap();
        assert_eq!(batch.len(), 1);
        assert!(normalize_elements(json!([{"id": "a"}, "b"])).is_err());
        assert!(normalize_elements(json!("e1")).is_err());
    }

    #[test]
    fn test_ids_from_every_shape() {
        assert_eq!(normalize_ids(json!("a")).unwrap(), vec!["a"]);
        assert_eq!(normalize_ids(json!(["a", "b"])).unwrap(), vec!["a", "b"]);
        assert_eq!(
            normalize_ids(json!([{"id": "a"}, {"id": "b", "name": "x"}])).unwrap(),
            vec!["a", "b"]
        );
        assert!(normalize_ids(json!([1])).is_err());
    }

    #[test]
    fn test_path_id_must_match_body() {
        let filled = reconcile_path_id("e1", json!({"name": "x"})).unwrap();
        assert_eq!(filled["id"], "e1");
        assert!(reconcile_path_id("e1", json!({"id": "e1"})).is_ok());
        let err = reconcile_path_id("e1", json!({"id": "e2"})).unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn test_strip_namespace_checks_triple() {
        let branch = BranchId::new("o", "p", "master");
        let stripped =
            strip_namespace(vec![json!({"id": "a", "org": "o", "branch": "master"})], &branch).unwrap();
        assert_eq!(stripped[0], json!({"id": "a"}));

        let err = strip_namespace(vec![json!({"id": "a", "project": "other"})], &branch).unwrap_err();
        assert!(err.to_string().contains("[a]"));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        assert!(assert_unique(&["a".into(), "b".into()]).is_ok());
        let err = assert_unique(&["a".into(), "b".into(), "a".into()]).unwrap_err();
        assert!(err.to_string().contains("[a]"));
    }
}
