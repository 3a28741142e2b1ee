use regex::Regex;
use serde_json::{Map, Value};
use std::str::FromStr;

use crate::config::ValidatorConfig;
use crate::error::{MbeeError, MbeeResult};
use crate::model::{
    is_reserved, merge_custom, Element, ElementField, ElementPatch, ElementRef, Namespace,
    NewElement,
};

/// Top-level keys accepted in a create payload.
const CREATE_FIELDS: [&str; 10] = [
    "id",
    "name",
    "documentation",
    "type",
    "parent",
    "source",
    "target",
    "sourceNamespace",
    "targetNamespace",
    "custom",
];

/// Shape and pattern checks for incoming element payloads.
#[derive(Debug, Clone)]
pub struct Validator {
    id: Regex,
    id_length: usize,
    name: Regex,
}

impl Validator {
    pub fn new(config: &ValidatorConfig) -> anyhow::Result<Self> {
        Ok(Self {
            id: Regex::new(&config.id)?,
            id_length: config.id_length,
            name: Regex::new(&config.name)?,
        })
    }

    pub fn validate_id(&self, id: &str) -> MbeeResult<()> {
        if id.len() > self.id_length {
            return Err(MbeeError::validation(format!(
                "Element ID [{}] is too long; the limit is {} characters.",
                id, self.id_length
            )));
        }
        if !self.id.is_match(id) {
            return Err(MbeeError::validation(format!("Element ID [{}] is invalid.", id)));
        }
        Ok(())
    }

    /// Like [`Validator::validate_id`], but also accepts the reserved
    /// system element ids, which reference existing elements.
    pub fn validate_ref_id(&self, id: &str) -> MbeeResult<()> {
        if is_reserved(id) {
            return Ok(());
        }
        self.validate_id(id)
    }

    pub fn validate_name(&self, name: &str) -> MbeeResult<()> {
        if !self.name.is_match(name) {
            return Err(MbeeError::validation(format!(
                "Element name [{}] is invalid.",
                name
            )));
        }
        Ok(())
    }

    /// Check a raw create payload and turn it into a [`NewElement`].
    pub fn validate_create_payload(&self, raw: &Value) -> MbeeResult<NewElement> {
        let obj = raw
            .as_object()
            .ok_or_else(|| MbeeError::validation("Element must be an object."))?;

        if let Some(key) = obj.keys().find(|k| !CREATE_FIELDS.contains(&k.as_str())) {
            return Err(MbeeError::validation(format!(
                "Invalid key [{}] in element.",
                key
            )));
        }

        let id = match obj.get("id") {
            Some(Value::String(id)) => id,
            Some(_) => return Err(MbeeError::validation("Element ID must be a string.")),
            None => return Err(MbeeError::validation("Element ID not provided.")),
        };
        self.validate_id(id)?;

        if let Some(name) = obj.get("name") {
            let name = name
                .as_str()
                .ok_or_else(|| MbeeError::validation("Element name must be a string."))?;
            self.validate_name(name)?;
        }

        for key in ["parent", "source", "target"] {
            match obj.get(key) {
                None | Some(Value::Null) => {}
                Some(Value::String(reference)) => self.validate_ref_id(reference)?,
                Some(_) => {
                    return Err(MbeeError::validation(format!(
                        "Element {} must be a string.",
                        key
                    )))
                }
            }
        }

        if let Some(custom) = obj.get("custom") {
            if !custom.is_object() {
                return Err(MbeeError::validation("Element custom data must be an object."));
            }
        }

        for key in ["sourceNamespace", "targetNamespace"] {
            if let Some(ns) = obj.get(key) {
                if !(ns.is_object() || ns.is_null()) {
                    return Err(MbeeError::validation(format!(
                        "Element {} must be an object.",
                        key
                    )));
                }
            }
        }

        serde_json::from_value(raw.clone())
            .map_err(|e| MbeeError::validation(format!("Invalid element: {}", e)))
    }

    /// Diff a raw update payload against the stored element.
    ///
    /// Only fields whose value differs from `existing` end up in the patch;
    /// a differing field outside the updatable set is rejected.
    pub fn validate_update_payload(&self, raw: &Value, existing: &Element) -> MbeeResult<ElementPatch> {
        let obj = raw
            .as_object()
            .ok_or_else(|| MbeeError::validation("Element must be an object."))?;

        let id = obj
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| MbeeError::validation("Element ID not provided."))?;
        if id != existing.local_id() {
            return Err(MbeeError::validation(format!(
                "Element ID [{}] does not match [{}].",
                id,
                existing.local_id()
            )));
        }

        let current = existing.to_public_json();
        let home = Namespace::from(existing.branch_id()).to_json();
        let mut patch = ElementPatch {
            id: id.to_string(),
            ..Default::default()
        };
        let mut source_changed = false;
        let mut target_changed = false;

        for (key, value) in obj {
            if key == "id" {
                continue;
            }
            let field = ElementField::from_str(key)
                .map_err(|_| MbeeError::validation(format!("Invalid key [{}] in element.", key)))?;

            if !Self::differs(field, value, &current, &home, existing) {
                continue;
            }
            if !field.is_updatable() {
                return Err(MbeeError::validation(format!(
                    "Element property [{}] cannot be changed.",
                    key
                )));
            }

            match field {
                ElementField::Name => {
                    let name = Self::string_field(key, value)?;
                    self.validate_name(&name)?;
                    patch.name = Some(name);
                }
                ElementField::Documentation => {
                    patch.documentation = Some(Self::string_field(key, value)?);
                }
                ElementField::Type => {
                    patch.element_type = Some(Self::string_field(key, value)?);
                }
                ElementField::Parent => {
                    let parent = match value {
                        Value::String(parent) => parent,
                        Value::Null => {
                            return Err(MbeeError::validation("Element parent cannot be null."))
                        }
                        _ => return Err(MbeeError::validation("Element parent must be a string.")),
                    };
                    self.validate_ref_id(parent)?;
                    patch.parent = Some(ElementRef::local(parent.clone()));
                }
                ElementField::Source | ElementField::SourceNamespace => source_changed = true,
                ElementField::Target | ElementField::TargetNamespace => target_changed = true,
                ElementField::Custom => {
                    let custom = value.as_object().ok_or_else(|| {
                        MbeeError::validation("Element custom data must be an object.")
                    })?;
                    patch.custom = Some(custom.clone());
                }
                ElementField::Archived => {
                    let archived = value.as_bool().ok_or_else(|| {
                        MbeeError::validation("Element archived field must be a boolean.")
                    })?;
                    patch.archived = Some(archived);
                }
                _ => {}
            }
        }

        if source_changed {
            patch.source = Some(self.relationship_end(obj, &current, "source", "sourceNamespace")?);
        }
        if target_changed {
            patch.target = Some(self.relationship_end(obj, &current, "target", "targetNamespace")?);
        }

        Ok(patch)
    }

    fn string_field(key: &str, value: &Value) -> MbeeResult<String> {
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| MbeeError::validation(format!("Element {} must be a string.", key)))
    }

    fn differs(field: ElementField, value: &Value, current: &Value, home: &Value, existing: &Element) -> bool {
        match field {
            ElementField::Custom => match value {
                Value::Object(incoming) => {
                    let mut merged: Map<String, Value> = existing.custom.clone();
                    merge_custom(&mut merged, incoming.clone());
                    merged != existing.custom
                }
                _ => true,
            },
            ElementField::SourceNamespace | ElementField::TargetNamespace => {
                let stored = current.get(field.as_str()).unwrap_or(&Value::Null);
                // Naming the element's own branch is the same as naming none
                let normalized = if value == home { &Value::Null } else { value };
                normalized != stored
            }
            _ => current.get(field.as_str()).unwrap_or(&Value::Null) != value,
        }
    }

    /// Rebuild one relationship end from the payload, falling back to the
    /// stored value for whichever half (id or namespace) was not sent.
    fn relationship_end(
        &self,
        obj: &Map<String, Value>,
        current: &Value,
        id_key: &str,
        namespace_key: &str,
    ) -> MbeeResult<Option<ElementRef>> {
        let id = obj
            .get(id_key)
            .or_else(|| current.get(id_key))
            .unwrap_or(&Value::Null);
        let id = match id {
            Value::Null => return Ok(None),
            Value::String(id) => id,
            _ => {
                return Err(MbeeError::validation(format!(
                    "Element {} must be a string.",
                    id_key
                )))
            }
        };
        self.validate_ref_id(id)?;

        let namespace = match obj.get(namespace_key).or_else(|| current.get(namespace_key)) {
            None | Some(Value::Null) => None,
            Some(ns) => Some(serde_json::from_value::<Namespace>(ns.clone()).map_err(|e| {
                MbeeError::validation(format!("Invalid {}: {}", namespace_key, e))
            })?),
        };
        Ok(Some(ElementRef::new(id.clone(), namespace)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::model::ElementId;
    use serde_json::json;

    impl Default for Validator {
        fn default() -> Self {
            Validator::new(&ValidatorConfig::default()).unwrap()
        }
    }

    fn existing() -> Element {
        let mut e = Element::new(ElementId::compose("o", "p", "master", "e1"), "alice")
            .with_name("Engine")
            .with_parent(ElementId::compose("o", "p", "master", "model"));
        e.custom.insert("mass".into(), json!(10));
        e
    }

    #[test]
    fn test_create_requires_id() {
        let v = Validator::default();
        let err = v.validate_create_payload(&json!({"name": "x"})).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
        assert!(err.to_string().contains("ID not provided"));
    }

    #[test]
    fn test_create_rejects_bad_id_and_unknown_keys() {
        let v = Validator::default();
        assert!(v.validate_create_payload(&json!({"id": "has space"})).is_err());
        assert!(v.validate_create_payload(&json!({"id": "a:b"})).is_err());
        assert!(v
            .validate_create_payload(&json!({"id": "e1", "createdBy": "x"}))
            .is_err());
        let long = "a".repeat(65);
        assert!(v.validate_create_payload(&json!({ "id": long })).is_err());
    }

    #[test]
    fn test_create_rejects_non_object_custom() {
        let v = Validator::default();
        let err = v
            .validate_create_payload(&json!({"id": "e1", "custom": [1, 2]}))
            .unwrap_err();
        assert!(err.to_string().contains("custom"));
    }

    #[test]
    fn test_create_accepts_full_payload() {
        let v = Validator::default();
        let new = v
            .validate_create_payload(&json!({
                "id": "rel",
                "name": "Drives",
                "type": "Association",
                "parent": "model",
                "source": "a",
                "target": "b",
                "targetNamespace": {"org": "o", "project": "lib"},
                "custom": {"weight": 2}
            }))
            .unwrap();
        assert_eq!(new.id, "rel");
        assert_eq!(new.source_ref(), Some(ElementRef::local("a")));
        assert_eq!(
            new.target_ref().unwrap().namespace.unwrap().branch,
            "master"
        );
    }

    #[test]
    fn test_create_allows_reserved_parent() {
        let v = Validator::default();
        assert!(v
            .validate_create_payload(&json!({"id": "e1", "parent": "__mbee__"}))
            .is_ok());
    }

    #[test]
    fn test_update_ignores_unchanged_fields() {
        let v = Validator::default();
        let e = existing();
        let patch = v
            .validate_update_payload(
                &json!({"id": "e1", "name": "Engine", "createdBy": "alice", "parent": "model"}),
                &e,
            )
            .unwrap();
        assert!(patch.is_empty());
    }

    #[test]
    fn test_update_rejects_changed_protected_field() {
        let v = Validator::default();
        let err = v
            .validate_update_payload(&json!({"id": "e1", "createdBy": "mallory"}), &existing())
            .unwrap_err();
        assert!(err.to_string().contains("[createdBy] cannot be changed"));
    }

    #[test]
    fn test_update_custom_diff_uses_merge() {
        let v = Validator::default();
        let e = existing();
        let patch = v
            .validate_update_payload(&json!({"id": "e1", "custom": {"mass": 10}}), &e)
            .unwrap();
        assert!(patch.custom.is_none());

        let patch = v
            .validate_update_payload(&json!({"id": "e1", "custom": {"color": "red"}}), &e)
            .unwrap();
        assert_eq!(patch.custom.unwrap()["color"], "red");

        assert!(v
            .validate_update_payload(&json!({"id": "e1", "custom": "red"}), &e)
            .is_err());
    }

    #[test]
    fn test_update_source_change_carries_stored_namespace_half() {
        let v = Validator::default();
        let mut e = existing();
        e.source = Some(ElementId::compose("o", "lib", "master", "a"));
        e.target = Some(ElementId::compose("o", "p", "master", "b"));

        let patch = v
            .validate_update_payload(&json!({"id": "e1", "source": "c"}), &e)
            .unwrap();
        let source = patch.source.unwrap().unwrap();
        assert_eq!(source.id, "c");
        assert_eq!(source.namespace.unwrap().project, "lib");
        assert!(patch.target.is_none());

        let patch = v
            .validate_update_payload(&json!({"id": "e1", "target": null}), &e)
            .unwrap();
        assert_eq!(patch.target, Some(None));
    }

    #[test]
    fn test_update_home_namespace_is_not_a_change() {
        let v = Validator::default();
        let mut e = existing();
        e.source = Some(ElementId::compose("o", "p", "master", "a"));
        let patch = v
            .validate_update_payload(
                &json!({"id": "e1", "sourceNamespace": {"org": "o", "project": "p", "branch": "master"}}),
                &e,
            )
            .unwrap();
        assert!(patch.source.is_none());
    }

    #[test]
    fn test_update_flags_archive_transition() {
        let v = Validator::default();
        let patch = v
            .validate_update_payload(&json!({"id": "e1", "archived": true}), &existing())
            .unwrap();
        assert_eq!(patch.archived, Some(true));
        assert!(v
            .validate_update_payload(&json!({"id": "e1", "archived": "yes"}), &existing())
            .is_err());
    }

    #[test]
    fn test_update_rejects_null_parent() {
        let v = Validator::default();
        assert!(v
            .validate_update_payload(&json!({"id": "e1", "parent": null}), &existing())
            .is_err());
    }
}
