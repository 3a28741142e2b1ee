//! JSON Model Interchange conversions.
//!
//! * JMI1: the flat array as returned by `find`
//! * JMI2: an object keyed by one field of each element
//! * JMI3: a nested tree, children under a `contains` object keyed the same way

use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

use crate::error::{MbeeError, MbeeResult};

/// Key children are nested under in a JMI3 tree.
pub const JMI3_CHILDREN_KEY: &str = "contains";

pub fn to_jmi1(elements: Vec<Value>) -> Vec<Value> {
    elements
}

fn key_of(element: &Value, key_field: &str) -> MbeeResult<String> {
    match element.get(key_field) {
        Some(Value::String(key)) => Ok(key.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(MbeeError::validation(format!(
            "Element is missing the key field [{}].",
            key_field
        ))),
    }
}

/// Flat map keyed by `key_field`.
pub fn to_jmi2(elements: Vec<Value>, key_field: &str) -> MbeeResult<Map<String, Value>> {
    let mut out = Map::new();
    for element in elements {
        let key = key_of(&element, key_field)?;
        if out.contains_key(&key) {
            return Err(MbeeError::validation(format!(
                "Duplicate key [{}] in field [{}].",
                key, key_field
            )));
        }
        out.insert(key, element);
    }
    Ok(out)
}

/// A reconstructed containment tree.
#[derive(Debug, Clone, PartialEq)]
pub struct JmiTree {
    /// Top-level entries keyed by `key_field`
    pub roots: Map<String, Value>,
    /// Keys of top-level entries whose declared parent is not in the input
    pub detached: Vec<String>,
}

impl JmiTree {
    /// Fail unless the tree has exactly one top-level entry, named `root`.
    pub fn assert_rooted_at(&self, root: &str) -> MbeeResult<()> {
        let keys: Vec<&String> = self.roots.keys().collect();
        match keys.as_slice() {
            [only] if only.as_str() == root => Ok(()),
            _ => Err(MbeeError::validation(format!(
                "Expected a single tree rooted at [{}], found roots [{}]; detached: [{}].",
                root,
                keys.iter().map(|k| k.as_str()).collect::<Vec<_>>().join(", "),
                self.detached.join(", ")
            ))),
        }
    }
}

/// Nest every element under its parent's entry.
///
/// Elements whose parent is absent become top-level entries, and the ones
/// that did declare a parent are listed in [`JmiTree::detached`]. Elements
/// caught in a parent cycle can never be attached, so they are an error.
pub fn to_jmi3(elements: Vec<Value>, key_field: &str, parent_field: &str) -> MbeeResult<JmiTree> {
    let mut by_key: HashMap<String, Value> = HashMap::new();
    let mut order: Vec<String> = Vec::with_capacity(elements.len());
    for element in elements {
        let key = key_of(&element, key_field)?;
        if by_key.insert(key.clone(), element).is_some() {
            return Err(MbeeError::validation(format!(
                "Duplicate key [{}] in field [{}].",
                key, key_field
            )));
        }
        order.push(key);
    }

    let mut children: HashMap<String, Vec<String>> = HashMap::new();
    let mut root_keys = Vec::new();
    let mut detached = Vec::new();
    for key in &order {
        let parent = by_key
            .get(key)
            .and_then(|e| e.get(parent_field))
            .and_then(Value::as_str)
            .map(str::to_string);
        match parent {
            Some(parent) if parent != *key && by_key.contains_key(&parent) => {
                children.entry(parent).or_default().push(key.clone());
            }
            Some(_) => {
                detached.push(key.clone());
                root_keys.push(key.clone());
            }
            None => root_keys.push(key.clone()),
        }
    }

    let mut placed = HashSet::new();
    let mut roots = Map::new();
    for key in root_keys {
        let node = build_node(&key, &mut by_key, &children, &mut placed);
        roots.insert(key, node);
    }

    if placed.len() != order.len() {
        let cyclic: Vec<&str> = order
            .iter()
            .filter(|k| !placed.contains(*k))
            .map(String::as_str)
            .collect();
        return Err(MbeeError::validation(format!(
            "Elements [{}] form a containment cycle.",
            cyclic.join(", ")
        )));
    }

    Ok(JmiTree { roots, detached })
}

fn build_node(
    key: &str,
    by_key: &mut HashMap<String, Value>,
    children: &HashMap<String, Vec<String>>,
    placed: &mut HashSet<String>,
) -> Value {
    placed.insert(key.to_string());
    let mut node = match by_key.remove(key) {
        Some(Value::Object(obj)) => obj,
        _ => Map::new(),
    };
    let mut contains = Map::new();
    for child in children.get(key).into_iter().flatten() {
        if placed.contains(child) {
            continue;
        }
        let child_node = build_node(child, by_key, children, placed);
        contains.insert(child.clone(), child_node);
    }
    node.insert(JMI3_CHILDREN_KEY.to_string(), Value::Object(contains));
    Value::Object(node)
}
