use crate::model::{Element, FindOptions};
use serde_json::{Map, Value};

/// Reference fields resolved by a `populate` request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Populated {
    pub parent: Option<Element>,
    pub source: Option<Element>,
    pub target: Option<Element>,
    pub contains: Option<Vec<Element>>,
    pub source_of: Option<Vec<Element>>,
    pub target_of: Option<Vec<Element>>,
}

impl Populated {
    fn entries(&self, lean: bool) -> Vec<(&'static str, Value)> {
        let one = |e: &Element| render(e, lean);
        let many = |es: &Vec<Element>| Value::Array(es.iter().map(|e| render(e, lean)).collect());

        let mut out = Vec::new();
        if let Some(e) = &self.parent {
            out.push(("parent", one(e)));
        }
        if let Some(e) = &self.source {
            out.push(("source", one(e)));
        }
        if let Some(e) = &self.target {
            out.push(("target", one(e)));
        }
        if let Some(es) = &self.contains {
            out.push(("contains", many(es)));
        }
        if let Some(es) = &self.source_of {
            out.push(("sourceOf", many(es)));
        }
        if let Some(es) = &self.target_of {
            out.push(("targetOf", many(es)));
        }
        out
    }
}

fn render(element: &Element, lean: bool) -> Value {
    if lean {
        serde_json::to_value(element).unwrap_or(Value::Null)
    } else {
        element.to_public_json()
    }
}

/// One result of a read: the element plus whatever was populated.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementRecord {
    pub element: Element,
    pub populated: Populated,
}

impl ElementRecord {
    pub fn new(element: Element) -> Self {
        Self {
            element,
            populated: Populated::default(),
        }
    }

    /// Render as JSON honouring `lean`, `populate` and `fields`.
    ///
    /// Projection always keeps `id` and the populated keys.
    pub fn to_document(&self, options: &FindOptions) -> Value {
        let mut doc = match render(&self.element, options.lean) {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        let populated = self.populated.entries(options.lean);
        let populated_keys: Vec<&str> = populated.iter().map(|(k, _)| *k).collect();
        for (key, value) in populated {
            doc.insert(key.to_string(), value);
        }

        if let Some(fields) = &options.fields {
            doc.retain(|key, _| {
                key == "id"
                    || populated_keys.contains(&key.as_str())
                    || fields.iter().any(|f| f.as_str() == key)
            });
        }
        Value::Object(doc)
    }
}

/// Render a batch of records with the same options.
pub fn to_documents(records: &[ElementRecord], options: &FindOptions) -> Vec<Value> {
    records.iter().map(|r| r.to_document(options)).collect()
}
