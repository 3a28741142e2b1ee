use crate::model::{BranchId, ElementId, Id, DEFAULT_BRANCH};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Root of every branch's containment tree.
pub const ROOT_ELEMENT: &str = "model";
/// Container for system-managed elements.
pub const MBEE_ELEMENT: &str = "__mbee__";
/// Parking place for elements whose parent was removed by a client.
pub const HOLDING_BIN_ELEMENT: &str = "holding_bin";
/// Sentinel that dangling relationship ends are repointed to.
pub const UNDEFINED_ELEMENT: &str = "undefined";

pub const RESERVED_ELEMENTS: [&str; 4] = [
    ROOT_ELEMENT,
    MBEE_ELEMENT,
    HOLDING_BIN_ELEMENT,
    UNDEFINED_ELEMENT,
];

pub fn is_reserved(local_id: &str) -> bool {
    RESERVED_ELEMENTS.contains(&local_id)
}

/// A node of a branch's model graph, as stored.
///
/// All references are compound ids. The public JSON form produced by
/// [`Element::to_public_json`] uses local ids instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Element {
    pub id: ElementId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub documentation: String,
    #[serde(rename = "type", default)]
    pub element_type: String,
    #[serde(default)]
    pub parent: Option<ElementId>,
    #[serde(default)]
    pub source: Option<ElementId>,
    #[serde(default)]
    pub target: Option<ElementId>,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub archived_by: Option<String>,
    #[serde(default)]
    pub archived_on: Option<DateTime<Utc>>,
    pub created_by: String,
    pub created_on: DateTime<Utc>,
    pub last_modified_by: String,
    pub updated_on: DateTime<Utc>,
    #[serde(default)]
    pub custom: Map<String, Value>,
}

impl Element {
    pub fn new(id: ElementId, created_by: &str) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: String::new(),
            documentation: String::new(),
            element_type: String::new(),
            parent: None,
            source: None,
            target: None,
            archived: false,
            archived_by: None,
            archived_on: None,
            created_by: created_by.to_string(),
            created_on: now,
            last_modified_by: created_by.to_string(),
            updated_on: now,
            custom: Map::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_parent(mut self, parent: ElementId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn branch_id(&self) -> BranchId {
        self.id.branch_id()
    }

    pub fn local_id(&self) -> &str {
        &self.id.element
    }

    /// Every element this one points at through `parent`, `source` or `target`.
    pub fn references(&self) -> impl Iterator<Item = &ElementId> {
        self.parent
            .iter()
            .chain(self.source.iter())
            .chain(self.target.iter())
    }

    pub fn set_archived(&mut self, archived: bool, user_id: &str, now: DateTime<Utc>) {
        self.archived = archived;
        if archived {
            self.archived_by = Some(user_id.to_string());
            self.archived_on = Some(now);
        } else {
            self.archived_by = None;
            self.archived_on = None;
        }
    }

    /// Public representation: local ids, owning org/project/branch, and a
    /// namespace for every relationship end that lives on another branch.
    pub fn to_public_json(&self) -> Value {
        let home = self.branch_id();
        let mut doc = json!({
            "id": self.id.element,
            "name": self.name,
            "documentation": self.documentation,
            "type": self.element_type,
            "parent": self.parent.as_ref().map(|p| p.element.clone()),
            "source": self.source.as_ref().map(|s| s.element.clone()),
            "target": self.target.as_ref().map(|t| t.element.clone()),
            "org": self.id.org,
            "project": self.id.project,
            "branch": self.id.branch,
            "archived": self.archived,
            "archivedBy": self.archived_by,
            "archivedOn": self.archived_on.map(|d| d.to_rfc3339()),
            "createdBy": self.created_by,
            "createdOn": self.created_on.to_rfc3339(),
            "lastModifiedBy": self.last_modified_by,
            "updatedOn": self.updated_on.to_rfc3339(),
            "custom": Value::Object(self.custom.clone()),
        });

        if let Some(obj) = doc.as_object_mut() {
            if let Some(source) = &self.source {
                if source.branch_id() != home {
                    obj.insert(
                        "sourceNamespace".to_string(),
                        Namespace::from(source.branch_id()).to_json(),
                    );
                }
            }
            if let Some(target) = &self.target {
                if target.branch_id() != home {
                    obj.insert(
                        "targetNamespace".to_string(),
                        Namespace::from(target.branch_id()).to_json(),
                    );
                }
            }
        }
        doc
    }
}

/// Location of an element outside the caller's project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Namespace {
    pub org: Id,
    pub project: Id,
    #[serde(default = "default_branch")]
    pub branch: Id,
}

fn default_branch() -> Id {
    DEFAULT_BRANCH.to_string()
}

impl Namespace {
    pub fn branch_id(&self) -> BranchId {
        BranchId::new(self.org.clone(), self.project.clone(), self.branch.clone())
    }

    pub fn to_json(&self) -> Value {
        json!({ "org": self.org, "project": self.project, "branch": self.branch })
    }
}

impl From<BranchId> for Namespace {
    fn from(value: BranchId) -> Self {
        Self {
            org: value.org,
            project: value.project,
            branch: value.branch,
        }
    }
}

/// A not-yet-resolved pointer to an element, optionally in another project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementRef {
    pub id: Id,
    pub namespace: Option<Namespace>,
}

impl ElementRef {
    pub fn local(id: impl Into<Id>) -> Self {
        Self {
            id: id.into(),
            namespace: None,
        }
    }

    pub fn new(id: impl Into<Id>, namespace: Option<Namespace>) -> Self {
        Self {
            id: id.into(),
            namespace,
        }
    }

    /// The compound id this reference designates when written from `home`.
    pub fn resolve(&self, home: &BranchId) -> ElementId {
        match &self.namespace {
            Some(ns) => ns.branch_id().element(self.id.clone()),
            None => home.element(self.id.clone()),
        }
    }

    pub fn is_cross_branch(&self, home: &BranchId) -> bool {
        self.namespace
            .as_ref()
            .map(|ns| &ns.branch_id() != home)
            .unwrap_or(false)
    }
}

/// Validated create payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NewElement {
    pub id: Id,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub documentation: String,
    #[serde(rename = "type", default)]
    pub element_type: String,
    #[serde(default)]
    pub parent: Option<Id>,
    #[serde(default)]
    pub source: Option<Id>,
    #[serde(default)]
    pub target: Option<Id>,
    #[serde(default)]
    pub source_namespace: Option<Namespace>,
    #[serde(default)]
    pub target_namespace: Option<Namespace>,
    #[serde(default)]
    pub custom: Map<String, Value>,
}

impl NewElement {
    pub fn parent_ref(&self) -> ElementRef {
        ElementRef::local(self.parent.as_deref().unwrap_or(ROOT_ELEMENT))
    }

    pub fn source_ref(&self) -> Option<ElementRef> {
        self.source
            .as_ref()
            .map(|id| ElementRef::new(id.clone(), self.source_namespace.clone()))
    }

    pub fn target_ref(&self) -> Option<ElementRef> {
        self.target
            .as_ref()
            .map(|id| ElementRef::new(id.clone(), self.target_namespace.clone()))
    }
}

/// Validated update: only the fields that actually change are `Some`.
///
/// `source`/`target` use `Some(None)` to clear the relationship end.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ElementPatch {
    pub id: Id,
    pub name: Option<String>,
    pub documentation: Option<String>,
    pub element_type: Option<String>,
    pub parent: Option<ElementRef>,
    pub source: Option<Option<ElementRef>>,
    pub target: Option<Option<ElementRef>>,
    pub custom: Option<Map<String, Value>>,
    pub archived: Option<bool>,
}

impl ElementPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.documentation.is_none()
            && self.element_type.is_none()
            && self.parent.is_none()
            && self.source.is_none()
            && self.target.is_none()
            && self.custom.is_none()
            && self.archived.is_none()
    }
}

/// Recursively merge `incoming` into `existing`; objects merge key by key,
/// any other value replaces what was there.
pub fn merge_custom(existing: &mut Map<String, Value>, incoming: Map<String, Value>) {
    for (key, value) in incoming {
        match (existing.get_mut(&key), value) {
            (Some(Value::Object(current)), Value::Object(update)) => merge_custom(current, update),
            (_, value) => {
                existing.insert(key, value);
            }
        }
    }
}
