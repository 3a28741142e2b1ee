use crate::error::{MbeeError, MbeeResult};
use crate::model::{BranchId, Element, ElementId, Id};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::str::FromStr;

/// Public field names of an element, used for projection and sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ElementField {
    Id,
    Name,
    Documentation,
    Type,
    Parent,
    Source,
    Target,
    SourceNamespace,
    TargetNamespace,
    Org,
    Project,
    Branch,
    Archived,
    ArchivedBy,
    ArchivedOn,
    CreatedBy,
    CreatedOn,
    LastModifiedBy,
    UpdatedOn,
    Custom,
}

impl ElementField {
    pub const ALL: [ElementField; 20] = [
        ElementField::Id,
        ElementField::Name,
        ElementField::Documentation,
        ElementField::Type,
        ElementField::Parent,
        ElementField::Source,
        ElementField::Target,
        ElementField::SourceNamespace,
        ElementField::TargetNamespace,
        ElementField::Org,
        ElementField::Project,
        ElementField::Branch,
        ElementField::Archived,
        ElementField::ArchivedBy,
        ElementField::ArchivedOn,
        ElementField::CreatedBy,
        ElementField::CreatedOn,
        ElementField::LastModifiedBy,
        ElementField::UpdatedOn,
        ElementField::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ElementField::Id => "id",
            ElementField::Name => "name",
            ElementField::Documentation => "documentation",
            ElementField::Type => "type",
            ElementField::Parent => "parent",
            ElementField::Source => "source",
            ElementField::Target => "target",
            ElementField::SourceNamespace => "sourceNamespace",
            ElementField::TargetNamespace => "targetNamespace",
            ElementField::Org => "org",
            ElementField::Project => "project",
            ElementField::Branch => "branch",
            ElementField::Archived => "archived",
            ElementField::ArchivedBy => "archivedBy",
            ElementField::ArchivedOn => "archivedOn",
            ElementField::CreatedBy => "createdBy",
            ElementField::CreatedOn => "createdOn",
            ElementField::LastModifiedBy => "lastModifiedBy",
            ElementField::UpdatedOn => "updatedOn",
            ElementField::Custom => "custom",
        }
    }

    /// Fields a client may change through an update.
    pub fn is_updatable(&self) -> bool {
        matches!(
            self,
            ElementField::Name
                | ElementField::Documentation
                | ElementField::Type
                | ElementField::Parent
                | ElementField::Source
                | ElementField::Target
                | ElementField::SourceNamespace
                | ElementField::TargetNamespace
                | ElementField::Custom
                | ElementField::Archived
        )
    }

    /// Key of the field in the stored document, when it has one of its own.
    pub fn stored_key(&self) -> Option<&'static str> {
        match self {
            ElementField::SourceNamespace
            | ElementField::TargetNamespace
            | ElementField::Org
            | ElementField::Project
            | ElementField::Branch => None,
            other => Some(other.as_str()),
        }
    }
}

impl FromStr for ElementField {
    type Err = MbeeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ElementField::ALL
            .iter()
            .find(|f| f.as_str() == s)
            .copied()
            .ok_or_else(|| MbeeError::validation(format!("Invalid element field [{}].", s)))
    }
}

impl TryFrom<String> for ElementField {
    type Error = MbeeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ElementField> for String {
    fn from(value: ElementField) -> Self {
        value.as_str().to_string()
    }
}

/// Reference fields that `find` can resolve into full sub-documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PopulateField {
    Parent,
    Source,
    Target,
    /// Children in the containment tree
    Contains,
    /// Relationships whose source is this element
    SourceOf,
    /// Relationships whose target is this element
    TargetOf,
}

impl PopulateField {
    pub fn as_str(&self) -> &'static str {
        match self {
            PopulateField::Parent => "parent",
            PopulateField::Source => "source",
            PopulateField::Target => "target",
            PopulateField::Contains => "contains",
            PopulateField::SourceOf => "sourceOf",
            PopulateField::TargetOf => "targetOf",
        }
    }
}

impl FromStr for PopulateField {
    type Err = MbeeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "parent" => Ok(PopulateField::Parent),
            "source" => Ok(PopulateField::Source),
            "target" => Ok(PopulateField::Target),
            "contains" => Ok(PopulateField::Contains),
            "sourceOf" => Ok(PopulateField::SourceOf),
            "targetOf" => Ok(PopulateField::TargetOf),
            other => Err(MbeeError::validation(format!(
                "Invalid field name [{}] in populate.",
                other
            ))),
        }
    }
}

impl TryFrom<String> for PopulateField {
    type Error = MbeeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PopulateField> for String {
    fn from(value: PopulateField) -> Self {
        value.as_str().to_string()
    }
}

/// Sort order; parsed from `"name"` or `"-name"` (descending).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SortSpec {
    pub field: ElementField,
    pub descending: bool,
}

impl FromStr for SortSpec {
    type Err = MbeeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (descending, name) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let field: ElementField = name.parse()?;
        if field.stored_key().is_none() {
            return Err(MbeeError::validation(format!(
                "Cannot sort on field [{}].",
                name
            )));
        }
        Ok(Self { field, descending })
    }
}

impl TryFrom<String> for SortSpec {
    type Error = MbeeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SortSpec> for String {
    fn from(value: SortSpec) -> Self {
        if value.descending {
            format!("-{}", value.field.as_str())
        } else {
            value.field.as_str().to_string()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum SortKey {
    Text(String),
    Flag(bool),
    Time(Option<DateTime<Utc>>),
}

fn sort_key(element: &Element, field: ElementField) -> SortKey {
    let id_text = |id: &Option<ElementId>| SortKey::Text(id.as_ref().map(|i| i.to_string()).unwrap_or_default());
    match field {
        ElementField::Name => SortKey::Text(element.name.clone()),
        ElementField::Documentation => SortKey::Text(element.documentation.clone()),
        ElementField::Type => SortKey::Text(element.element_type.clone()),
        ElementField::Parent => id_text(&element.parent),
        ElementField::Source => id_text(&element.source),
        ElementField::Target => id_text(&element.target),
        ElementField::Archived => SortKey::Flag(element.archived),
        ElementField::ArchivedBy => SortKey::Text(element.archived_by.clone().unwrap_or_default()),
        ElementField::ArchivedOn => SortKey::Time(element.archived_on),
        ElementField::CreatedBy => SortKey::Text(element.created_by.clone()),
        ElementField::CreatedOn => SortKey::Time(Some(element.created_on)),
        ElementField::LastModifiedBy => SortKey::Text(element.last_modified_by.clone()),
        ElementField::UpdatedOn => SortKey::Time(Some(element.updated_on)),
        _ => SortKey::Text(element.id.to_string()),
    }
}

/// Sorting and pagination applied to a result set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub sort: Option<SortSpec>,
    pub skip: usize,
    pub limit: Option<usize>,
}

impl Page {
    /// Order by the sort field (ties and the default order fall back to
    /// the compound id), then skip and limit.
    pub fn apply(&self, mut elements: Vec<Element>) -> Vec<Element> {
        elements.sort_by(|a, b| {
            let by_field = match self.sort {
                Some(spec) => {
                    let ord = sort_key(a, spec.field).cmp(&sort_key(b, spec.field));
                    if spec.descending {
                        ord.reverse()
                    } else {
                        ord
                    }
                }
                None => Ordering::Equal,
            };
            by_field.then_with(|| a.id.to_string().cmp(&b.id.to_string()))
        });
        let iter = elements.into_iter().skip(self.skip);
        match self.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }
}

/// One equality condition of a free-form query, in stored-document terms.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryCondition {
    /// Path into the stored document, e.g. `["custom", "owner"]`
    pub path: Vec<String>,
    pub value: Value,
}

impl QueryCondition {
    pub fn matches(&self, doc: &Value) -> bool {
        let mut current = doc;
        for key in &self.path {
            match current.get(key) {
                Some(next) => current = next,
                None => return self.value.is_null(),
            }
        }
        current == &self.value
    }
}

const QUERYABLE_FIELDS: [&str; 9] = [
    "name",
    "documentation",
    "type",
    "parent",
    "source",
    "target",
    "createdBy",
    "lastModifiedBy",
    "archivedBy",
];

/// A validated free-form query over public field names.
///
/// Keys are either one of the queryable element fields or `custom.<path>`.
/// Reference fields take local ids and are resolved against the branch the
/// query runs on.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ElementQuery {
    terms: Vec<(String, Value)>,
}

impl ElementQuery {
    pub fn from_value(raw: &Value) -> MbeeResult<Self> {
        let obj = raw
            .as_object()
            .ok_or_else(|| MbeeError::validation("Element query must be an object."))?;
        let mut terms = Vec::new();
        for (key, value) in obj {
            let custom_path = key.strip_prefix("custom.");
            if !QUERYABLE_FIELDS.contains(&key.as_str())
                && custom_path.map(|p| p.is_empty()).unwrap_or(true)
            {
                return Err(MbeeError::validation(format!(
                    "Invalid query field [{}].",
                    key
                )));
            }
            if ["parent", "source", "target"].contains(&key.as_str())
                && !(value.is_string() || value.is_null())
            {
                return Err(MbeeError::validation(format!(
                    "Query field [{}] must be an element id.",
                    key
                )));
            }
            terms.push((key.clone(), value.clone()));
        }
        Ok(Self { terms })
    }

    /// Translate into stored-document conditions on `branch`.
    pub fn to_conditions(&self, branch: &BranchId) -> Vec<QueryCondition> {
        self.terms
            .iter()
            .map(|(key, value)| {
                let path: Vec<String> = key.split('.').map(str::to_string).collect();
                let value = match (key.as_str(), value) {
                    ("parent" | "source" | "target", Value::String(local)) => {
                        Value::String(branch.element(local.clone()).to_string())
                    }
                    _ => value.clone(),
                };
                QueryCondition { path, value }
            })
            .collect()
    }
}

/// Which elements a `find` call starts from.
#[derive(Debug, Clone, PartialEq)]
pub enum ElementSelector {
    All,
    Ids(Vec<Id>),
    Query(ElementQuery),
}

/// Store-level filter over element documents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ElementFilter {
    pub branch: Option<BranchId>,
    pub ids: Option<Vec<ElementId>>,
    pub parents: Option<Vec<ElementId>>,
    pub sources: Option<Vec<ElementId>>,
    pub targets: Option<Vec<ElementId>>,
    /// Elements pointing at any of these ids through parent, source or target
    pub referencing: Option<Vec<ElementId>>,
    pub conditions: Vec<QueryCondition>,
    pub include_archived: bool,
}

impl ElementFilter {
    pub fn branch(branch: &BranchId) -> Self {
        Self {
            branch: Some(branch.clone()),
            ..Default::default()
        }
    }

    pub fn with_ids(mut self, ids: Vec<ElementId>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn with_parents(mut self, parents: Vec<ElementId>) -> Self {
        self.parents = Some(parents);
        self
    }

    pub fn with_sources(mut self, sources: Vec<ElementId>) -> Self {
        self.sources = Some(sources);
        self
    }

    pub fn with_targets(mut self, targets: Vec<ElementId>) -> Self {
        self.targets = Some(targets);
        self
    }

    pub fn referencing(ids: Vec<ElementId>) -> Self {
        Self {
            referencing: Some(ids),
            include_archived: true,
            ..Default::default()
        }
    }

    pub fn with_conditions(mut self, conditions: Vec<QueryCondition>) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn include_archived(mut self, include: bool) -> Self {
        self.include_archived = include;
        self
    }

    /// Reference semantics for in-process stores; SQL stores translate the
    /// same fields into a WHERE clause.
    pub fn matches(&self, element: &Element) -> bool {
        fn contains(set: &Option<Vec<ElementId>>, id: Option<&ElementId>) -> bool {
            match set {
                None => true,
                Some(ids) => id.map(|id| ids.contains(id)).unwrap_or(false),
            }
        }

        if !self.include_archived && element.archived {
            return false;
        }
        if let Some(branch) = &self.branch {
            if &element.branch_id() != branch {
                return false;
            }
        }
        if !contains(&self.ids, Some(&element.id))
            || !contains(&self.parents, element.parent.as_ref())
            || !contains(&self.sources, element.source.as_ref())
            || !contains(&self.targets, element.target.as_ref())
        {
            return false;
        }
        if let Some(referenced) = &self.referencing {
            let set: HashSet<&ElementId> = referenced.iter().collect();
            if !element.references().any(|r| set.contains(r)) {
                return false;
            }
        }
        if !self.conditions.is_empty() {
            let doc = match serde_json::to_value(element) {
                Ok(doc) => doc,
                Err(_) => return false,
            };
            if !self.conditions.iter().all(|c| c.matches(&doc)) {
                return false;
            }
        }
        true
    }
}

/// Options accepted by `find`, `search`, and the read-back of mutations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct FindOptions {
    pub populate: Vec<PopulateField>,
    /// Include archived elements
    pub archived: bool,
    /// Also return every descendant of the matched elements
    pub subtree: bool,
    pub fields: Option<Vec<ElementField>>,
    pub limit: Option<usize>,
    pub skip: usize,
    pub sort: Option<SortSpec>,
    /// Return stored documents instead of the public form
    pub lean: bool,
    /// Also return every ancestor of the matched elements up to the root
    pub rootpath: bool,
}

impl FindOptions {
    pub fn page(&self) -> Page {
        Page {
            sort: self.sort,
            skip: self.skip,
            limit: self.limit,
        }
    }

    pub fn with_archived(mut self, archived: bool) -> Self {
        self.archived = archived;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn element(local: &str, name: &str) -> Element {
        Element::new(ElementId::compose("o", "p", "master", local), "u").with_name(name)
    }

    #[test]
    fn test_populate_rejects_unknown_names() {
        assert_eq!("sourceOf".parse::<PopulateField>().unwrap(), PopulateField::SourceOf);
        assert!("owner".parse::<PopulateField>().is_err());

        let opts: Result<FindOptions, _> =
            serde_json::from_value(json!({"populate": ["parent", "bogus"]}));
        assert!(opts.is_err());
    }

    #[test]
    fn test_sort_spec_parsing() {
        let spec: SortSpec = "-name".parse().unwrap();
        assert_eq!(spec.field, ElementField::Name);
        assert!(spec.descending);
        assert!("-branch".parse::<SortSpec>().is_err());
        assert!("nope".parse::<SortSpec>().is_err());
    }

    #[test]
    fn test_page_sorts_then_paginates() {
        let elements = vec![element("a", "c"), element("b", "a"), element("c", "b")];
        let page = Page {
            sort: Some("name".parse().unwrap()),
            skip: 1,
            limit: Some(1),
        };
        let result = page.apply(elements);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].name, "b");
    }

    #[test]
    fn test_query_rejects_unknown_keys() {
        assert!(ElementQuery::from_value(&json!({"password": "x"})).is_err());
        assert!(ElementQuery::from_value(&json!({"custom.": 1})).is_err());
        assert!(ElementQuery::from_value(&json!({"parent": 3})).is_err());
        assert!(ElementQuery::from_value(&json!({"custom.owner": "me", "type": "Block"})).is_ok());
    }

    #[test]
    fn test_query_conditions_match_stored_documents() {
        let branch = BranchId::new("o", "p", "master");
        let mut e = element("e2", "Wheel").with_parent(branch.element("e1"));
        e.custom.insert("owner".into(), json!("alice"));

        let query =
            ElementQuery::from_value(&json!({"parent": "e1", "custom.owner": "alice"})).unwrap();
        let filter = ElementFilter::branch(&branch).with_conditions(query.to_conditions(&branch));
        assert!(filter.matches(&e));

        let query = ElementQuery::from_value(&json!({"custom.owner": "bob"})).unwrap();
        let filter = ElementFilter::branch(&branch).with_conditions(query.to_conditions(&branch));
        assert!(!filter.matches(&e));
    }

    #[test]
    fn test_filter_excludes_archived_by_default() {
        let branch = BranchId::new("o", "p", "master");
        let mut e = element("e1", "x");
        e.archived = true;
        assert!(!ElementFilter::branch(&branch).matches(&e));
        assert!(ElementFilter::branch(&branch).include_archived(true).matches(&e));
    }

    #[test]
    fn test_referencing_filter() {
        let branch = BranchId::new("o", "p", "master");
        let mut rel = element("r", "rel");
        rel.source = Some(branch.element("a"));
        rel.target = Some(branch.element("b"));
        assert!(ElementFilter::referencing(vec![branch.element("b")]).matches(&rel));
        assert!(!ElementFilter::referencing(vec![branch.element("z")]).matches(&rel));
    }
}
