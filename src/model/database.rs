use crate::model::{BranchId, Id, ProjectId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Name of the branch every project is created with.
pub const DEFAULT_BRANCH: &str = "master";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Org {
    pub id: Id,
    pub name: String,
    #[serde(default)]
    pub custom: Map<String, Value>,
    pub created_by: String,
    pub created_on: DateTime<Utc>,
}

impl Org {
    pub fn new(id: impl Into<Id>, name: impl Into<String>, created_by: &str) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            custom: Map::new(),
            created_by: created_by.to_string(),
            created_on: Utc::now(),
        }
    }
}

/// Who outside a project may see it and reference its elements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Readable by every member of the owning org
    Internal,
    /// Readable only by users granted a role on the project
    #[default]
    Private,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub custom: Map<String, Value>,
    #[serde(default)]
    pub archived: bool,
    pub created_by: String,
    pub created_on: DateTime<Utc>,
}

impl Project {
    pub fn new(id: ProjectId, name: impl Into<String>, created_by: &str) -> Self {
        Self {
            id,
            name: name.into(),
            visibility: Visibility::default(),
            custom: Map::new(),
            archived: false,
            created_by: created_by.to_string(),
            created_on: Utc::now(),
        }
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn org(&self) -> &str {
        &self.id.org
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Branch {
    pub id: BranchId,
    pub name: String,
    /// Tags are immutable snapshots of another branch
    #[serde(default)]
    pub tag: bool,
    /// Branch this one was copied from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<BranchId>,
    #[serde(default)]
    pub archived: bool,
    pub created_by: String,
    pub created_on: DateTime<Utc>,
}

impl Branch {
    pub fn new_master(project: &ProjectId, created_by: &str) -> Self {
        Self {
            id: project.branch(DEFAULT_BRANCH),
            name: "Master".to_string(),
            tag: false,
            source: None,
            archived: false,
            created_by: created_by.to_string(),
            created_on: Utc::now(),
        }
    }

    pub fn new_from_branch(
        source: BranchId,
        id: Id,
        name: String,
        tag: bool,
        created_by: &str,
    ) -> Self {
        Self {
            id: source.project_id().branch(id),
            name,
            tag,
            source: Some(source),
            archived: false,
            created_by: created_by.to_string(),
            created_on: Utc::now(),
        }
    }

    pub fn is_master(&self) -> bool {
        self.id.branch == DEFAULT_BRANCH
    }
}

/// Input model for creating a branch; `source` defaults to `master`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewBranch {
    pub id: Id,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub source: Option<Id>,
    #[serde(default)]
    pub tag: bool,
}
