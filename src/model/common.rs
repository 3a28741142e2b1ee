use crate::error::MalformedIdError;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type Id = String;

/// Separator between the segments of a compound id.
pub const ID_DELIMITER: char = ':';

/// Join id segments into a compound id (`org:project:branch:element`).
pub fn create_id(parts: &[&str]) -> Id {
    parts.join(":")
}

/// Split a compound id into its segments.
pub fn parse_id(id: &str) -> Vec<&str> {
    id.split(ID_DELIMITER).collect()
}

fn split_exact(id: &str, expected: usize) -> Result<Vec<&str>, MalformedIdError> {
    let parts = parse_id(id);
    if parts.len() != expected || parts.iter().any(|p| p.is_empty()) {
        return Err(MalformedIdError {
            id: id.to_string(),
            expected,
            found: parts.len(),
        });
    }
    Ok(parts)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProjectId {
    pub org: Id,
    pub project: Id,
}

impl ProjectId {
    pub fn new(org: impl Into<Id>, project: impl Into<Id>) -> Self {
        Self {
            org: org.into(),
            project: project.into(),
        }
    }

    pub fn decompose(id: &str) -> Result<Self, MalformedIdError> {
        let parts = split_exact(id, 2)?;
        Ok(Self::new(parts[0], parts[1]))
    }

    pub fn branch(&self, branch: impl Into<Id>) -> BranchId {
        BranchId {
            org: self.org.clone(),
            project: self.project.clone(),
            branch: branch.into(),
        }
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", create_id(&[&self.org, &self.project]))
    }
}

impl TryFrom<String> for ProjectId {
    type Error = MalformedIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::decompose(&value)
    }
}

impl From<ProjectId> for String {
    fn from(value: ProjectId) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BranchId {
    pub org: Id,
    pub project: Id,
    pub branch: Id,
}

impl BranchId {
    pub fn new(org: impl Into<Id>, project: impl Into<Id>, branch: impl Into<Id>) -> Self {
        Self {
            org: org.into(),
            project: project.into(),
            branch: branch.into(),
        }
    }

    pub fn decompose(id: &str) -> Result<Self, MalformedIdError> {
        let parts = split_exact(id, 3)?;
        Ok(Self::new(parts[0], parts[1], parts[2]))
    }

    pub fn project_id(&self) -> ProjectId {
        ProjectId::new(self.org.clone(), self.project.clone())
    }

    pub fn element(&self, element: impl Into<Id>) -> ElementId {
        ElementId {
            org: self.org.clone(),
            project: self.project.clone(),
            branch: self.branch.clone(),
            element: element.into(),
        }
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", create_id(&[&self.org, &self.project, &self.branch]))
    }
}

impl TryFrom<String> for BranchId {
    type Error = MalformedIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::decompose(&value)
    }
}

impl From<BranchId> for String {
    fn from(value: BranchId) -> Self {
        value.to_string()
    }
}

/// Primary key of an element document: `org:project:branch:element`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ElementId {
    pub org: Id,
    pub project: Id,
    pub branch: Id,
    pub element: Id,
}

impl ElementId {
    pub fn compose(
        org: impl Into<Id>,
        project: impl Into<Id>,
        branch: impl Into<Id>,
        element: impl Into<Id>,
    ) -> Self {
        Self {
            org: org.into(),
            project: project.into(),
            branch: branch.into(),
            element: element.into(),
        }
    }

    pub fn decompose(id: &str) -> Result<Self, MalformedIdError> {
        let parts = split_exact(id, 4)?;
        Ok(Self::compose(parts[0], parts[1], parts[2], parts[3]))
    }

    pub fn branch_id(&self) -> BranchId {
        BranchId::new(self.org.clone(), self.project.clone(), self.branch.clone())
    }

    pub fn project_id(&self) -> ProjectId {
        ProjectId::new(self.org.clone(), self.project.clone())
    }

    /// The element with the same local id on another branch.
    pub fn on_branch(&self, branch: &BranchId) -> ElementId {
        branch.element(self.element.clone())
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            create_id(&[&self.org, &self.project, &self.branch, &self.element])
        )
    }
}

impl TryFrom<String> for ElementId {
    type Error = MalformedIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::decompose(&value)
    }
}

impl From<ElementId> for String {
    fn from(value: ElementId) -> Self {
        value.to_string()
    }
}
