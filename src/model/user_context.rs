use crate::model::{Id, Project, ProjectId, Visibility};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Permission level held on an org or project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Read,
    Write,
    Admin,
}

/// The authenticated caller, passed explicitly to every operation.
///
/// Roles are supplied by whatever identity provider sits in front of the
/// core; this type only answers permission questions about them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthContext {
    pub user_id: String,
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub org_roles: HashMap<Id, Role>,
    /// Keyed by compound project id (`org:project`)
    #[serde(default)]
    pub project_roles: HashMap<String, Role>,
}

impl AuthContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            admin: false,
            org_roles: HashMap::new(),
            project_roles: HashMap::new(),
        }
    }

    /// Global administrator
    pub fn admin(user_id: impl Into<String>) -> Self {
        Self {
            admin: true,
            ..Self::new(user_id)
        }
    }

    /// Context for internal operations such as seeding
    pub fn system() -> Self {
        Self::admin("system")
    }

    pub fn with_org_role(mut self, org: impl Into<Id>, role: Role) -> Self {
        self.org_roles.insert(org.into(), role);
        self
    }

    pub fn with_project_role(mut self, project: &ProjectId, role: Role) -> Self {
        self.project_roles.insert(project.to_string(), role);
        self
    }

    pub fn org_role(&self, org: &str) -> Option<Role> {
        if self.admin {
            return Some(Role::Admin);
        }
        self.org_roles.get(org).copied()
    }

    /// Effective role on a project: global admin, then org admin, then an
    /// explicit project role, then org membership on an internal project.
    pub fn project_role(&self, project: &Project) -> Option<Role> {
        let org_role = self.org_role(project.org());
        if org_role == Some(Role::Admin) {
            return Some(Role::Admin);
        }
        if let Some(role) = self.project_roles.get(&project.id.to_string()) {
            return Some(*role);
        }
        match (org_role, project.visibility) {
            (Some(_), Visibility::Internal) => Some(Role::Read),
            _ => None,
        }
    }

    pub fn can_read(&self, project: &Project) -> bool {
        self.project_role(project).is_some()
    }

    pub fn can_write(&self, project: &Project) -> bool {
        self.project_role(project)
            .map(|role| role >= Role::Write)
            .unwrap_or(false)
    }

    pub fn can_admin_org(&self, org: &str) -> bool {
        self.org_role(org) == Some(Role::Admin)
    }
}
