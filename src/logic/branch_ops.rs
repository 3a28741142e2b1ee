use chrono::Utc;

use crate::error::{MbeeError, MbeeResult};
use crate::logic::branch_guard::BranchGuard;
use crate::model::{
    AuthContext, Branch, BranchId, Element, ElementFilter, ElementId, NewBranch, Org, Page, Project,
    ProjectId, Role, DEFAULT_BRANCH, HOLDING_BIN_ELEMENT, ID_DELIMITER, MBEE_ELEMENT,
    ROOT_ELEMENT, UNDEFINED_ELEMENT,
};
use crate::store::traits::Store;

/// Org, project and branch lifecycle.
pub struct BranchOperations;

impl BranchOperations {
    /// The system elements every branch starts with.
    pub fn reserved_elements(branch: &BranchId, created_by: &str) -> Vec<Element> {
        let root = branch.element(ROOT_ELEMENT);
        let mbee = branch.element(MBEE_ELEMENT);
        vec![
            Element::new(root.clone(), created_by).with_name("Model"),
            Element::new(mbee.clone(), created_by)
                .with_name("__mbee__")
                .with_parent(root),
            Element::new(branch.element(HOLDING_BIN_ELEMENT), created_by)
                .with_name("holding bin")
                .with_parent(mbee.clone()),
            Element::new(branch.element(UNDEFINED_ELEMENT), created_by)
                .with_name("undefined element")
                .with_parent(mbee),
        ]
    }

    /// Create the reserved elements of an empty branch.
    pub async fn initialize_branch<S: Store + ?Sized>(
        store: &S,
        branch: &BranchId,
        created_by: &str,
    ) -> MbeeResult<()> {
        store
            .insert_elements(Self::reserved_elements(branch, created_by))
            .await?;
        log::debug!("Initialized reserved elements on {}", branch);
        Ok(())
    }

    pub async fn create_org<S: Store + ?Sized>(store: &S, ctx: &AuthContext, org: Org) -> MbeeResult<Org> {
        if !ctx.admin {
            return Err(MbeeError::forbidden(format!(
                "User [{}] does not have permission to create orgs.",
                ctx.user_id
            )));
        }
        validate_segment("Org", &org.id)?;
        if store.get_org(&org.id).await?.is_some() {
            return Err(MbeeError::conflict(format!("Org [{}] already exists.", org.id)));
        }
        store.upsert_org(org.clone()).await?;
        log::info!("{} created org {}", ctx.user_id, org.id);
        Ok(org)
    }

    /// Create a project with an initialized `master` branch.
    pub async fn create_project<S: Store + ?Sized>(
        store: &S,
        ctx: &AuthContext,
        project: Project,
    ) -> MbeeResult<Project> {
        let org = project.org().to_string();
        if !ctx.can_admin_org(&org) {
            return Err(MbeeError::forbidden(format!(
                "User [{}] does not have permission to create projects in org [{}].",
                ctx.user_id, org
            )));
        }
        validate_segment("Project", &project.id.project)?;
        if store.get_org(&org).await?.is_none() {
            return Err(MbeeError::not_found(format!("Org [{}] not found.", org)));
        }
        if store.get_project(&project.id).await?.is_some() {
            return Err(MbeeError::conflict(format!(
                "Project [{}] already exists.",
                project.id
            )));
        }

        let master = Branch::new_master(&project.id, &ctx.user_id);
        Self::initialize_branch(store, &master.id, &ctx.user_id).await?;
        store.upsert_branch(master).await?;
        store.upsert_project(project.clone()).await?;
        log::info!("{} created project {}", ctx.user_id, project.id);
        Ok(project)
    }

    /// Copy a branch (default `master`) into a new branch or tag.
    ///
    /// References into the source branch are rewritten to the copy;
    /// references to any other branch keep pointing where they did.
    pub async fn create_branch<S: Store + ?Sized>(
        store: &S,
        ctx: &AuthContext,
        org: &str,
        project: &str,
        new_branch: NewBranch,
    ) -> MbeeResult<Branch> {
        let project_id = ProjectId::new(org, project);
        let record = load_project(store, &project_id).await?;
        if !ctx.can_write(&record) {
            return Err(MbeeError::forbidden(format!(
                "User [{}] does not have permission to create branches in project [{}].",
                ctx.user_id, project_id
            )));
        }
        validate_segment("Branch", &new_branch.id)?;

        let id = project_id.branch(new_branch.id.clone());
        if store.get_branch(&id).await?.is_some() {
            return Err(MbeeError::conflict(format!("Branch [{}] already exists.", id)));
        }
        let source = project_id.branch(
            new_branch
                .source
                .clone()
                .unwrap_or_else(|| DEFAULT_BRANCH.to_string()),
        );
        BranchGuard::load(store, &source).await?;

        let copies: Vec<Element> = store
            .find_elements(
                &ElementFilter::branch(&source).include_archived(true),
                &Page::default(),
            )
            .await?
            .into_iter()
            .map(|element| copy_to_branch(element, &source, &id))
            .collect();
        let count = copies.len();
        store.insert_elements(copies).await?;

        let branch = Branch::new_from_branch(
            source,
            new_branch.id.clone(),
            new_branch.name.unwrap_or_else(|| new_branch.id.clone()),
            new_branch.tag,
            &ctx.user_id,
        );
        store.upsert_branch(branch.clone()).await?;
        log::info!(
            "{} created {} {} with {} element(s)",
            ctx.user_id,
            if branch.tag { "tag" } else { "branch" },
            branch.id,
            count
        );
        Ok(branch)
    }

    /// Delete a branch and every element on it. `master` cannot be removed.
    pub async fn remove_branch<S: Store + ?Sized>(
        store: &S,
        ctx: &AuthContext,
        org: &str,
        project: &str,
        branch: &str,
    ) -> MbeeResult<()> {
        let project_id = ProjectId::new(org, project);
        let record = load_project(store, &project_id).await?;
        if ctx.project_role(&record) != Some(Role::Admin) {
            return Err(MbeeError::forbidden(format!(
                "User [{}] does not have permission to delete branches in project [{}].",
                ctx.user_id, project_id
            )));
        }
        if branch == DEFAULT_BRANCH {
            return Err(MbeeError::forbidden("Cannot delete the master branch."));
        }
        let id = project_id.branch(branch);
        if !store.delete_branch(&id).await? {
            return Err(MbeeError::not_found(format!("Branch [{}] not found.", id)));
        }
        log::info!("{} removed branch {}", ctx.user_id, id);
        Ok(())
    }
}

async fn load_project<S: Store + ?Sized>(store: &S, id: &ProjectId) -> MbeeResult<Project> {
    store
        .get_project(id)
        .await?
        .ok_or_else(|| MbeeError::not_found(format!("Project [{}] not found.", id)))
}

/// Org, project and branch ids become segments of compound ids.
fn validate_segment(kind: &str, id: &str) -> MbeeResult<()> {
    if id.is_empty() || id.contains(ID_DELIMITER) || id.chars().any(char::is_whitespace) {
        return Err(MbeeError::validation(format!("{} ID [{}] is invalid.", kind, id)));
    }
    Ok(())
}

fn copy_to_branch(mut element: Element, source: &BranchId, target: &BranchId) -> Element {
    let follow = |id: Option<ElementId>| {
        id.map(|id| {
            if &id.branch_id() == source {
                id.on_branch(target)
            } else {
                id
            }
        })
    };
    element.id = element.id.on_branch(target);
    element.parent = follow(element.parent.take());
    element.source = follow(element.source.take());
    element.target = follow(element.target.take());
    element.updated_on = Utc::now();
    element
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::store::traits::ElementStore;
    use crate::store::MemoryStore;

    async fn setup() -> (MemoryStore, AuthContext) {
        let store = MemoryStore::new();
        let ctx = AuthContext::admin("alice");
        BranchOperations::create_org(&store, &ctx, Org::new("o", "Org", "alice"))
            .await
            .unwrap();
        BranchOperations::create_project(&store, &ctx, Project::new(ProjectId::new("o", "p"), "Proj", "alice"))
            .await
            .unwrap();
        (store, ctx)
    }

    #[tokio::test]
    async fn test_new_project_has_reserved_elements() {
        let (store, _) = setup().await;
        let master = BranchId::new("o", "p", "master");
        let elements = store
            .find_elements(&ElementFilter::branch(&master), &Page::default())
            .await
            .unwrap();
        let ids: Vec<&str> = elements.iter().map(|e| e.local_id()).collect();
        assert_eq!(ids, vec!["__mbee__", "holding_bin", "model", "undefined"]);
        let undefined = elements.iter().find(|e| e.local_id() == "undefined").unwrap();
        assert_eq!(undefined.parent, Some(master.element("__mbee__")));
    }

    #[tokio::test]
    async fn test_duplicate_project_is_conflict() {
        let (store, ctx) = setup().await;
        let err = BranchOperations::create_project(&store, &ctx, Project::new(ProjectId::new("o", "p"), "Again", "alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, MbeeError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_branch_copy_rewrites_local_references() {
        let (store, ctx) = setup().await;
        let master = BranchId::new("o", "p", "master");
        let mut rel = Element::new(master.element("r"), "alice").with_parent(master.element("model"));
        rel.source = Some(master.element("model"));
        rel.target = Some(ElementId::compose("o", "lib", "master", "x"));
        store.insert_elements(vec![rel]).await.unwrap();

        let new_branch = NewBranch {
            id: "dev".into(),
            name: None,
            source: None,
            tag: false,
        };
        let branch = BranchOperations::create_branch(&store, &ctx, "o", "p", new_branch)
            .await
            .unwrap();
        assert_eq!(branch.source, Some(master.clone()));
        assert_eq!(branch.name, "dev");

        let dev = BranchId::new("o", "p", "dev");
        let copied = store
            .find_elements(&ElementFilter::branch(&dev).with_ids(vec![dev.element("r")]), &Page::default())
            .await
            .unwrap();
        assert_eq!(copied[0].parent, Some(dev.element("model")));
        assert_eq!(copied[0].source, Some(dev.element("model")));
        assert_eq!(copied[0].target, Some(ElementId::compose("o", "lib", "master", "x")));
    }

    #[tokio::test]
    async fn test_branch_id_collision_and_missing_source() {
        let (store, ctx) = setup().await;
        let dup = NewBranch { id: "master".into(), name: None, source: None, tag: false };
        let err = BranchOperations::create_branch(&store, &ctx, "o", "p", dup).await.unwrap_err();
        assert!(matches!(err, MbeeError::Conflict(_)));

        let orphan = NewBranch { id: "x".into(), name: None, source: Some("nope".into()), tag: false };
        let err = BranchOperations::create_branch(&store, &ctx, "o", "p", orphan).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let bad = NewBranch { id: "a:b".into(), name: None, source: None, tag: false };
        let err = BranchOperations::create_branch(&store, &ctx, "o", "p", bad).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
    }

    #[tokio::test]
    async fn test_master_cannot_be_removed() {
        let (store, ctx) = setup().await;
        let err = BranchOperations::remove_branch(&store, &ctx, "o", "p", "master")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let tag = NewBranch { id: "v1".into(), name: Some("Release 1".into()), source: None, tag: true };
        BranchOperations::create_branch(&store, &ctx, "o", "p", tag).await.unwrap();
        BranchOperations::remove_branch(&store, &ctx, "o", "p", "v1").await.unwrap();
        assert_eq!(store.element_count(), 4);
    }

    #[tokio::test]
    async fn test_only_admins_create_orgs() {
        let store = MemoryStore::new();
        let err = BranchOperations::create_org(&store, &AuthContext::new("bob"), Org::new("o", "Org", "bob"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }
}
