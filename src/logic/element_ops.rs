use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::error::{MbeeError, MbeeResult};
use crate::logic::branch_guard::{BranchAction, BranchGuard};
use crate::logic::bulk;
use crate::logic::validate::Validator;
use crate::model::{
    is_reserved, merge_custom, AuthContext, BranchId, Element, ElementFilter, ElementId,
    ElementRecord, ElementRef, ElementSelector, FindOptions, Id, Namespace, Page, PopulateField,
    Project, ProjectId, Visibility, UNDEFINED_ELEMENT,
};
use crate::store::traits::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

/// Reference values an element ends up with after a create or update.
#[derive(Debug, Clone, Default)]
struct Resolved {
    parent: Option<ElementId>,
    source: Option<ElementId>,
    target: Option<ElementId>,
}

/// Reference fields a payload sets; `None` leaves the current value alone.
#[derive(Debug, Clone, Default)]
struct RefChanges {
    parent: Option<ElementRef>,
    source: Option<Option<ElementRef>>,
    target: Option<Option<ElementRef>>,
}

/// What one batch knows about itself while its elements are checked.
struct BatchView {
    ids: HashSet<ElementId>,
    /// Parent each element of the batch will have once written
    parents: HashMap<ElementId, ElementId>,
}

/// The element graph operations: `find`, `create`, `update`, `remove`
/// and `search`, all scoped to one org/project/branch.
///
/// Batches are all-or-nothing: every element is checked before a single
/// store write is issued.
pub struct ElementController<S: Store> {
    store: Arc<S>,
    validator: Validator,
}

impl<S: Store> ElementController<S> {
    pub fn new(store: Arc<S>, validator: Validator) -> Self {
        Self { store, validator }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    async fn authorize(&self, ctx: &AuthContext, branch: &BranchId, access: Access) -> MbeeResult<Project> {
        let project_id = branch.project_id();
        let project = self
            .store
            .get_project(&project_id)
            .await?
            .ok_or_else(|| MbeeError::not_found(format!("Project [{}] not found.", project_id)))?;

        let allowed = match access {
            Access::Read => ctx.can_read(&project),
            Access::Write => ctx.can_write(&project),
        };
        if !allowed {
            let verb = match access {
                Access::Read => "read",
                Access::Write => "modify",
            };
            return Err(MbeeError::forbidden(format!(
                "User [{}] does not have permission to {} elements in project [{}].",
                ctx.user_id, verb, project_id
            )));
        }
        Ok(project)
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    /// Find elements by id list, free-form query or everything on the branch.
    ///
    /// An empty result is not an error; see [`ElementController::find_one`].
    pub async fn find(
        &self,
        ctx: &AuthContext,
        org: &str,
        project: &str,
        branch: &str,
        selector: ElementSelector,
        options: &FindOptions,
    ) -> MbeeResult<Vec<ElementRecord>> {
        let branch_id = BranchId::new(org, project, branch);
        self.authorize(ctx, &branch_id, Access::Read).await?;
        BranchGuard::load(self.store.as_ref(), &branch_id).await?;

        let elements = self.find_on_branch(&branch_id, selector, options).await?;
        self.populate(ctx, &branch_id, elements, options).await
    }

    /// Find a single element, failing with `NotFound` when it is absent.
    pub async fn find_one(
        &self,
        ctx: &AuthContext,
        org: &str,
        project: &str,
        branch: &str,
        element_id: &str,
        options: &FindOptions,
    ) -> MbeeResult<ElementRecord> {
        let mut found = self
            .find(
                ctx,
                org,
                project,
                branch,
                ElementSelector::Ids(vec![element_id.to_string()]),
                options,
            )
            .await?;
        if found.is_empty() {
            return Err(MbeeError::not_found(format!(
                "Element [{}] not found.",
                element_id
            )));
        }
        Ok(found.swap_remove(0))
    }

    /// Case-insensitive text search over `name` and `documentation`.
    pub async fn search(
        &self,
        ctx: &AuthContext,
        org: &str,
        project: &str,
        branch: &str,
        text: &str,
        options: &FindOptions,
    ) -> MbeeResult<Vec<ElementRecord>> {
        let branch_id = BranchId::new(org, project, branch);
        self.authorize(ctx, &branch_id, Access::Read).await?;
        BranchGuard::load(self.store.as_ref(), &branch_id).await?;

        if text.trim().is_empty() {
            return Err(MbeeError::validation("Search text must not be empty."));
        }
        let filter = ElementFilter::branch(&branch_id).include_archived(options.archived);
        let elements = self
            .store
            .search_elements(&filter, text, &options.page())
            .await?;
        log::debug!("Search for {:?} on {} matched {} element(s)", text, branch_id, elements.len());
        self.populate(ctx, &branch_id, elements, options).await
    }

    async fn find_on_branch(
        &self,
        branch: &BranchId,
        selector: ElementSelector,
        options: &FindOptions,
    ) -> MbeeResult<Vec<Element>> {
        let mut filter = ElementFilter::branch(branch).include_archived(options.archived);
        match selector {
            ElementSelector::All => {}
            ElementSelector::Ids(ids) => {
                if ids.is_empty() {
                    return Ok(Vec::new());
                }
                filter = filter.with_ids(ids.into_iter().map(|id| branch.element(id)).collect());
            }
            ElementSelector::Query(query) => {
                filter = filter.with_conditions(query.to_conditions(branch));
            }
        }

        if !options.subtree && !options.rootpath {
            log::debug!("Finding elements on {} with {:?}", branch, options.page());
            return Ok(self.store.find_elements(&filter, &options.page()).await?);
        }

        // Expansion has to see every match before paginating
        let matched = self.store.find_elements(&filter, &Page::default()).await?;
        let mut seen: HashSet<ElementId> = matched.iter().map(|e| e.id.clone()).collect();
        let mut result = matched.clone();
        if options.subtree {
            let roots = matched.iter().map(|e| e.id.clone()).collect();
            result.extend(
                self.descendants(branch, roots, options.archived, &mut seen)
                    .await?,
            );
        }
        if options.rootpath {
            result.extend(
                self.ancestors(branch, &matched, options.archived, &mut seen)
                    .await?,
            );
        }
        Ok(options.page().apply(result))
    }

    /// Every element below `roots`, walking containment edges breadth first.
    async fn descendants(
        &self,
        branch: &BranchId,
        roots: Vec<ElementId>,
        include_archived: bool,
        seen: &mut HashSet<ElementId>,
    ) -> MbeeResult<Vec<Element>> {
        let mut out = Vec::new();
        let mut frontier = roots;
        let mut depth = 0usize;
        while !frontier.is_empty() {
            let filter = ElementFilter::branch(branch)
                .with_parents(frontier)
                .include_archived(include_archived);
            let children = self.store.find_elements(&filter, &Page::default()).await?;
            frontier = Vec::new();
            for child in children {
                if seen.insert(child.id.clone()) {
                    frontier.push(child.id.clone());
                    out.push(child);
                }
            }
            depth += 1;
        }
        log::debug!("Subtree traversal on {} reached depth {}", branch, depth);
        Ok(out)
    }

    /// Every ancestor of `start` up to the branch root.
    async fn ancestors(
        &self,
        branch: &BranchId,
        start: &[Element],
        include_archived: bool,
        seen: &mut HashSet<ElementId>,
    ) -> MbeeResult<Vec<Element>> {
        let mut out = Vec::new();
        let mut frontier: BTreeSet<ElementId> = start
            .iter()
            .filter_map(|e| e.parent.clone())
            .filter(|p| !seen.contains(p))
            .collect();
        while !frontier.is_empty() {
            let filter = ElementFilter::branch(branch)
                .with_ids(frontier.into_iter().collect())
                .include_archived(include_archived);
            let parents = self.store.find_elements(&filter, &Page::default()).await?;
            frontier = BTreeSet::new();
            for parent in parents {
                if seen.insert(parent.id.clone()) {
                    if let Some(next) = &parent.parent {
                        if !seen.contains(next) {
                            frontier.insert(next.clone());
                        }
                    }
                    out.push(parent);
                }
            }
        }
        Ok(out)
    }

    /// Resolve the requested `populate` fields for a result set.
    async fn populate(
        &self,
        ctx: &AuthContext,
        branch: &BranchId,
        elements: Vec<Element>,
        options: &FindOptions,
    ) -> MbeeResult<Vec<ElementRecord>> {
        let mut records: Vec<ElementRecord> = elements.into_iter().map(ElementRecord::new).collect();
        if records.is_empty() || options.populate.is_empty() {
            return Ok(records);
        }

        let ids: Vec<ElementId> = records.iter().map(|r| r.element.id.clone()).collect();
        let fields: BTreeSet<PopulateField> = options.populate.iter().copied().collect();
        for field in fields {
            match field {
                PopulateField::Parent | PopulateField::Source | PopulateField::Target => {
                    let wanted: BTreeSet<ElementId> = records
                        .iter()
                        .filter_map(|r| edge(&r.element, field).cloned())
                        .collect();
                    let found = self.lookup(wanted.into_iter().collect()).await?;
                    let found = self.readable(ctx, branch, found).await?;
                    let by_id: HashMap<&ElementId, &Element> = found.iter().map(|e| (&e.id, e)).collect();
                    for record in records.iter_mut() {
                        let resolved = edge(&record.element, field)
                            .and_then(|id| by_id.get(id))
                            .map(|e| (*e).clone());
                        match field {
                            PopulateField::Parent => record.populated.parent = resolved,
                            PopulateField::Source => record.populated.source = resolved,
                            _ => record.populated.target = resolved,
                        }
                    }
                }
                PopulateField::Contains | PopulateField::SourceOf | PopulateField::TargetOf => {
                    let filter = ElementFilter::branch(branch).include_archived(options.archived);
                    let filter = match field {
                        PopulateField::Contains => filter.with_parents(ids.clone()),
                        PopulateField::SourceOf => filter.with_sources(ids.clone()),
                        _ => filter.with_targets(ids.clone()),
                    };
                    let related = self.store.find_elements(&filter, &Page::default()).await?;
                    let mut grouped: HashMap<ElementId, Vec<Element>> = HashMap::new();
                    for element in related {
                        if let Some(key) = edge(&element, field).cloned() {
                            grouped.entry(key).or_default().push(element);
                        }
                    }
                    for record in records.iter_mut() {
                        let list = grouped.get(&record.element.id).cloned().unwrap_or_default();
                        match field {
                            PopulateField::Contains => record.populated.contains = Some(list),
                            PopulateField::SourceOf => record.populated.source_of = Some(list),
                            _ => record.populated.target_of = Some(list),
                        }
                    }
                }
            }
        }
        Ok(records)
    }

    /// Elements by compound id, on any branch, archived ones included.
    async fn lookup(&self, ids: Vec<ElementId>) -> MbeeResult<Vec<Element>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let filter = ElementFilter::default().with_ids(ids).include_archived(true);
        Ok(self.store.find_elements(&filter, &Page::default()).await?)
    }

    /// Drop elements of other projects the caller may not reference.
    async fn readable(&self, ctx: &AuthContext, home: &BranchId, elements: Vec<Element>) -> MbeeResult<Vec<Element>> {
        let home_project = home.project_id();
        let mut visible: HashMap<ProjectId, bool> = HashMap::new();
        let mut out = Vec::with_capacity(elements.len());
        for element in elements {
            let project_id = element.id.project_id();
            if project_id == home_project {
                out.push(element);
                continue;
            }
            let allowed = match visible.get(&project_id) {
                Some(allowed) => *allowed,
                None => {
                    let allowed = match self.store.get_project(&project_id).await? {
                        Some(project) => {
                            let internal = project.visibility == Visibility::Internal
                                && project.id.org == home.org;
                            internal || ctx.can_read(&project)
                        }
                        None => false,
                    };
                    visible.insert(project_id, allowed);
                    allowed
                }
            };
            if allowed {
                out.push(element);
            }
        }
        Ok(out)
    }

    // ---------------------------------------------------------------------
    // Writes
    // ---------------------------------------------------------------------

    /// Create one element or a batch of them.
    pub async fn create(
        &self,
        ctx: &AuthContext,
        org: &str,
        project: &str,
        branch: &str,
        payload: Value,
        options: &FindOptions,
    ) -> MbeeResult<Vec<ElementRecord>> {
        let branch_id = BranchId::new(org, project, branch);
        let created = self
            .create_batch(ctx, &branch_id, payload)
            .await
            .inspect_err(|e| log::warn!("Rejected create batch on {}: {}", branch_id, e))?;
        log::info!(
            "{} created {} element(s) on {}",
            ctx.user_id,
            created.len(),
            branch_id
        );
        self.populate(ctx, &branch_id, created, options).await
    }

    /// Create the element named by `element_id`; a body id must agree with it.
    pub async fn create_one(
        &self,
        ctx: &AuthContext,
        org: &str,
        project: &str,
        branch: &str,
        element_id: &str,
        payload: Value,
        options: &FindOptions,
    ) -> MbeeResult<ElementRecord> {
        let payload = bulk::reconcile_path_id(element_id, payload)?;
        let mut created = self.create(ctx, org, project, branch, payload, options).await?;
        created
            .pop()
            .ok_or_else(|| MbeeError::not_found(format!("Element [{}] not found.", element_id)))
    }

    async fn create_batch(&self, ctx: &AuthContext, branch: &BranchId, payload: Value) -> MbeeResult<Vec<Element>> {
        self.authorize(ctx, branch, Access::Write).await?;
        let raw = bulk::strip_namespace(bulk::normalize_elements(payload)?, branch)?;
        if raw.is_empty() {
            return Ok(Vec::new());
        }

        let mut batch = Vec::with_capacity(raw.len());
        for value in &raw {
            let new = self
                .validator
                .validate_create_payload(value)
                .map_err(|e| match bulk::payload_id(value) {
                    Some(id) => e.for_element(id),
                    None => e,
                })?;
            batch.push(new);
        }
        let ids: Vec<Id> = batch.iter().map(|e| e.id.clone()).collect();
        bulk::assert_unique(&ids)?;

        BranchGuard::assert_mutable(self.store.as_ref(), branch, BranchAction::Creating).await?;

        let compound: Vec<ElementId> = ids.iter().map(|id| branch.element(id.clone())).collect();
        let taken = self
            .store
            .find_elements(
                &ElementFilter::branch(branch)
                    .with_ids(compound.clone())
                    .include_archived(true),
                &Page::default(),
            )
            .await?;
        if !taken.is_empty() {
            let taken: Vec<&str> = taken.iter().map(|e| e.local_id()).collect();
            return Err(MbeeError::conflict(format!(
                "Elements with the following IDs already exist: [{}].",
                taken.join(", ")
            )));
        }

        let view = BatchView {
            ids: compound.iter().cloned().collect(),
            parents: batch
                .iter()
                .map(|n| (branch.element(n.id.clone()), n.parent_ref().resolve(branch)))
                .collect(),
        };

        let now = Utc::now();
        let mut elements = Vec::with_capacity(batch.len());
        for new in batch {
            let id = branch.element(new.id.clone());
            let changes = RefChanges {
                parent: Some(new.parent_ref()),
                source: Some(new.source_ref()),
                target: Some(new.target_ref()),
            };
            let refs = self
                .resolve_references(ctx, branch, &id, Resolved::default(), changes, &view)
                .await
                .map_err(|e| e.for_element(&new.id))?;

            let mut element = Element::new(id, &ctx.user_id);
            element.created_on = now;
            element.updated_on = now;
            element.name = new.name;
            element.documentation = new.documentation;
            element.element_type = new.element_type;
            element.parent = refs.parent;
            element.source = refs.source;
            element.target = refs.target;
            element.custom = new.custom;
            elements.push(element);
        }

        self.store.insert_elements(elements.clone()).await?;
        Ok(elements)
    }

    /// Update one element or a batch of them.
    pub async fn update(
        &self,
        ctx: &AuthContext,
        org: &str,
        project: &str,
        branch: &str,
        payload: Value,
        options: &FindOptions,
    ) -> MbeeResult<Vec<ElementRecord>> {
        let branch_id = BranchId::new(org, project, branch);
        let updated = self
            .update_batch(ctx, &branch_id, payload)
            .await
            .inspect_err(|e| log::warn!("Rejected update batch on {}: {}", branch_id, e))?;
        log::info!(
            "{} updated {} element(s) on {}",
            ctx.user_id,
            updated.len(),
            branch_id
        );
        self.populate(ctx, &branch_id, updated, options).await
    }

    /// Update the element named by `element_id`; a body id must agree with it.
    pub async fn update_one(
        &self,
        ctx: &AuthContext,
        org: &str,
        project: &str,
        branch: &str,
        element_id: &str,
        payload: Value,
        options: &FindOptions,
    ) -> MbeeResult<ElementRecord> {
        let payload = bulk::reconcile_path_id(element_id, payload)?;
        let mut updated = self.update(ctx, org, project, branch, payload, options).await?;
        updated
            .pop()
            .ok_or_else(|| MbeeError::not_found(format!("Element [{}] not found.", element_id)))
    }

    async fn update_batch(&self, ctx: &AuthContext, branch: &BranchId, payload: Value) -> MbeeResult<Vec<Element>> {
        self.authorize(ctx, branch, Access::Write).await?;
        let raw = bulk::strip_namespace(bulk::normalize_elements(payload)?, branch)?;
        if raw.is_empty() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::with_capacity(raw.len());
        for value in &raw {
            let id = bulk::payload_id(value)
                .ok_or_else(|| MbeeError::validation("Element ID not provided."))?;
            self.validator
                .validate_ref_id(id)
                .map_err(|e| e.for_element(id))?;
            ids.push(id.to_string());
        }
        bulk::assert_unique(&ids)?;

        BranchGuard::assert_mutable(self.store.as_ref(), branch, BranchAction::Updating).await?;

        let compound: Vec<ElementId> = ids.iter().map(|id| branch.element(id.clone())).collect();
        let mut existing: HashMap<ElementId, Element> = self
            .store
            .find_elements(
                &ElementFilter::branch(branch)
                    .with_ids(compound.clone())
                    .include_archived(true),
                &Page::default(),
            )
            .await?
            .into_iter()
            .map(|e| (e.id.clone(), e))
            .collect();
        let missing: Vec<&str> = compound
            .iter()
            .filter(|id| !existing.contains_key(*id))
            .map(|id| id.element.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(MbeeError::not_found(format!(
                "The following elements were not found: [{}].",
                missing.join(", ")
            )));
        }

        let view = BatchView {
            ids: compound.iter().cloned().collect(),
            parents: raw
                .iter()
                .zip(&compound)
                .filter_map(|(value, id)| {
                    let parent = value.get("parent")?.as_str()?;
                    Some((id.clone(), branch.element(parent)))
                })
                .collect(),
        };

        let now = Utc::now();
        let mut updated = Vec::with_capacity(raw.len());
        let mut changed = Vec::new();
        for (value, id) in raw.iter().zip(&compound) {
            let current = existing
                .remove(id)
                .ok_or_else(|| MbeeError::not_found(format!("Element [{}] not found.", id.element)))?;
            let (element, dirty) = self
                .apply_update(ctx, branch, value, current, &view, now)
                .await
                .map_err(|e| e.for_element(&id.element))?;
            if dirty {
                changed.push(element.clone());
            }
            updated.push(element);
        }

        if !changed.is_empty() {
            self.store.replace_elements(changed).await?;
        }
        Ok(updated)
    }

    /// Check one update payload against its stored element and apply it.
    ///
    /// Returns the new element state and whether anything changed.
    async fn apply_update(
        &self,
        ctx: &AuthContext,
        branch: &BranchId,
        raw: &Value,
        mut element: Element,
        view: &BatchView,
        now: DateTime<Utc>,
    ) -> MbeeResult<(Element, bool)> {
        if element.archived && raw.get("archived") != Some(&Value::Bool(false)) {
            return Err(MbeeError::forbidden(
                "Element is archived. Archived elements cannot be modified.",
            ));
        }

        let patch = self.validator.validate_update_payload(raw, &element)?;
        if patch.is_empty() {
            return Ok((element, false));
        }
        if is_reserved(element.local_id()) {
            if patch.archived == Some(true) {
                return Err(MbeeError::forbidden("Reserved elements cannot be archived."));
            }
            if patch.parent.is_some() {
                return Err(MbeeError::forbidden("Reserved elements cannot be moved."));
            }
        }

        let current = Resolved {
            parent: element.parent.clone(),
            source: element.source.clone(),
            target: element.target.clone(),
        };
        let changes = RefChanges {
            parent: patch.parent.clone(),
            source: patch.source.clone(),
            target: patch.target.clone(),
        };
        let refs = self
            .resolve_references(ctx, branch, &element.id, current, changes, view)
            .await?;

        if let Some(name) = patch.name {
            element.name = name;
        }
        if let Some(documentation) = patch.documentation {
            element.documentation = documentation;
        }
        if let Some(element_type) = patch.element_type {
            element.element_type = element_type;
        }
        element.parent = refs.parent;
        element.source = refs.source;
        element.target = refs.target;
        if let Some(custom) = patch.custom {
            merge_custom(&mut element.custom, custom);
        }
        if let Some(archived) = patch.archived {
            element.set_archived(archived, &ctx.user_id, now);
        }
        element.last_modified_by = ctx.user_id.clone();
        element.updated_on = now;
        Ok((element, true))
    }

    /// Apply reference changes and check them: source/target pairing,
    /// self-loops, namespace visibility, existence, then parent cycles.
    async fn resolve_references(
        &self,
        ctx: &AuthContext,
        branch: &BranchId,
        id: &ElementId,
        current: Resolved,
        changes: RefChanges,
        view: &BatchView,
    ) -> MbeeResult<Resolved> {
        let resolve = |r: &Option<ElementRef>| r.as_ref().map(|r| r.resolve(branch));
        let resolved = Resolved {
            parent: changes
                .parent
                .as_ref()
                .map(|p| p.resolve(branch))
                .or(current.parent),
            source: match &changes.source {
                Some(source) => resolve(source),
                None => current.source,
            },
            target: match &changes.target {
                Some(target) => resolve(target),
                None => current.target,
            },
        };

        match (&resolved.source, &resolved.target) {
            (Some(_), None) => {
                return Err(MbeeError::validation("A target is required if source is provided."))
            }
            (None, Some(_)) => {
                return Err(MbeeError::validation("A source is required if target is provided."))
            }
            _ => {}
        }

        if resolved.source.as_ref() == Some(id) {
            return Err(MbeeError::validation("Element's source cannot be self."));
        }
        if resolved.target.as_ref() == Some(id) {
            return Err(MbeeError::validation("Element's target cannot be self."));
        }
        if resolved.parent.as_ref() == Some(id) {
            return Err(MbeeError::validation("Element's parent cannot be self."));
        }

        let mut wanted: Vec<(&str, ElementId)> = Vec::new();
        if let Some(parent) = &changes.parent {
            wanted.push(("Parent", parent.resolve(branch)));
        }
        for (label, change) in [("Source", &changes.source), ("Target", &changes.target)] {
            if let Some(Some(reference)) = change {
                if let Some(namespace) = reference.namespace.as_ref().filter(|_| reference.is_cross_branch(branch)) {
                    self.check_namespace(ctx, branch, namespace).await?;
                }
                wanted.push((label, reference.resolve(branch)));
            }
        }

        let lookup_ids: Vec<ElementId> = wanted
            .iter()
            .map(|(_, id)| id.clone())
            .filter(|id| !view.ids.contains(id))
            .collect();
        let found: HashSet<ElementId> = self
            .lookup(lookup_ids)
            .await?
            .into_iter()
            .map(|e| e.id)
            .collect();
        for (label, reference) in &wanted {
            if !view.ids.contains(reference) && !found.contains(reference) {
                return Err(MbeeError::not_found(format!(
                    "{} element [{}] not found.",
                    label, reference
                )));
            }
        }

        if let (Some(_), Some(parent)) = (&changes.parent, &resolved.parent) {
            self.check_parent_cycle(id, parent, view).await?;
        }
        Ok(resolved)
    }

    /// A cross-branch reference must stay in the org and point at a branch
    /// of a project the caller may see.
    async fn check_namespace(&self, ctx: &AuthContext, home: &BranchId, namespace: &Namespace) -> MbeeResult<()> {
        if namespace.org != home.org {
            return Err(MbeeError::forbidden(format!(
                "Cannot reference elements outside of org [{}].",
                home.org
            )));
        }
        let project_id = ProjectId::new(namespace.org.clone(), namespace.project.clone());
        let project = self
            .store
            .get_project(&project_id)
            .await?
            .ok_or_else(|| MbeeError::not_found(format!("Project [{}] not found.", project_id)))?;
        if project.visibility != Visibility::Internal && !ctx.can_read(&project) {
            return Err(MbeeError::forbidden(format!(
                "User [{}] does not have permission to reference elements in project [{}].",
                ctx.user_id, project_id
            )));
        }
        BranchGuard::load(self.store.as_ref(), &namespace.branch_id()).await?;
        Ok(())
    }

    /// Walk upward from `new_parent`; meeting `id` on the way is a cycle.
    async fn check_parent_cycle(&self, id: &ElementId, new_parent: &ElementId, view: &BatchView) -> MbeeResult<()> {
        let mut visited = HashSet::new();
        let mut current = Some(new_parent.clone());
        while let Some(node) = current {
            if &node == id {
                return Err(MbeeError::validation(format!(
                    "Moving under [{}] would create a containment cycle.",
                    new_parent.element
                )));
            }
            if !visited.insert(node.clone()) {
                break;
            }
            current = match view.parents.get(&node) {
                Some(parent) => Some(parent.clone()),
                None => self
                    .lookup(vec![node])
                    .await?
                    .into_iter()
                    .next()
                    .and_then(|e| e.parent),
            };
        }
        Ok(())
    }

    /// Delete elements and everything contained in them.
    ///
    /// References to removed elements from anywhere are repointed to the
    /// `undefined` element of the referencing element's branch. Returns the
    /// local ids of every removed element.
    pub async fn remove(
        &self,
        ctx: &AuthContext,
        org: &str,
        project: &str,
        branch: &str,
        payload: Value,
    ) -> MbeeResult<Vec<Id>> {
        let branch_id = BranchId::new(org, project, branch);
        let removed = self
            .remove_batch(ctx, &branch_id, payload)
            .await
            .inspect_err(|e| log::warn!("Rejected remove batch on {}: {}", branch_id, e))?;
        log::info!(
            "{} removed {} element(s) from {}",
            ctx.user_id,
            removed.len(),
            branch_id
        );
        Ok(removed)
    }

    async fn remove_batch(&self, ctx: &AuthContext, branch: &BranchId, payload: Value) -> MbeeResult<Vec<Id>> {
        self.authorize(ctx, branch, Access::Write).await?;
        let ids = bulk::normalize_ids(payload)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        bulk::assert_unique(&ids)?;

        BranchGuard::assert_mutable(self.store.as_ref(), branch, BranchAction::Deleting).await?;

        if let Some(reserved) = ids.iter().find(|id| is_reserved(id)) {
            return Err(MbeeError::forbidden(format!(
                "Element [{}] is reserved and cannot be removed.",
                reserved
            )));
        }

        let compound: Vec<ElementId> = ids.iter().map(|id| branch.element(id.clone())).collect();
        let found: HashSet<ElementId> = self
            .store
            .find_elements(
                &ElementFilter::branch(branch)
                    .with_ids(compound.clone())
                    .include_archived(true),
                &Page::default(),
            )
            .await?
            .into_iter()
            .map(|e| e.id)
            .collect();
        let missing: Vec<&str> = compound
            .iter()
            .filter(|id| !found.contains(*id))
            .map(|id| id.element.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(MbeeError::not_found(format!(
                "The following elements were not found: [{}].",
                missing.join(", ")
            )));
        }

        let mut seen: HashSet<ElementId> = compound.iter().cloned().collect();
        let descendants = self
            .descendants(branch, compound.clone(), true, &mut seen)
            .await?;
        let mut removed = compound;
        removed.extend(descendants.into_iter().map(|e| e.id));

        self.store.delete_elements(&removed).await?;
        let repaired = self.repair_references(ctx, &removed).await?;
        if repaired > 0 {
            log::info!("Repointed {} dependent element(s) to [{}]", repaired, UNDEFINED_ELEMENT);
        }

        Ok(removed.into_iter().map(|id| id.element).collect())
    }

    /// Repoint every reference to a removed element at its branch's sentinel.
    ///
    /// Dependents on tags keep their dangling references.
    async fn repair_references(&self, ctx: &AuthContext, removed: &[ElementId]) -> MbeeResult<usize> {
        let gone: HashSet<&ElementId> = removed.iter().collect();
        let found = self
            .store
            .find_elements(&ElementFilter::referencing(removed.to_vec()), &Page::default())
            .await?;

        let mut tags: HashMap<BranchId, bool> = HashMap::new();
        for branch in found.iter().map(Element::branch_id).unique() {
            let tag = BranchGuard::load(self.store.as_ref(), &branch).await?.tag;
            if tag {
                log::debug!("Leaving references on tag {} untouched", branch);
            }
            tags.insert(branch, tag);
        }
        let dependents: Vec<Element> = found
            .into_iter()
            .filter(|element| !tags.get(&element.branch_id()).copied().unwrap_or(false))
            .collect();
        if dependents.is_empty() {
            return Ok(0);
        }

        let now = Utc::now();
        let repaired: Vec<Element> = dependents
            .into_iter()
            .map(|mut element| {
                let sentinel = element.branch_id().element(UNDEFINED_ELEMENT);
                for slot in [&mut element.parent, &mut element.source, &mut element.target] {
                    if slot.as_ref().map(|r| gone.contains(r)).unwrap_or(false) {
                        *slot = Some(sentinel.clone());
                    }
                }
                element.last_modified_by = ctx.user_id.clone();
                element.updated_on = now;
                element
            })
            .collect();
        let count = repaired.len();
        self.store.replace_elements(repaired).await?;
        Ok(count)
    }
}

/// The reference a populate field follows on `element`.
fn edge(element: &Element, field: PopulateField) -> Option<&ElementId> {
    match field {
        PopulateField::Parent | PopulateField::Contains => element.parent.as_ref(),
        PopulateField::Source | PopulateField::SourceOf => element.source.as_ref(),
        PopulateField::Target | PopulateField::TargetOf => element.target.as_ref(),
    }
}
