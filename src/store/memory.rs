use anyhow::{anyhow, Result};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

use crate::model::{Branch, BranchId, Element, ElementFilter, ElementId, Id, Org, Page, Project, ProjectId};
use crate::store::traits::{BranchStore, ElementStore, OrgStore, ProjectStore};

/// In-process document store.
///
/// Every collection sits behind its own lock; a multi-document write takes
/// the element lock once, so batches are applied all-or-nothing.
#[derive(Debug, Default)]
pub struct MemoryStore {
    orgs: RwLock<HashMap<Id, Org>>,
    projects: RwLock<BTreeMap<String, Project>>,
    branches: RwLock<BTreeMap<String, Branch>>,
    /// Keyed by compound element id, so iteration is in id order
    elements: RwLock<BTreeMap<String, Element>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn element_count(&self) -> usize {
        self.elements.read().len()
    }
}

/// Whether any whitespace-separated term of `text` occurs in the element's
/// name or documentation, ignoring case.
pub fn text_matches(element: &Element, text: &str) -> bool {
    let name = element.name.to_lowercase();
    let documentation = element.documentation.to_lowercase();
    text.split_whitespace()
        .map(str::to_lowercase)
        .any(|term| name.contains(&term) || documentation.contains(&term))
}

#[async_trait::async_trait]
impl OrgStore for MemoryStore {
    async fn get_org(&self, id: &Id) -> Result<Option<Org>> {
        Ok(self.orgs.read().get(id).cloned())
    }

    async fn upsert_org(&self, org: Org) -> Result<()> {
        self.orgs.write().insert(org.id.clone(), org);
        Ok(())
    }
}

#[async_trait::async_trait]
impl ProjectStore for MemoryStore {
    async fn get_project(&self, id: &ProjectId) -> Result<Option<Project>> {
        Ok(self.projects.read().get(&id.to_string()).cloned())
    }

    async fn upsert_project(&self, project: Project) -> Result<()> {
        self.projects.write().insert(project.id.to_string(), project);
        Ok(())
    }
}

#[async_trait::async_trait]
impl BranchStore for MemoryStore {
    async fn get_branch(&self, id: &BranchId) -> Result<Option<Branch>> {
        Ok(self.branches.read().get(&id.to_string()).cloned())
    }

    async fn upsert_branch(&self, branch: Branch) -> Result<()> {
        self.branches.write().insert(branch.id.to_string(), branch);
        Ok(())
    }

    async fn delete_branch(&self, id: &BranchId) -> Result<bool> {
        let removed = self.branches.write().remove(&id.to_string()).is_some();
        self.elements.write().retain(|_, e| &e.branch_id() != id);
        Ok(removed)
    }
}

#[async_trait::async_trait]
impl ElementStore for MemoryStore {
    async fn find_elements(&self, filter: &ElementFilter, page: &Page) -> Result<Vec<Element>> {
        let matched: Vec<Element> = self
            .elements
            .read()
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        Ok(page.apply(matched))
    }

    async fn insert_elements(&self, elements: Vec<Element>) -> Result<()> {
        let mut store = self.elements.write();
        let mut seen = std::collections::HashSet::new();
        for element in &elements {
            let key = element.id.to_string();
            if store.contains_key(&key) || !seen.insert(key.clone()) {
                return Err(anyhow!("Duplicate element id: {}", key));
            }
        }
        for element in elements {
            store.insert(element.id.to_string(), element);
        }
        Ok(())
    }

    async fn replace_elements(&self, elements: Vec<Element>) -> Result<()> {
        let mut store = self.elements.write();
        if let Some(missing) = elements.iter().find(|e| !store.contains_key(&e.id.to_string())) {
            return Err(anyhow!("Element not found: {}", missing.id));
        }
        for element in elements {
            store.insert(element.id.to_string(), element);
        }
        Ok(())
    }

    async fn delete_elements(&self, ids: &[ElementId]) -> Result<u64> {
        let mut store = self.elements.write();
        let removed = ids
            .iter()
            .filter(|id| store.remove(&id.to_string()).is_some())
            .count();
        Ok(removed as u64)
    }

    async fn search_elements(
        &self,
        filter: &ElementFilter,
        text: &str,
        page: &Page,
    ) -> Result<Vec<Element>> {
        let matched: Vec<Element> = self
            .elements
            .read()
            .values()
            .filter(|e| filter.matches(e) && text_matches(e, text))
            .cloned()
            .collect();
        Ok(page.apply(matched))
    }
}
