use crate::model::{Branch, BranchId, Element, ElementFilter, ElementId, Id, Org, Page, Project, ProjectId};
use anyhow::Result;

#[async_trait::async_trait]
pub trait OrgStore: Send + Sync {
    async fn get_org(&self, id: &Id) -> Result<Option<Org>>;
    async fn upsert_org(&self, org: Org) -> Result<()>;
}

#[async_trait::async_trait]
pub trait ProjectStore: Send + Sync {
    async fn get_project(&self, id: &ProjectId) -> Result<Option<Project>>;
    async fn upsert_project(&self, project: Project) -> Result<()>;
}

#[async_trait::async_trait]
pub trait BranchStore: Send + Sync {
    async fn get_branch(&self, id: &BranchId) -> Result<Option<Branch>>;
    async fn upsert_branch(&self, branch: Branch) -> Result<()>;
    /// Delete a branch record together with every element on it
    async fn delete_branch(&self, id: &BranchId) -> Result<bool>;
}

/// Document-collection operations over element documents.
///
/// Multi-document writes are applied as a unit by implementations that can
/// (a transaction for PostgreSQL, a single lock for the in-memory store).
#[async_trait::async_trait]
pub trait ElementStore: Send + Sync {
    /// Elements matching the filter, ordered by compound id unless `page` sorts
    async fn find_elements(&self, filter: &ElementFilter, page: &Page) -> Result<Vec<Element>>;
    /// Insert new documents; fails without writing anything if an id exists
    async fn insert_elements(&self, elements: Vec<Element>) -> Result<()>;
    /// Replace existing documents by id
    async fn replace_elements(&self, elements: Vec<Element>) -> Result<()>;
    /// Delete documents by id, returning how many were removed
    async fn delete_elements(&self, ids: &[ElementId]) -> Result<u64>;
    /// Case-insensitive match of any whitespace-separated term against
    /// `name` or `documentation`
    async fn search_elements(
        &self,
        filter: &ElementFilter,
        text: &str,
        page: &Page,
    ) -> Result<Vec<Element>>;
}

pub trait Store: OrgStore + ProjectStore + BranchStore + ElementStore + Send + Sync {}
impl<T: OrgStore + ProjectStore + BranchStore + ElementStore + Send + Sync> Store for T {}
