use anyhow::{bail, Context, Result};
use sqlx::{postgres::PgPoolOptions, types::Json, PgPool, Postgres, QueryBuilder, Row};

use crate::model::{
    Branch, BranchId, Element, ElementField, ElementFilter, ElementId, Id, Org, Page, Project,
    ProjectId,
};
use crate::store::traits::{BranchStore, ElementStore, OrgStore, ProjectStore};

/// Idempotent schema: one JSONB document per row, keyed by compound id.
const SCHEMA: [&str; 9] = [
    "CREATE TABLE IF NOT EXISTS orgs (id TEXT PRIMARY KEY, doc JSONB NOT NULL)",
    "CREATE TABLE IF NOT EXISTS projects (id TEXT PRIMARY KEY, org TEXT NOT NULL, doc JSONB NOT NULL)",
    "CREATE TABLE IF NOT EXISTS branches (id TEXT PRIMARY KEY, project TEXT NOT NULL, doc JSONB NOT NULL)",
    "CREATE TABLE IF NOT EXISTS elements (id TEXT PRIMARY KEY, branch TEXT NOT NULL, archived BOOLEAN NOT NULL DEFAULT FALSE, doc JSONB NOT NULL)",
    "CREATE INDEX IF NOT EXISTS elements_branch_idx ON elements (branch)",
    "CREATE INDEX IF NOT EXISTS elements_parent_idx ON elements ((doc->>'parent'))",
    "CREATE INDEX IF NOT EXISTS elements_source_idx ON elements ((doc->>'source'))",
    "CREATE INDEX IF NOT EXISTS elements_target_idx ON elements ((doc->>'target'))",
    "CREATE INDEX IF NOT EXISTS projects_org_idx ON projects (org)",
];

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store with the given database URL
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to create PostgreSQL connection pool")?;

        Ok(Self { pool })
    }

    /// Create tables and indexes if they do not exist yet
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .with_context(|| format!("Failed to run migration: {}", statement))?;
        }
        log::info!("Database schema is up to date");
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn id_strings(ids: &[ElementId]) -> Vec<String> {
    ids.iter().map(|id| id.to_string()).collect()
}

/// Escape LIKE metacharacters and wrap the term for a substring match.
fn like_pattern(term: &str) -> String {
    let escaped = term
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &ElementFilter) {
    qb.push(" WHERE TRUE");
    if !filter.include_archived {
        qb.push(" AND archived = FALSE");
    }
    if let Some(branch) = &filter.branch {
        qb.push(" AND branch = ").push_bind(branch.to_string());
    }
    if let Some(ids) = &filter.ids {
        qb.push(" AND id = ANY(").push_bind(id_strings(ids)).push(")");
    }
    for (column, set) in [
        ("parent", &filter.parents),
        ("source", &filter.sources),
        ("target", &filter.targets),
    ] {
        if let Some(ids) = set {
            qb.push(format!(" AND doc->>'{}' = ANY(", column))
                .push_bind(id_strings(ids))
                .push(")");
        }
    }
    if let Some(ids) = &filter.referencing {
        let ids = id_strings(ids);
        qb.push(" AND (doc->>'parent' = ANY(")
            .push_bind(ids.clone())
            .push(") OR doc->>'source' = ANY(")
            .push_bind(ids.clone())
            .push(") OR doc->>'target' = ANY(")
            .push_bind(ids)
            .push("))");
    }
    for condition in &filter.conditions {
        if condition.value.is_null() {
            qb.push(" AND (doc #> ")
                .push_bind(condition.path.clone())
                .push(" IS NULL OR doc #> ")
                .push_bind(condition.path.clone())
                .push(" = 'null'::jsonb)");
        } else {
            qb.push(" AND doc #> ")
                .push_bind(condition.path.clone())
                .push(" = ")
                .push_bind(Json(condition.value.clone()));
        }
    }
}

fn push_page(qb: &mut QueryBuilder<'_, Postgres>, page: &Page) {
    qb.push(" ORDER BY ");
    if let Some(sort) = page.sort {
        match sort.field {
            ElementField::Archived => qb.push("archived"),
            ElementField::Id => qb.push("id"),
            field => qb.push(format!("doc->>'{}'", field.as_str())),
        };
        qb.push(if sort.descending { " DESC, " } else { " ASC, " });
    }
    qb.push("id ASC");
    if let Some(limit) = page.limit {
        qb.push(" LIMIT ").push_bind(limit as i64);
    }
    if page.skip > 0 {
        qb.push(" OFFSET ").push_bind(page.skip as i64);
    }
}

async fn fetch_elements(pool: &PgPool, mut qb: QueryBuilder<'_, Postgres>) -> Result<Vec<Element>> {
    let rows = qb
        .build()
        .fetch_all(pool)
        .await
        .context("Failed to query elements")?;

    rows.into_iter()
        .map(|row| {
            let doc: Json<Element> = row.try_get("doc").context("Failed to decode element")?;
            Ok(doc.0)
        })
        .collect()
}

#[async_trait::async_trait]
impl OrgStore for PostgresStore {
    async fn get_org(&self, id: &Id) -> Result<Option<Org>> {
        let row = sqlx::query("SELECT doc FROM orgs WHERE id = $1")
            .bind(id.clone())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch org")?;

        let Some(row) = row else {
            return Ok(None);
        };
        let doc: Json<Org> = row.try_get("doc").context("Failed to decode org")?;
        Ok(Some(doc.0))
    }

    async fn upsert_org(&self, org: Org) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO orgs (id, doc) VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET doc = EXCLUDED.doc
            "#,
        )
        .bind(org.id.clone())
        .bind(Json(org))
        .execute(&self.pool)
        .await
        .context("Failed to upsert org")?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl ProjectStore for PostgresStore {
    async fn get_project(&self, id: &ProjectId) -> Result<Option<Project>> {
        let row = sqlx::query("SELECT doc FROM projects WHERE id = $1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch project")?;

        let Some(row) = row else {
            return Ok(None);
        };
        let doc: Json<Project> = row.try_get("doc").context("Failed to decode project")?;
        Ok(Some(doc.0))
    }

    async fn upsert_project(&self, project: Project) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO projects (id, org, doc) VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET doc = EXCLUDED.doc
            "#,
        )
        .bind(project.id.to_string())
        .bind(project.id.org.clone())
        .bind(Json(project))
        .execute(&self.pool)
        .await
        .context("Failed to upsert project")?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl BranchStore for PostgresStore {
    async fn get_branch(&self, id: &BranchId) -> Result<Option<Branch>> {
        let row = sqlx::query("SELECT doc FROM branches WHERE id = $1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch branch")?;

        let Some(row) = row else {
            return Ok(None);
        };
        let doc: Json<Branch> = row.try_get("doc").context("Failed to decode branch")?;
        Ok(Some(doc.0))
    }

    async fn upsert_branch(&self, branch: Branch) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO branches (id, project, doc) VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET doc = EXCLUDED.doc
            "#,
        )
        .bind(branch.id.to_string())
        .bind(branch.id.project_id().to_string())
        .bind(Json(branch))
        .execute(&self.pool)
        .await
        .context("Failed to upsert branch")?;

        Ok(())
    }

    async fn delete_branch(&self, id: &BranchId) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        sqlx::query("DELETE FROM elements WHERE branch = $1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .context("Failed to delete branch elements")?;

        let result = sqlx::query("DELETE FROM branches WHERE id = $1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .context("Failed to delete branch")?;

        tx.commit().await.context("Failed to commit branch deletion")?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait::async_trait]
impl ElementStore for PostgresStore {
    async fn find_elements(&self, filter: &ElementFilter, page: &Page) -> Result<Vec<Element>> {
        let mut qb = QueryBuilder::new("SELECT doc FROM elements");
        push_filter(&mut qb, filter);
        push_page(&mut qb, page);
        fetch_elements(&self.pool, qb).await
    }

    async fn insert_elements(&self, elements: Vec<Element>) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        for element in elements {
            sqlx::query("INSERT INTO elements (id, branch, archived, doc) VALUES ($1, $2, $3, $4)")
                .bind(element.id.to_string())
                .bind(element.branch_id().to_string())
                .bind(element.archived)
                .bind(Json(&element))
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Failed to insert element {}", element.id))?;
        }

        tx.commit().await.context("Failed to commit element insert")?;
        Ok(())
    }

    async fn replace_elements(&self, elements: Vec<Element>) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        for element in elements {
            let result =
                sqlx::query("UPDATE elements SET branch = $2, archived = $3, doc = $4 WHERE id = $1")
                    .bind(element.id.to_string())
                    .bind(element.branch_id().to_string())
                    .bind(element.archived)
                    .bind(Json(&element))
                    .execute(&mut *tx)
                    .await
                    .with_context(|| format!("Failed to update element {}", element.id))?;

            if result.rows_affected() == 0 {
                bail!("Element not found: {}", element.id);
            }
        }

        tx.commit().await.context("Failed to commit element update")?;
        Ok(())
    }

    async fn delete_elements(&self, ids: &[ElementId]) -> Result<u64> {
        let result = sqlx::query("DELETE FROM elements WHERE id = ANY($1)")
            .bind(id_strings(ids))
            .execute(&self.pool)
            .await
            .context("Failed to delete elements")?;

        Ok(result.rows_affected())
    }

    async fn search_elements(
        &self,
        filter: &ElementFilter,
        text: &str,
        page: &Page,
    ) -> Result<Vec<Element>> {
        let patterns: Vec<String> = text.split_whitespace().map(like_pattern).collect();
        if patterns.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb = QueryBuilder::new("SELECT doc FROM elements");
        push_filter(&mut qb, filter);
        qb.push(" AND (doc->>'name' ILIKE ANY(")
            .push_bind(patterns.clone())
            .push(") OR doc->>'documentation' ILIKE ANY(")
            .push_bind(patterns)
            .push("))");
        push_page(&mut qb, page);
        fetch_elements(&self.pool, qb).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::QueryCondition;
    use serde_json::json;

    #[test]
    fn test_like_pattern_escapes_metacharacters() {
        assert_eq!(like_pattern("wheel"), "%wheel%");
        assert_eq!(like_pattern("50%_off"), "%50\\%\\_off%");
    }

    #[test]
    fn test_filter_sql_shape() {
        let branch = BranchId::new("o", "p", "master");
        let filter = ElementFilter::branch(&branch)
            .with_parents(vec![branch.element("model")])
            .with_conditions(vec![QueryCondition {
                path: vec!["custom".into(), "owner".into()],
                value: json!("alice"),
            }]);

        let mut qb = QueryBuilder::<Postgres>::new("SELECT doc FROM elements");
        push_filter(&mut qb, &filter);
        push_page(
            &mut qb,
            &Page {
                sort: Some("-name".parse().unwrap()),
                skip: 5,
                limit: Some(10),
            },
        );
        let sql = qb.sql();
        assert!(sql.contains("archived = FALSE"));
        assert!(sql.contains("branch = $1"));
        assert!(sql.contains("doc->>'parent' = ANY($2)"));
        assert!(sql.contains("doc #> $3 = $4"));
        assert!(sql.contains("ORDER BY doc->>'name' DESC, id ASC LIMIT $5 OFFSET $6"));
    }
}
