use anyhow::Result;
use serde_json::json;
use std::sync::Arc;

use crate::logic::{BranchOperations, ElementController, Validator};
use crate::model::{AuthContext, FindOptions, NewBranch, Org, Project, ProjectId, Visibility};
use crate::store::traits::Store;

pub const SEED_ORG: &str = "default";
pub const SEED_PROJECT: &str = "demo";

/// Load a small demonstration model: one org, one internal project, a
/// containment tree with a couple of relationships, and a `v1` tag.
///
/// Does nothing when the demo org already exists.
pub async fn load_seed_data<S: Store>(store: Arc<S>, validator: Validator) -> Result<()> {
    if store.get_org(&SEED_ORG.to_string()).await?.is_some() {
        log::info!("Seed org [{}] already present, skipping", SEED_ORG);
        return Ok(());
    }

    let ctx = AuthContext::system();
    create_org_and_project(store.as_ref(), &ctx).await?;

    let controller = ElementController::new(store.clone(), validator);
    controller
        .create(&ctx, SEED_ORG, SEED_PROJECT, "master", demo_model(), &FindOptions::default())
        .await?;

    BranchOperations::create_branch(
        store.as_ref(),
        &ctx,
        SEED_ORG,
        SEED_PROJECT,
        NewBranch {
            id: "v1".to_string(),
            name: Some("Release 1".to_string()),
            source: None,
            tag: true,
        },
    )
    .await?;

    log::info!("Loaded seed data into {}:{}", SEED_ORG, SEED_PROJECT);
    Ok(())
}

async fn create_org_and_project<S: Store>(store: &S, ctx: &AuthContext) -> Result<()> {
    BranchOperations::create_org(store, ctx, Org::new(SEED_ORG, "Default Org", &ctx.user_id)).await?;
    let project = Project::new(
        ProjectId::new(SEED_ORG, SEED_PROJECT),
        "Demo Vehicle",
        &ctx.user_id,
    )
    .with_visibility(Visibility::Internal);
    BranchOperations::create_project(store, ctx, project).await?;
    Ok(())
}

fn demo_model() -> serde_json::Value {
    json!([
        {
            "id": "vehicle",
            "name": "Vehicle",
            "type": "Package",
            "documentation": "Top level package of the demo model"
        },
        {
            "id": "chassis",
            "name": "Chassis",
            "type": "Block",
            "parent": "vehicle",
            "custom": {"mass": {"value": 420, "unit": "kg"}}
        },
        {
            "id": "engine",
            "name": "Engine",
            "type": "Block",
            "parent": "vehicle",
            "documentation": "Four cylinder combustion engine",
            "custom": {"mass": {"value": 180, "unit": "kg"}}
        },
        {
            "id": "gearbox",
            "name": "Gearbox",
            "type": "Block",
            "parent": "vehicle",
            "custom": {"gears": 6}
        },
        {
            "id": "engine-drives-gearbox",
            "name": "drives",
            "type": "Association",
            "parent": "vehicle",
            "source": "engine",
            "target": "gearbox"
        },
        {
            "id": "engine-mounted-on-chassis",
            "name": "mounted on",
            "type": "Association",
            "parent": "vehicle",
            "source": "engine",
            "target": "chassis"
        }
    ])
}
