use mbee_core::config::ValidatorConfig;
use mbee_core::{
    to_documents, to_jmi3, AuthContext, BranchOperations, ElementController, ElementSelector,
    ErrorKind, FindOptions, MbeeResult, MemoryStore, NewBranch, Org, Project, ProjectId, Validator,
};
use serde_json::{json, Value};
use std::sync::Arc;

const ORG: &str = "acme";
const PROJECT: &str = "rover";

// Wraps the controller so every call targets one org/project
struct TestModel {
    controller: ElementController<MemoryStore>,
    ctx: AuthContext,
}

impl TestModel {
    async fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let ctx = AuthContext::admin("tester");
        BranchOperations::create_org(store.as_ref(), &ctx, Org::new(ORG, "Acme", "tester"))
            .await
            .unwrap();
        BranchOperations::create_project(
            store.as_ref(),
            &ctx,
            Project::new(ProjectId::new(ORG, PROJECT), "Rover", "tester"),
        )
        .await
        .unwrap();
        let validator = Validator::new(&ValidatorConfig::default()).unwrap();
        Self {
            controller: ElementController::new(store, validator),
            ctx,
        }
    }

    async fn create(&self, branch: &str, payload: Value) -> MbeeResult<Vec<Value>> {
        let options = FindOptions::default();
        let records = self
            .controller
            .create(&self.ctx, ORG, PROJECT, branch, payload, &options)
            .await?;
        Ok(to_documents(&records, &options))
    }

    async fn update(&self, payload: Value) -> MbeeResult<Vec<Value>> {
        let options = FindOptions::default();
        let records = self
            .controller
            .update(&self.ctx, ORG, PROJECT, "master", payload, &options)
            .await?;
        Ok(to_documents(&records, &options))
    }

    async fn find(&self, ids: &[&str], options: FindOptions) -> Vec<Value> {
        self.find_on("master", ids, options).await
    }

    async fn find_on(&self, branch: &str, ids: &[&str], options: FindOptions) -> Vec<Value> {
        let selector = ElementSelector::Ids(ids.iter().map(|s| s.to_string()).collect());
        let records = self
            .controller
            .find(&self.ctx, ORG, PROJECT, branch, selector, &options)
            .await
            .unwrap();
        to_documents(&records, &options)
    }

    async fn remove(&self, project: &str, branch: &str, payload: Value) -> MbeeResult<Vec<String>> {
        self.controller
            .remove(&self.ctx, ORG, project, branch, payload)
            .await
    }

    async fn tag(&self, id: &str) {
        BranchOperations::create_branch(
            self.controller.store().as_ref(),
            &self.ctx,
            ORG,
            PROJECT,
            NewBranch {
                id: id.into(),
                name: None,
                source: None,
                tag: true,
            },
        )
        .await
        .unwrap();
    }

    async fn find_one(&self, id: &str) -> Value {
        let mut found = self.find(&[id], FindOptions::default()).await;
        assert_eq!(found.len(), 1, "expected exactly one [{}]", id);
        found.remove(0)
    }

    async fn search(&self, text: &str, archived: bool) -> Vec<Value> {
        let options = FindOptions::default().with_archived(archived);
        let records = self
            .controller
            .search(&self.ctx, ORG, PROJECT, "master", text, &options)
            .await
            .unwrap();
        to_documents(&records, &options)
    }

    async fn count(&self) -> usize {
        self.controller.store().element_count()
    }
}

#[tokio::test]
async fn test_create_then_find_round_trips() {
    let model = TestModel::new().await;
    let payload = json!({
        "id": "wheel",
        "name": "Front Wheel",
        "documentation": "Spoked wheel",
        "type": "Block",
        "custom": {"diameter": {"value": 0.6, "unit": "m"}}
    });
    let created = model.create("master", payload.clone()).await.unwrap();
    let found = model.find_one("wheel").await;
    assert_eq!(created[0], found);

    for key in ["id", "name", "documentation", "type", "custom"] {
        assert_eq!(found[key], payload[key], "field [{}]", key);
    }
    assert_eq!(found["parent"], "model");
    assert_eq!(found["org"], ORG);
    assert_eq!(found["project"], PROJECT);
    assert_eq!(found["branch"], "master");
}

#[tokio::test]
async fn test_self_loop_is_rejected() {
    let model = TestModel::new().await;
    model.create("master", json!([{"id": "a"}, {"id": "b"}])).await.unwrap();

    let err = model
        .create("master", json!({"id": "r", "source": "r", "target": "a"}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadRequest);
    assert!(err.to_string().contains("source cannot be self"));

    model
        .create("master", json!({"id": "r", "source": "a", "target": "b"}))
        .await
        .unwrap();
    let err = model
        .update(json!({"id": "r", "target": "r"}))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("target cannot be self"));
}

#[tokio::test]
async fn test_source_and_target_must_be_paired() {
    let model = TestModel::new().await;
    model.create("master", json!([{"id": "a"}, {"id": "b"}])).await.unwrap();

    let err = model
        .create("master", json!({"id": "r", "target": "b"}))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("A source is required if target is provided."));

    model
        .create("master", json!({"id": "r", "source": "a", "target": "b"}))
        .await
        .unwrap();
    let err = model
        .update(json!({"id": "r", "target": null}))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("A target is required if source is provided."));

    let cleared = model
        .update(json!({"id": "r", "source": null, "target": null}))
        .await
        .unwrap();
    assert_eq!(cleared[0]["source"], Value::Null);
    assert_eq!(cleared[0]["target"], Value::Null);
}

#[tokio::test]
async fn test_deleting_a_source_repoints_to_undefined() {
    let model = TestModel::new().await;
    model
        .create(
            "master",
            json!([{"id": "b"}, {"id": "c"}, {"id": "a", "source": "b", "target": "c"}]),
        )
        .await
        .unwrap();

    let removed = model.remove(PROJECT, "master", json!("b")).await.unwrap();
    assert_eq!(removed, vec!["b".to_string()]);

    let a = model.find_one("a").await;
    assert_eq!(a["source"], "undefined");
    assert_eq!(a["target"], "c");
    assert!(a.get("sourceNamespace").is_none());
}

#[tokio::test]
async fn test_search_hides_archived_by_default() {
    let model = TestModel::new().await;
    model
        .create(
            "master",
            json!([{"id": "w1", "name": "Wheel left"}, {"id": "w2", "name": "Wheel right"}]),
        )
        .await
        .unwrap();
    model.update(json!({"id": "w2", "archived": true})).await.unwrap();

    let visible = model.search("wheel", false).await;
    assert_eq!(visible.len(), 1);
    assert!(visible.iter().all(|e| e["archived"] == false));

    let all = model.search("wheel", true).await;
    assert_eq!(all.len(), 2);
    assert!(all.iter().any(|e| e["archived"] == true));
}

#[tokio::test]
async fn test_subtree_converts_to_single_rooted_tree() {
    let model = TestModel::new().await;
    model
        .create(
            "master",
            json!([
                {"id": "e1"},
                {"id": "e2", "parent": "e1"},
                {"id": "e3", "parent": "e2"},
                {"id": "other"}
            ]),
        )
        .await
        .unwrap();

    let subtree = model
        .find(&["e1"], FindOptions { subtree: true, ..Default::default() })
        .await;
    let ids: Vec<&str> = subtree.iter().filter_map(|e| e["id"].as_str()).collect();
    assert_eq!(ids, vec!["e1", "e2", "e3"]);

    let tree = to_jmi3(subtree, "id", "parent").unwrap();
    tree.assert_rooted_at("e1").unwrap();
    assert_eq!(tree.roots["e1"]["contains"]["e2"]["contains"]["e3"]["id"], "e3");
}

#[tokio::test]
async fn test_invalid_element_aborts_whole_batch() {
    let model = TestModel::new().await;
    let before = model.count().await;

    let err = model
        .create(
            "master",
            json!([
                {"id": "ok1"},
                {"id": "ok2"},
                {"id": "bad one"},
                {"id": "ok3"}
            ]),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().starts_with("Element [bad one]"));
    assert_eq!(model.count().await, before);

    let err = model
        .create("master", json!([{"id": "ok1"}, {"id": "ok2", "parent": "missing"}]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(model.count().await, before);
}

#[tokio::test]
async fn test_tag_branch_rejects_creation() {
    let model = TestModel::new().await;
    model.tag("v1").await;

    let err = model.create("v1", json!({"id": "e1"})).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    let msg = err.to_string();
    assert!(msg.contains("acme:rover:v1"));
    assert!(msg.contains("creating"));

    // Reads are still allowed on a tag
    let options = FindOptions::default();
    let found = model
        .controller
        .find(&model.ctx, ORG, PROJECT, "v1", ElementSelector::All, &options)
        .await
        .unwrap();
    assert_eq!(found.len(), 4);
}

#[tokio::test]
async fn test_projection_and_lean_output() {
    let model = TestModel::new().await;
    model
        .create("master", json!({"id": "e1", "name": "Engine", "type": "Block"}))
        .await
        .unwrap();

    let projected = model
        .find(&["e1"], serde_json::from_value(json!({"fields": ["name"]})).unwrap())
        .await;
    assert_eq!(projected[0], json!({"id": "e1", "name": "Engine"}));

    let lean = model
        .find(&["e1"], FindOptions { lean: true, ..Default::default() })
        .await;
    assert_eq!(lean[0]["id"], "acme:rover:master:e1");
    assert_eq!(lean[0]["parent"], "acme:rover:master:model");
}

#[tokio::test]
async fn test_pagination_and_sort() {
    let model = TestModel::new().await;
    model
        .create(
            "master",
            json!([
                {"id": "a", "name": "Alpha"},
                {"id": "b", "name": "Charlie"},
                {"id": "c", "name": "Bravo"}
            ]),
        )
        .await
        .unwrap();

    let options: FindOptions =
        serde_json::from_value(json!({"sort": "-name", "limit": 2})).unwrap();
    let page = model.find(&["a", "b", "c"], options).await;
    let names: Vec<&str> = page.iter().filter_map(|e| e["name"].as_str()).collect();
    assert_eq!(names, vec!["Charlie", "Bravo"]);
}

#[tokio::test]
async fn test_path_and_body_ids_must_agree() {
    let model = TestModel::new().await;
    let options = FindOptions::default();
    let err = model
        .controller
        .create_one(&model.ctx, ORG, PROJECT, "master", "e1", json!({"id": "e2"}), &options)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadRequest);

    let created = model
        .controller
        .create_one(&model.ctx, ORG, PROJECT, "master", "e1", json!({"name": "x"}), &options)
        .await
        .unwrap();
    assert_eq!(created.element.local_id(), "e1");
}

#[tokio::test]
async fn test_tag_branch_rejects_update_and_removal() {
    let model = TestModel::new().await;
    model
        .create("master", json!({"id": "e1", "name": "Engine"}))
        .await
        .unwrap();
    model.tag("v1").await;

    let options = FindOptions::default();
    let err = model
        .controller
        .update(&model.ctx, ORG, PROJECT, "v1", json!({"id": "e1", "name": "Motor"}), &options)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    assert!(err.to_string().contains("updating"));

    let err = model.remove(PROJECT, "v1", json!(["e1"])).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    assert!(err.to_string().contains("deleting"));

    let on_tag = model.find_on("v1", &["e1"], FindOptions::default()).await;
    assert_eq!(on_tag.len(), 1);
    assert_eq!(on_tag[0]["name"], "Engine");
}

#[tokio::test]
async fn test_invalid_patch_aborts_whole_update_batch() {
    let model = TestModel::new().await;
    model
        .create("master", json!([{"id": "a", "name": "Alpha"}, {"id": "b", "name": "Bravo"}]))
        .await
        .unwrap();

    let err = model
        .update(json!([
            {"id": "a", "name": "Alpha 2"},
            {"id": "b", "parent": "missing"}
        ]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(err.to_string().starts_with("Element [b]"));

    assert_eq!(model.find_one("a").await["name"], "Alpha");
    assert_eq!(model.find_one("b").await["parent"], "model");
}

#[tokio::test]
async fn test_removal_repairs_references_from_other_projects_but_not_tags() {
    let model = TestModel::new().await;
    let store = model.controller.store().clone();
    BranchOperations::create_project(
        store.as_ref(),
        &model.ctx,
        Project::new(ProjectId::new(ORG, "parts"), "Parts", "tester"),
    )
    .await
    .unwrap();
    let options = FindOptions::default();
    model
        .controller
        .create(&model.ctx, ORG, "parts", "master", json!({"id": "iface"}), &options)
        .await
        .unwrap();
    model
        .create(
            "master",
            json!([
                {"id": "a"},
                {
                    "id": "r",
                    "source": "a",
                    "target": "iface",
                    "targetNamespace": {"org": ORG, "project": "parts"}
                }
            ]),
        )
        .await
        .unwrap();
    model.tag("v1").await;
    let tagged = model.find_on("v1", &["r"], FindOptions::default()).await;

    let removed = model.remove("parts", "master", json!("iface")).await.unwrap();
    assert_eq!(removed, vec!["iface".to_string()]);

    let r = model.find_one("r").await;
    assert_eq!(r["source"], "a");
    assert_eq!(r["target"], "undefined");
    assert!(r.get("targetNamespace").is_none());

    let after = model.find_on("v1", &["r"], FindOptions::default()).await;
    assert_eq!(after, tagged);
    assert_eq!(after[0]["target"], "iface");
    assert_eq!(after[0]["targetNamespace"]["project"], "parts");
}
