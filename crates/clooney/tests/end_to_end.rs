//! End-to-end pipeline tests: capture file to schema model to artifacts.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use assert_json_diff::{assert_json_eq, assert_json_include};
use serde_json::{json, Value};

use clooney::codegen::{default_generators, generate_all};
use clooney::enrich::enrich_model;
use clooney::model::SchemaModel;
use clooney::normalize::{Classifier, ClassifierConfig, EndpointKey};
use clooney::oracle::DisabledOracle;
use clooney::schema::InferenceOptions;

// ─────────────────────── helpers ───────────────────────

fn task_capture() -> Value {
    json!([
        {
            "request": {
                "method": "POST",
                "url": "https://app.example.com/api/1.0/tasks",
                "post_data": "{\"name\":\"Buy milk\"}",
                "headers": {"Content-Type": "application/json"}
            },
            "response": {
                "status": 201,
                "body": "{\"id\":\"t1\",\"name\":\"Buy milk\",\"completed\":false}"
            },
            "timestamp": "2024-05-01T10:00:00Z"
        },
        {
            "request": {"method": "GET", "url": "https://app.example.com/api/1.0/tasks/1"},
            "response": {
                "status": 200,
                "body": {"id": "t1", "name": "Buy milk", "completed": false}
            }
        },
        {
            "request": {"method": "GET", "url": "https://www.google-analytics.com/collect?v=1"},
            "response": {"status": 200, "body": "{}"}
        }
    ])
}

fn write_capture(dir: &Path) -> PathBuf {
    let path = dir.join("capture.json");
    std::fs::write(&path, task_capture().to_string()).unwrap();
    path
}

fn build(dir: &Path, options: &InferenceOptions) -> SchemaModel {
    let messages = clooney::capture::load_capture(&write_capture(dir)).unwrap();
    let classifier = Classifier::new(&ClassifierConfig::default()).unwrap();
    SchemaModel::from_capture(&messages, &classifier, options)
}

fn get_key() -> EndpointKey {
    "GET /api/1.0/tasks/{id}".parse().unwrap()
}

fn required(model: &SchemaModel, key: &EndpointKey) -> BTreeSet<String> {
    model
        .success_schema(key)
        .and_then(|s| s.as_object())
        .map(|o| o.required.clone())
        .unwrap()
}

fn names(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

// ─────────────────────── tests ───────────────────────

#[test]
fn test_task_scenario_default_volatile_fields() {
    let dir = tempfile::tempdir().unwrap();
    let model = build(dir.path(), &InferenceOptions::default());

    let keys: Vec<String> = model.endpoints.keys().map(|k| k.to_string()).collect();
    assert_eq!(keys, vec!["GET /api/1.0/tasks/{id}", "POST /api/1.0/tasks"]);

    let record = &model.endpoints[&get_key()];
    assert_eq!(record.example_path.as_deref(), Some("/api/1.0/tasks/1"));
    assert_eq!(record.path_params, names(&["id"]));
    assert_eq!(record.operation.as_deref(), Some("get_task"));

    let schema = serde_json::to_value(model.success_schema(&get_key()).unwrap()).unwrap();
    assert_json_include!(
        actual: schema,
        expected: json!({
            "type": "object",
            "properties": {
                "id": {"type": "string"},
                "name": {"type": "string"},
                "completed": {"type": "boolean"}
            }
        })
    );
    assert_eq!(required(&model, &get_key()), names(&["completed", "name"]));
}

#[test]
fn test_task_scenario_strict_volatile_fields() {
    let dir = tempfile::tempdir().unwrap();
    let model = build(dir.path(), &InferenceOptions::strict());
    assert_eq!(required(&model, &get_key()), names(&["completed", "id", "name"]));

    let post: EndpointKey = "POST /api/1.0/tasks".parse().unwrap();
    let request = serde_json::to_value(model.schemas[&post].request.as_ref().unwrap()).unwrap();
    assert_json_eq!(
        request,
        json!({
            "type": "object",
            "properties": {"name": {"type": "string"}},
            "required": ["name"]
        })
    );
    assert!(model.schemas[&post].responses.contains_key(&201));
}

#[test]
fn test_model_persistence_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let model = build(dir.path(), &InferenceOptions::default());
    let path = dir.path().join("state/schema_model.json");
    model.save(&path).unwrap();

    let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert!(raw["endpoints"]["GET /api/1.0/tasks/{id}"].is_object());
    assert!(raw["schemas"]["POST /api/1.0/tasks"]["responses"]["201"].is_object());
    assert!(raw["relationships"].is_object());

    let loaded = SchemaModel::load(&path).unwrap();
    assert_eq!(loaded, model);
}

#[test]
fn test_disabled_oracle_enrichment_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let mut model = build(dir.path(), &InferenceOptions::default());
    let before = model.clone();
    let summary = tokio_test::block_on(enrich_model(&mut model, &DisabledOracle));
    assert_eq!(summary.failures, 0);
    assert_eq!(model, before);
}

#[test]
fn test_artifacts_written_for_task_model() {
    let dir = tempfile::tempdir().unwrap();
    let model = build(dir.path(), &InferenceOptions::default());
    let out = dir.path().join("generated");
    generate_all(&default_generators(), &model, Some(&out)).unwrap();

    let openapi: Value =
        serde_json::from_str(&std::fs::read_to_string(out.join("openapi.json")).unwrap()).unwrap();
    assert_json_include!(
        actual: openapi,
        expected: json!({
            "openapi": "3.0.3",
            "paths": {
                "/api/1.0/tasks": {"post": {"operationId": "create_task"}},
                "/api/1.0/tasks/{id}": {"get": {"operationId": "get_task"}}
            }
        })
    );

    let sql = std::fs::read_to_string(out.join("schema.sql")).unwrap();
    assert!(sql.contains("CREATE TABLE IF NOT EXISTS tasks ("));
    assert!(sql.contains("completed BOOLEAN NOT NULL"));
}
