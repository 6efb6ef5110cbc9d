//! Gemini oracle against a mock `generateContent` endpoint.

use std::time::Duration;

use serde_json::{json, Value};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use clooney::diff::diff;
use clooney::error::OracleError;
use clooney::normalize::EndpointKey;
use clooney::model::{EndpointRecord, ResponseSample, SchemaModel};
use clooney::oracle::{GeminiConfig, GeminiOracle, Oracle, OracleRequest, OracleTask};
use clooney::refine::{PatchAction, PatchContext, Refiner};
use clooney::schema::InferenceOptions;

// ─────────────────────── helpers ───────────────────────

const GENERATE_PATH: &str = "/v1beta/models/gemini-test:generateContent";

fn oracle(server: &MockServer) -> GeminiOracle {
    GeminiOracle::new(GeminiConfig {
        api_key: "test-key".into(),
        model: "gemini-test".into(),
        base_url: server.uri(),
        temperature: 0.1,
        timeout: Duration::from_secs(5),
    })
    .unwrap()
}

fn candidate(text: &str) -> Value {
    json!({"candidates": [{"content": {"parts": [{"text": text}]}}]})
}

fn request() -> OracleRequest {
    OracleRequest {
        task: OracleTask::EndpointInference,
        prompt: "Describe this endpoint.".into(),
        context: json!({"endpoint": "GET /api/tasks"}),
    }
}

// ─────────────────────── tests ───────────────────────

#[tokio::test]
async fn test_fenced_reply_is_parsed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(GENERATE_PATH))
        .and(query_param("key", "test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(candidate(
            "```json\n{\"operation\": \"list_tasks\", \"description\": \"List tasks.\"}\n```",
        )))
        .expect(1)
        .mount(&server)
        .await;

    let answer = oracle(&server).infer(&request()).await.unwrap();
    assert_eq!(answer["operation"], "list_tasks");
    assert_eq!(answer["description"], "List tasks.");
}

#[tokio::test]
async fn test_http_error_is_transport_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(GENERATE_PATH))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let err = oracle(&server).infer(&request()).await.unwrap_err();
    assert!(matches!(err, OracleError::Transport(_)));
}

#[tokio::test]
async fn test_reply_without_candidates_is_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(GENERATE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"candidates": []})))
        .mount(&server)
        .await;

    let err = oracle(&server).infer(&request()).await.unwrap_err();
    assert!(matches!(err, OracleError::Malformed(_)));
}

#[tokio::test]
async fn test_prose_reply_is_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(GENERATE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(candidate("not json at all")))
        .mount(&server)
        .await;

    let err = oracle(&server).infer(&request()).await.unwrap_err();
    assert!(matches!(err, OracleError::Malformed(_)));
}

#[tokio::test]
async fn test_refiner_uses_gemini_patches() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(GENERATE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(candidate(
            r#"{"patches": [{"target": "GET /somewhere/else", "action": "set_default", "field": "completed", "value": false, "reason": "captured default"}]}"#,
        )))
        .mount(&server)
        .await;

    let key: EndpointKey = "GET /api/tasks/{id}".parse().unwrap();
    let mut records = std::collections::BTreeMap::new();
    records.insert(
        key.clone(),
        EndpointRecord {
            responses: vec![ResponseSample {
                status: 200,
                body: json!({"name": "a", "completed": false}),
            }],
            ..Default::default()
        },
    );
    let model = SchemaModel::from_records(records, &InferenceOptions::default());

    let report = diff(&json!({"completed": false}), &json!({"completed": true}));
    let gemini = oracle(&server);
    let patches = Refiner::new(&gemini)
        .derive_patches(&report, &PatchContext { endpoint: key.clone() }, &model)
        .await;

    assert_eq!(patches.len(), 1);
    assert_eq!(patches[0].action, PatchAction::SetDefault);
    assert_eq!(patches[0].target, key.to_string());
    assert_eq!(patches[0].value, Some(json!(false)));
}
