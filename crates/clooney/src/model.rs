//! The schema model: endpoint records, inferred schemas, and relationships.
//!
//! Built once from a capture, refined in memory by the convergence loop, and
//! persisted as JSON between runs.

use crate::capture::{is_empty_body, CapturedMessage};
use crate::entity;
use crate::error::Result;
use crate::normalize::{endpoint_key, Classifier, EndpointKey};
use crate::relationships;
use crate::schema::{infer_with, merge_all, InferenceOptions, InferredSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, info};

/// One captured response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseSample {
    pub status: u16,
    pub body: Value,
}

/// Everything observed for one endpoint key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointRecord {
    pub methods: BTreeSet<String>,
    #[serde(default)]
    pub requests: Vec<Value>,
    #[serde(default)]
    pub responses: Vec<ResponseSample>,
    #[serde(default)]
    pub query_params: BTreeSet<String>,
    #[serde(default)]
    pub path_params: BTreeSet<String>,
    /// First concrete path seen for this key, used when probing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example_path: Option<String>,
    /// Operation name such as `create_task` or `list_tasks`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl EndpointRecord {
    /// Bodies of 2xx responses in capture order.
    pub fn success_bodies(&self) -> impl Iterator<Item = &Value> {
        self.responses
            .iter()
            .filter(|r| (200..300).contains(&r.status))
            .map(|r| &r.body)
            .filter(|b| !is_empty_body(b))
    }
}

/// Inferred contract of one endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointSchemas {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<InferredSchema>,
    #[serde(default)]
    pub responses: BTreeMap<u16, InferredSchema>,
    #[serde(default)]
    pub path_params: BTreeSet<String>,
    #[serde(default)]
    pub query_params: BTreeSet<String>,
}

impl EndpointSchemas {
    /// Schema of the lowest 2xx status, the canonical success shape.
    pub fn success(&self) -> Option<&InferredSchema> {
        self.responses.range(200u16..300).next().map(|(_, s)| s)
    }

    /// Every 2xx response schema, lowest status first.
    pub fn successes(&self) -> impl Iterator<Item = &InferredSchema> {
        self.responses.range(200u16..300).map(|(_, s)| s)
    }

    pub fn success_mut(&mut self) -> impl Iterator<Item = &mut InferredSchema> {
        self.responses.range_mut(200u16..300).map(|(_, s)| s)
    }
}

/// Complete inferred model of the captured API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaModel {
    #[serde(default)]
    pub endpoints: BTreeMap<EndpointKey, EndpointRecord>,
    #[serde(default)]
    pub schemas: BTreeMap<EndpointKey, EndpointSchemas>,
    #[serde(default)]
    pub relationships: BTreeMap<String, BTreeSet<String>>,
}

/// Group classified API messages into per-endpoint records.
pub fn ingest(
    messages: &[CapturedMessage],
    classifier: &Classifier,
) -> BTreeMap<EndpointKey, EndpointRecord> {
    let mut records: BTreeMap<EndpointKey, EndpointRecord> = BTreeMap::new();
    let mut skipped = 0usize;

    for message in messages {
        if !classifier.classify(message) {
            skipped += 1;
            continue;
        }
        let Some((key, query_params)) = endpoint_key(&message.method, &message.url) else {
            skipped += 1;
            continue;
        };

        let record = records.entry(key.clone()).or_default();
        record.methods.insert(key.method.clone());
        record.path_params.extend(key.path_params());
        record.query_params.extend(query_params);
        if record.example_path.is_none() {
            record.example_path = concrete_path(&message.url);
        }
        if let Some(body) = &message.request_body {
            record.requests.push(body.clone());
        }
        if let Some(body) = &message.response_body {
            record.responses.push(ResponseSample {
                status: message.status.unwrap_or(200),
                body: body.clone(),
            });
        }
    }

    info!(
        endpoints = records.len(),
        skipped, "ingested {} captured messages",
        messages.len()
    );
    records
}

fn concrete_path(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if let Ok(url) = url::Url::parse(raw) {
        if url.has_host() {
            return Some(url.path().to_string());
        }
    }
    let end = raw.find(['?', '#']).unwrap_or(raw.len());
    Some(raw[..end].to_string()).filter(|p| p.starts_with('/'))
}

impl SchemaModel {
    /// Infer schemas and relationships for a set of endpoint records.
    pub fn from_records(
        mut endpoints: BTreeMap<EndpointKey, EndpointRecord>,
        options: &InferenceOptions,
    ) -> Self {
        for (key, record) in endpoints.iter_mut() {
            if record.operation.is_none() {
                record.operation = entity::operation_name(key);
            }
        }
        let schemas = endpoints
            .iter()
            .map(|(key, record)| (key.clone(), infer_endpoint(record, options)))
            .collect();
        let mut model = SchemaModel {
            endpoints,
            schemas,
            relationships: BTreeMap::new(),
        };
        model.relationships = relationships::detect(&model);
        model
    }

    /// Classify, group, and infer a capture in one step.
    pub fn from_capture(
        messages: &[CapturedMessage],
        classifier: &Classifier,
        options: &InferenceOptions,
    ) -> Self {
        Self::from_records(ingest(messages, classifier), options)
    }

    /// Canonical success schema for an endpoint.
    pub fn success_schema(&self, key: &EndpointKey) -> Option<&InferredSchema> {
        self.schemas.get(key).and_then(EndpointSchemas::success)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        debug!(path = %path.display(), "schema model saved");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Fold every non-empty sample of a record into its endpoint schemas.
pub fn infer_endpoint(record: &EndpointRecord, options: &InferenceOptions) -> EndpointSchemas {
    let requests: Vec<InferredSchema> = record
        .requests
        .iter()
        .filter(|b| !is_empty_body(b))
        .map(|b| infer_with(b, options))
        .collect();

    let mut by_status: BTreeMap<u16, Vec<InferredSchema>> = BTreeMap::new();
    for sample in record.responses.iter().filter(|r| !is_empty_body(&r.body)) {
        by_status
            .entry(sample.status)
            .or_default()
            .push(infer_with(&sample.body, options));
    }

    EndpointSchemas {
        request: merge_all(&requests),
        responses: by_status
            .into_iter()
            .filter_map(|(status, schemas)| merge_all(&schemas).map(|s| (status, s)))
            .collect(),
        path_params: record.path_params.clone(),
        query_params: record.query_params.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::ClassifierConfig;
    use serde_json::json;

    fn msg(
        method: &str,
        url: &str,
        req: Option<Value>,
        status: u16,
        resp: Value,
    ) -> CapturedMessage {
        CapturedMessage {
            method: method.into(),
            url: url.into(),
            request_body: req,
            status: Some(status),
            response_body: Some(resp),
            ..Default::default()
        }
    }

    fn classifier() -> Classifier {
        Classifier::new(&ClassifierConfig::default()).unwrap()
    }

    #[test]
    fn test_ingest_groups_by_key() {
        let messages = vec![
            msg("GET", "https://x.io/api/v1/tasks/1?opt=a", None, 200, json!({"name": "a"})),
            msg("GET", "https://x.io/api/v1/tasks/2?limit=3", None, 200, json!({"name": "b"})),
            msg("GET", "https://cdn.x.io/app.js", None, 200, json!({})),
        ];
        let records = ingest(&messages, &classifier());
        assert_eq!(records.len(), 1);
        let key: EndpointKey = "GET /api/v1/tasks/{id}".parse().unwrap();
        let record = &records[&key];
        assert_eq!(record.responses.len(), 2);
        assert_eq!(record.example_path.as_deref(), Some("/api/v1/tasks/1"));
        assert_eq!(record.path_params, BTreeSet::from(["id".to_string()]));
        assert_eq!(
            record.query_params,
            BTreeSet::from(["limit".to_string(), "opt".to_string()])
        );
    }

    #[test]
    fn test_missing_status_defaults_to_ok() {
        let mut m = msg("GET", "/api/things", None, 0, json!({"a": 1}));
        m.status = None;
        let records = ingest(&[m], &classifier());
        let record = records.values().next().unwrap();
        assert_eq!(record.responses[0].status, 200);
    }

    #[test]
    fn test_infer_endpoint_by_status_skips_empty() {
        let record = EndpointRecord {
            requests: vec![json!({"name": "a"}), json!({})],
            responses: vec![
                ResponseSample {
                    status: 201,
                    body: json!({"name": "a", "done": false}),
                },
                ResponseSample {
                    status: 400,
                    body: json!({"error": "bad"}),
                },
                ResponseSample {
                    status: 201,
                    body: json!({}),
                },
            ],
            ..Default::default()
        };
        let schemas = infer_endpoint(&record, &InferenceOptions::default());
        assert_eq!(schemas.responses.len(), 2);
        let req = schemas.request.as_ref().unwrap();
        assert!(req.as_object().unwrap().required.contains("name"));
        let ok = schemas.success().unwrap().as_object().unwrap();
        assert!(ok.required.contains("done"));
    }

    #[test]
    fn test_save_load_round_trip() {
        let messages = vec![
            msg(
                "POST",
                "/api/1.0/tasks",
                Some(json!({"name": "x", "project_id": "p1"})),
                201,
                json!({"id": "t1", "name": "x", "project_id": "p1"}),
            ),
            msg("GET", "/api/1.0/projects/7", None, 200, json!({"id": "p1", "title": "P"})),
        ];
        let model =
            SchemaModel::from_capture(&messages, &classifier(), &InferenceOptions::default());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/model.json");
        model.save(&path).unwrap();
        let loaded = SchemaModel::load(&path).unwrap();
        assert_eq!(loaded, model);

        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(raw["endpoints"]["POST /api/1.0/tasks"].is_object());
        assert!(raw["schemas"]["GET /api/1.0/projects/{id}"]["responses"]["200"].is_object());
        assert_eq!(raw["relationships"]["Task"], json!(["Project"]));
    }
}
