//! OpenAPI 3.0 document generator.

use super::{ArtifactGenerator, GeneratedArtifact};
use crate::entity::derive_entities;
use crate::error::Result;
use crate::model::SchemaModel;
use crate::schema::InferredSchema;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// Renders `openapi.json`.
#[derive(Debug, Clone)]
pub struct OpenApiGenerator {
    pub title: String,
    pub version: String,
}

impl Default for OpenApiGenerator {
    fn default() -> Self {
        Self {
            title: "Cloned API".to_string(),
            version: "1.0.0".to_string(),
        }
    }
}

impl ArtifactGenerator for OpenApiGenerator {
    fn name(&self) -> &str {
        "openapi"
    }

    fn generate(&self, model: &SchemaModel) -> Result<GeneratedArtifact> {
        let doc = self.document(model);
        Ok(GeneratedArtifact {
            filename: "openapi.json".to_string(),
            content: serde_json::to_string_pretty(&doc)?,
        })
    }
}

impl OpenApiGenerator {
    /// Build the document as a JSON value.
    pub fn document(&self, model: &SchemaModel) -> Value {
        let mut paths: BTreeMap<String, Map<String, Value>> = BTreeMap::new();

        for (key, record) in &model.endpoints {
            let schemas = model.schemas.get(key);
            let mut operation = Map::new();

            operation.insert(
                "operationId".into(),
                json!(record.operation.clone().unwrap_or_else(|| fallback_operation_id(
                    &key.method,
                    &key.path
                ))),
            );
            operation.insert(
                "summary".into(),
                json!(record
                    .description
                    .clone()
                    .unwrap_or_else(|| key.to_string())),
            );

            let mut parameters: Vec<Value> = record
                .path_params
                .iter()
                .map(|name| {
                    json!({"name": name, "in": "path", "required": true, "schema": {"type": "string"}})
                })
                .collect();
            parameters.extend(record.query_params.iter().map(|name| {
                json!({"name": name, "in": "query", "required": false, "schema": {"type": "string"}})
            }));
            if !parameters.is_empty() {
                operation.insert("parameters".into(), Value::Array(parameters));
            }

            if let Some(request) = schemas.and_then(|s| s.request.as_ref()) {
                operation.insert(
                    "requestBody".into(),
                    json!({
                        "required": true,
                        "content": {"application/json": {"schema": to_openapi(request)}}
                    }),
                );
            }

            let mut responses = Map::new();
            for (status, schema) in schemas.map(|s| &s.responses).into_iter().flatten() {
                responses.insert(
                    status.to_string(),
                    json!({
                        "description": status_description(*status),
                        "content": {"application/json": {"schema": to_openapi(schema)}}
                    }),
                );
            }
            if responses.is_empty() {
                responses.insert("200".into(), json!({"description": "Successful response"}));
            }
            operation.insert("responses".into(), Value::Object(responses));

            paths
                .entry(key.path.clone())
                .or_default()
                .insert(key.method.to_ascii_lowercase(), Value::Object(operation));
        }

        let components: Map<String, Value> = derive_entities(model)
            .into_values()
            .map(|entity| {
                let schema = to_openapi(&InferredSchema::Object(entity.fields));
                (entity.name, schema)
            })
            .collect();

        json!({
            "openapi": "3.0.3",
            "info": {
                "title": self.title,
                "version": self.version,
                "description": "Generated from captured network traffic",
            },
            "paths": paths,
            "components": {"schemas": components},
        })
    }
}

fn fallback_operation_id(method: &str, path: &str) -> String {
    let cleaned: String = path
        .chars()
        .filter(|c| *c != '{' && *c != '}')
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{}_{}", method.to_ascii_lowercase(), cleaned.trim_matches('_'))
}

fn status_description(status: u16) -> &'static str {
    match status {
        200..=299 => "Successful response",
        400..=499 => "Client error",
        500..=599 => "Server error",
        _ => "Response",
    }
}

/// OpenAPI schema object for an inferred schema. Unions become `oneOf`;
/// null has no OpenAPI 3.0 type and is rendered as `nullable`.
pub fn to_openapi(schema: &InferredSchema) -> Value {
    match schema {
        InferredSchema::Null => json!({"nullable": true}),
        InferredSchema::Boolean => json!({"type": "boolean"}),
        InferredSchema::Integer => json!({"type": "integer"}),
        InferredSchema::Number => json!({"type": "number"}),
        InferredSchema::String { format } => match format {
            Some(f) => json!({"type": "string", "format": f.as_str()}),
            None => json!({"type": "string"}),
        },
        InferredSchema::Array { items } => json!({"type": "array", "items": to_openapi(items)}),
        InferredSchema::Object(obj) => {
            let properties: Map<String, Value> = obj
                .properties
                .iter()
                .map(|(name, prop)| {
                    let mut rendered = to_openapi(prop);
                    if let (Some(default), Value::Object(map)) = (obj.defaults.get(name), &mut rendered) {
                        map.insert("default".into(), default.clone());
                    }
                    (name.clone(), rendered)
                })
                .collect();
            let mut out = json!({"type": "object", "properties": properties});
            if !obj.required.is_empty() {
                out["required"] = json!(obj.required);
            }
            out
        }
        InferredSchema::Union { any_of } => {
            json!({"oneOf": any_of.iter().map(to_openapi).collect::<Vec<_>>()})
        }
    }
}
