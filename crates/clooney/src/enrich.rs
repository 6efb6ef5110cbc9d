//! Oracle-assisted enrichment of a freshly parsed model.
//!
//! Endpoint inference names operations and describes endpoints; schema
//! inference may add response properties the samples never exhibited. Neither
//! touches `required`, and any failure leaves the deterministic result as is.

use crate::model::SchemaModel;
use crate::oracle::{Oracle, OracleRequest, OracleTask};
use crate::schema::InferredSchema;
use serde_json::{json, Value};
use tracing::{info, warn};

/// Samples sent to the oracle per endpoint.
const MAX_SAMPLES: usize = 3;

/// Counts of what enrichment changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnrichmentSummary {
    pub endpoints_described: usize,
    pub properties_added: usize,
    pub failures: usize,
}

/// Run endpoint and schema inference for every endpoint.
pub async fn enrich_model(model: &mut SchemaModel, oracle: &dyn Oracle) -> EnrichmentSummary {
    let mut summary = EnrichmentSummary::default();
    if !oracle.is_enabled() {
        return summary;
    }

    let keys: Vec<_> = model.endpoints.keys().cloned().collect();
    for key in keys {
        let Some(record) = model.endpoints.get(&key) else {
            continue;
        };
        let samples: Vec<&Value> = record.success_bodies().take(MAX_SAMPLES).collect();
        let context = json!({
            "endpoint": key.to_string(),
            "operation": record.operation,
            "query_params": record.query_params,
            "path_params": record.path_params,
            "request_sample": record.requests.first(),
            "response_samples": samples,
        });

        let endpoint_request = OracleRequest {
            task: OracleTask::EndpointInference,
            prompt: "Describe this REST endpoint. Return a JSON object with keys \
                     \"operation\" (snake_case verb_noun, e.g. list_tasks) and \"description\" \
                     (one sentence)."
                .to_string(),
            context: context.clone(),
        };
        match oracle.infer(&endpoint_request).await {
            Ok(answer) => {
                if let Some(record) = model.endpoints.get_mut(&key) {
                    if apply_endpoint_answer(record, &answer) {
                        summary.endpoints_described += 1;
                    }
                }
            }
            Err(e) => {
                warn!(endpoint = %key, "endpoint inference failed: {e}");
                summary.failures += 1;
            }
        }

        if samples_empty(&context) {
            continue;
        }
        let schema_request = OracleRequest {
            task: OracleTask::SchemaInference,
            prompt: "Infer the full response schema of this endpoint, including fields the \
                     samples may omit. Return a JSON schema object with \"type\" and \
                     \"properties\"."
                .to_string(),
            context,
        };
        match oracle.infer(&schema_request).await {
            Ok(answer) => {
                summary.properties_added += apply_schema_answer(model, &key, answer);
            }
            Err(e) => {
                warn!(endpoint = %key, "schema inference failed: {e}");
                summary.failures += 1;
            }
        }
    }

    info!(
        described = summary.endpoints_described,
        added = summary.properties_added,
        failures = summary.failures,
        "oracle enrichment finished"
    );
    summary
}

fn samples_empty(context: &Value) -> bool {
    context["response_samples"]
        .as_array()
        .map_or(true, Vec::is_empty)
}

fn apply_endpoint_answer(record: &mut crate::model::EndpointRecord, answer: &Value) -> bool {
    let operation = answer
        .get("operation")
        .and_then(Value::as_str)
        .filter(|op| is_operation_name(op));
    let description = answer
        .get("description")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|d| !d.is_empty());
    if let Some(op) = operation {
        record.operation = Some(op.to_string());
    }
    if let Some(desc) = description {
        record.description = Some(desc.to_string());
    }
    operation.is_some() || description.is_some()
}

fn is_operation_name(s: &str) -> bool {
    !s.is_empty()
        && s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && s.starts_with(|c: char| c.is_ascii_lowercase())
}

/// Add properties proposed by the oracle that the response schema lacks.
fn apply_schema_answer(
    model: &mut SchemaModel,
    key: &crate::normalize::EndpointKey,
    answer: Value,
) -> usize {
    let proposed: InferredSchema = match serde_json::from_value(answer) {
        Ok(schema) => schema,
        Err(e) => {
            warn!(endpoint = %key, "schema inference answer unusable: {e}");
            return 0;
        }
    };
    let Some(proposed) = proposed.as_object() else {
        return 0;
    };
    let Some(schemas) = model.schemas.get_mut(key) else {
        return 0;
    };
    let mut added = 0;
    for schema in schemas.success_mut() {
        let Some(obj) = schema.as_object_mut() else {
            continue;
        };
        for (name, prop) in &proposed.properties {
            if !obj.properties.contains_key(name) {
                obj.properties.insert(name.clone(), prop.clone());
                added += 1;
            }
        }
    }
    added
}
