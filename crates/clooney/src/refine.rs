//! Turning response differences into schema patches, and applying them.
//!
//! The mapping from a [`DiffReport`] to [`PatchInstruction`]s is fixed:
//!
//! | diff class      | action               | value               |
//! |-----------------|----------------------|---------------------|
//! | `added`         | `add_field`          | actual value        |
//! | `removed`       | `remove_field`       | none                |
//! | `value_changed` | `update_field_value` | expected value      |
//! | `type_changed`  | `update_field_type`  | expected type name  |
//!
//! `added` means present only in the live response, so the field is added to
//! the modeled schema; `removed` means present only in the capture, and the
//! modeled field is dropped. An oracle may propose patches first; its output
//! has the same shape and falls back to this table whenever it is unusable.

use crate::diff::{json_type_name, DiffEntry, DiffReport};
use crate::model::SchemaModel;
use crate::normalize::EndpointKey;
use crate::oracle::{Oracle, OracleRequest, OracleTask};
use crate::relationships;
use crate::schema::{infer, merge, InferredSchema, ObjectSchema};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Patch operations understood by [`apply_patches`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchAction {
    AddField,
    RemoveField,
    UpdateFieldType,
    UpdateFieldValue,
    SetDefault,
    AddRequiredField,
}

/// One change to the modeled schema of an endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchInstruction {
    /// Endpoint key, `"METHOD /path"`.
    pub target: String,
    pub action: PatchAction,
    /// Field path inside the response body.
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default)]
    pub reason: String,
}

/// What a diff was computed for.
#[derive(Debug, Clone)]
pub struct PatchContext {
    pub endpoint: EndpointKey,
}

/// Deterministic diff to patch mapping, one instruction per entry.
pub fn to_patches(report: &DiffReport, ctx: &PatchContext) -> Vec<PatchInstruction> {
    let target = ctx.endpoint.to_string();
    let make = |entry: &DiffEntry, action: PatchAction, value: Option<Value>, reason: String| {
        PatchInstruction {
            target: target.clone(),
            action,
            field: entry.path.clone(),
            value,
            reason,
        }
    };

    let mut patches = Vec::with_capacity(report.len());
    for e in &report.added {
        patches.push(make(
            e,
            PatchAction::AddField,
            e.actual.clone(),
            format!("'{}' returned by the server but absent from the capture", e.path),
        ));
    }
    for e in &report.removed {
        patches.push(make(
            e,
            PatchAction::RemoveField,
            None,
            format!("'{}' in the capture but not returned by the server", e.path),
        ));
    }
    for e in &report.value_changed {
        patches.push(make(
            e,
            PatchAction::UpdateFieldValue,
            e.expected.clone(),
            format!("'{}' value differs from the capture", e.path),
        ));
    }
    for e in &report.type_changed {
        let expected_type = e.expected.as_ref().map(json_type_name).unwrap_or("null");
        let actual_type = e.actual.as_ref().map(json_type_name).unwrap_or("null");
        patches.push(make(
            e,
            PatchAction::UpdateFieldType,
            Some(Value::String(expected_type.to_string())),
            format!("'{}' is {actual_type} but the capture has {expected_type}", e.path),
        ));
    }
    patches
}

/// Accepts a list of instructions, `{"patches": [...]}`, or one instruction.
/// Elements that do not parse are dropped.
pub fn parse_patch_list(value: Value) -> Vec<PatchInstruction> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("patches") {
            Some(Value::Array(items)) => items,
            Some(_) => Vec::new(),
            None => vec![Value::Object(map)],
        },
        _ => Vec::new(),
    };
    items
        .into_iter()
        .filter_map(|item| serde_json::from_value(item).ok())
        .collect()
}

/// Derives patches, preferring the oracle when it produces something usable.
pub struct Refiner<'a> {
    oracle: &'a dyn Oracle,
}

impl<'a> Refiner<'a> {
    pub fn new(oracle: &'a dyn Oracle) -> Self {
        Self { oracle }
    }

    /// Patches for one endpoint's diff. Oracle failures are logged and
    /// replaced by [`to_patches`]; they never reach the caller.
    pub async fn derive_patches(
        &self,
        report: &DiffReport,
        ctx: &PatchContext,
        model: &SchemaModel,
    ) -> Vec<PatchInstruction> {
        if report.is_empty() {
            return Vec::new();
        }
        if self.oracle.is_enabled() {
            match self.ask_oracle(report, ctx, model).await {
                Some(patches) => return patches,
                None => debug!(endpoint = %ctx.endpoint, "falling back to deterministic patches"),
            }
        }
        to_patches(report, ctx)
    }

    async fn ask_oracle(
        &self,
        report: &DiffReport,
        ctx: &PatchContext,
        model: &SchemaModel,
    ) -> Option<Vec<PatchInstruction>> {
        let request = OracleRequest {
            task: OracleTask::PatchInference,
            prompt: "Given the differences between the captured (expected) and generated \
                     (actual) responses of an endpoint, propose schema patches. Return a JSON \
                     array of objects with keys target, action, field, value, reason. action is \
                     one of add_field, remove_field, update_field_type, update_field_value, \
                     set_default, add_required_field."
                .to_string(),
            context: json!({
                "endpoint": ctx.endpoint.to_string(),
                "diff": report,
                "schema": model.success_schema(&ctx.endpoint),
            }),
        };

        let raw = match self.oracle.infer(&request).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(
                    oracle = self.oracle.name(),
                    endpoint = %ctx.endpoint,
                    "patch inference failed: {e}"
                );
                return None;
            }
        };

        let target = ctx.endpoint.to_string();
        let patches: Vec<PatchInstruction> = parse_patch_list(raw)
            .into_iter()
            .map(|mut patch| {
                let known = patch
                    .target
                    .parse::<EndpointKey>()
                    .is_ok_and(|k| model.schemas.contains_key(&k));
                if !known {
                    patch.target = target.clone();
                }
                patch
            })
            .collect();

        if patches.is_empty() {
            warn!(
                oracle = self.oracle.name(),
                endpoint = %ctx.endpoint,
                "oracle returned no usable patches"
            );
            return None;
        }
        Some(patches)
    }
}

/// Result of applying a batch of patches.
#[derive(Debug, Clone)]
pub struct PatchOutcome {
    pub model: SchemaModel,
    pub applied: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index,
}

/// `owner.tags[0].name` becomes `[Key(owner), Key(tags), Index, Key(name)]`.
fn parse_field_path(path: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    for part in path.split('.') {
        let (name, rest) = match part.find('[') {
            Some(pos) => part.split_at(pos),
            None => (part, ""),
        };
        if !name.is_empty() {
            segments.push(Segment::Key(name.to_string()));
        }
        for _ in rest.matches('[') {
            segments.push(Segment::Index);
        }
    }
    segments
}

/// Apply patches to a copy of the model; the input is left untouched.
///
/// Each patch targets the 2xx response schemas of one endpoint. Patches whose
/// target or field cannot be resolved are counted as skipped. Relationships
/// are re-detected whenever anything was applied.
pub fn apply_patches(model: &SchemaModel, patches: &[PatchInstruction]) -> PatchOutcome {
    let mut next = model.clone();
    let mut applied = 0;
    let mut skipped = 0;

    for patch in patches {
        let Ok(key) = patch.target.parse::<EndpointKey>() else {
            skipped += 1;
            continue;
        };
        let Some(schemas) = next.schemas.get_mut(&key) else {
            skipped += 1;
            continue;
        };
        let segments = parse_field_path(&patch.field);
        let mut hit = false;
        for schema in schemas.success_mut() {
            hit |= apply_one(schema, &segments, patch);
        }
        if hit {
            applied += 1;
        } else {
            debug!(
                endpoint = %patch.target,
                field = %patch.field,
                action = ?patch.action,
                "patch skipped"
            );
            skipped += 1;
        }
    }

    if applied > 0 {
        next.relationships = relationships::detect(&next);
        info!(applied, skipped, "patches applied to schema model");
    }
    PatchOutcome {
        model: next,
        applied,
        skipped,
    }
}

fn apply_one(schema: &mut InferredSchema, segments: &[Segment], patch: &PatchInstruction) -> bool {
    let Some((last, parents)) = segments.split_last() else {
        return false;
    };
    let create = matches!(patch.action, PatchAction::AddField | PatchAction::AddRequiredField);
    let Some(parent) = descend(schema, parents, create) else {
        return false;
    };

    match last {
        Segment::Index => apply_to_items(parent, patch),
        Segment::Key(name) => match object_of(parent, create) {
            Some(obj) => apply_to_field(obj, name, patch),
            None => false,
        },
    }
}

/// Walk to the schema addressed by `segments`, optionally creating objects.
fn descend<'s>(
    schema: &'s mut InferredSchema,
    segments: &[Segment],
    create: bool,
) -> Option<&'s mut InferredSchema> {
    let Some((first, rest)) = segments.split_first() else {
        return Some(schema);
    };
    let child = match first {
        Segment::Index => match array_of(schema) {
            Some(items) => items,
            None => return None,
        },
        Segment::Key(name) => {
            let obj = object_of(schema, create)?;
            if create && !obj.properties.contains_key(name) {
                obj.properties.insert(name.clone(), InferredSchema::placeholder());
            }
            obj.properties.get_mut(name)?
        }
    };
    descend(child, rest, create)
}

fn object_of(schema: &mut InferredSchema, create: bool) -> Option<&mut ObjectSchema> {
    if create && matches!(schema, InferredSchema::Null) {
        *schema = InferredSchema::placeholder();
    }
    match schema {
        InferredSchema::Object(obj) => Some(obj),
        InferredSchema::Union { any_of } => any_of.iter_mut().find_map(|m| m.as_object_mut()),
        _ => None,
    }
}

fn array_of(schema: &mut InferredSchema) -> Option<&mut InferredSchema> {
    match schema {
        InferredSchema::Array { items } => Some(items.as_mut()),
        InferredSchema::Union { any_of } => any_of.iter_mut().find_map(|m| match m {
            InferredSchema::Array { items } => Some(items.as_mut()),
            _ => None,
        }),
        _ => None,
    }
}

fn value_schema(patch: &PatchInstruction) -> InferredSchema {
    patch
        .value
        .as_ref()
        .map(infer)
        .unwrap_or_else(InferredSchema::string)
}

/// Whole-element patches on an array (`tags[2]`) adjust the item schema.
fn apply_to_items(parent: &mut InferredSchema, patch: &PatchInstruction) -> bool {
    let Some(items) = array_of(parent) else {
        return false;
    };
    match patch.action {
        PatchAction::AddField => {
            let incoming = value_schema(patch);
            *items = if items.is_placeholder() {
                incoming
            } else {
                merge(items, &incoming)
            };
            true
        }
        PatchAction::UpdateFieldType => match type_from_patch(patch) {
            Some(schema) => {
                *items = schema;
                true
            }
            None => false,
        },
        _ => false,
    }
}

fn type_from_patch(patch: &PatchInstruction) -> Option<InferredSchema> {
    match &patch.value {
        Some(Value::String(name)) => InferredSchema::from_type_name(name),
        Some(other) => serde_json::from_value(other.clone()).ok(),
        None => None,
    }
}

fn apply_to_field(obj: &mut ObjectSchema, name: &str, patch: &PatchInstruction) -> bool {
    match patch.action {
        PatchAction::AddField => {
            let incoming = value_schema(patch);
            let merged = match obj.properties.get(name) {
                Some(existing) => merge(existing, &incoming),
                None => incoming,
            };
            obj.properties.insert(name.to_string(), merged);
            true
        }
        PatchAction::RemoveField => {
            obj.required.remove(name);
            obj.defaults.remove(name);
            obj.properties.remove(name).is_some()
        }
        PatchAction::UpdateFieldType => {
            let Some(schema) = type_from_patch(patch) else {
                return false;
            };
            let keep = obj
                .properties
                .get(name)
                .is_some_and(|existing| existing.type_name() == schema.type_name());
            if !keep {
                obj.properties.insert(name.to_string(), schema);
            }
            true
        }
        PatchAction::UpdateFieldValue | PatchAction::SetDefault => {
            let Some(value) = patch.value.clone().filter(|v| !v.is_null()) else {
                return false;
            };
            let incoming = infer(&value);
            let mismatched = obj
                .properties
                .get(name)
                .map_or(true, |existing| existing.type_name() != incoming.type_name());
            if mismatched {
                obj.properties.insert(name.to_string(), incoming);
            }
            obj.defaults.insert(name.to_string(), value);
            true
        }
        PatchAction::AddRequiredField => {
            if !obj.properties.contains_key(name) {
                obj.properties.insert(name.to_string(), value_schema(patch));
            }
            obj.required.insert(name.to_string());
            true
        }
    }
}

/// Golden expectation per endpoint: the first captured 2xx body.
pub fn expected_responses(model: &SchemaModel) -> BTreeMap<EndpointKey, Value> {
    model
        .endpoints
        .iter()
        .filter_map(|(key, record)| {
            record
                .success_bodies()
                .next()
                .map(|body| (key.clone(), body.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::diff;
    use crate::error::OracleError;
    use crate::model::{EndpointRecord, ResponseSample};
    use crate::oracle::DisabledOracle;
    use crate::schema::InferenceOptions;
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn task_model() -> SchemaModel {
        let key: EndpointKey = "GET /api/tasks/{id}".parse().unwrap();
        let mut records = BTreeMap::new();
        records.insert(
            key,
            EndpointRecord {
                responses: vec![ResponseSample {
                    status: 200,
                    body: json!({"name": "a", "done": false, "owner": {"email": "x@y.io"}, "tags": ["t"]}),
                }],
                ..Default::default()
            },
        );
        SchemaModel::from_records(records, &InferenceOptions::default())
    }

    fn ctx() -> PatchContext {
        PatchContext {
            endpoint: "GET /api/tasks/{id}".parse().unwrap(),
        }
    }

    fn task_schema(model: &SchemaModel) -> &ObjectSchema {
        model
            .success_schema(&ctx().endpoint)
            .and_then(InferredSchema::as_object)
            .unwrap()
    }

    #[test]
    fn test_to_patches_table() {
        let report = diff(
            &json!({"name": "a", "gone": 1, "n": 2, "t": "s"}),
            &json!({"name": "b", "extra": true, "n": 2, "t": 5}),
        );
        let patches = to_patches(&report, &ctx());
        let by_field: BTreeMap<&str, &PatchInstruction> =
            patches.iter().map(|p| (p.field.as_str(), p)).collect();
        assert_eq!(patches.len(), 4);
        assert_eq!(by_field["extra"].action, PatchAction::AddField);
        assert_eq!(by_field["extra"].value, Some(json!(true)));
        assert_eq!(by_field["gone"].action, PatchAction::RemoveField);
        assert_eq!(by_field["name"].action, PatchAction::UpdateFieldValue);
        assert_eq!(by_field["name"].value, Some(json!("a")));
        assert_eq!(by_field["t"].action, PatchAction::UpdateFieldType);
        assert_eq!(by_field["t"].value, Some(json!("string")));
        assert!(patches.iter().all(|p| p.target == "GET /api/tasks/{id}"));
    }

    #[test]
    fn test_patch_action_wire_names() {
        let p = PatchInstruction {
            target: "GET /x".into(),
            action: PatchAction::AddRequiredField,
            field: "f".into(),
            value: None,
            reason: String::new(),
        };
        assert_eq!(serde_json::to_value(&p).unwrap()["action"], "add_required_field");
    }

    #[test]
    fn test_apply_is_pure() {
        let model = task_model();
        let before = model.clone();
        let patches = vec![PatchInstruction {
            target: "GET /api/tasks/{id}".into(),
            action: PatchAction::RemoveField,
            field: "done".into(),
            value: None,
            reason: String::new(),
        }];
        let outcome = apply_patches(&model, &patches);
        assert_eq!(model, before);
        assert_eq!(outcome.applied, 1);
        assert!(!task_schema(&outcome.model).properties.contains_key("done"));
        assert!(!task_schema(&outcome.model).required.contains("done"));
    }

    #[test]
    fn test_apply_each_action() {
        let model = task_model();
        let p = |action, field: &str, value: Option<Value>| PatchInstruction {
            target: "GET /api/tasks/{id}".into(),
            action,
            field: field.into(),
            value,
            reason: String::new(),
        };
        let patches = vec![
            p(PatchAction::AddField, "owner.phone", Some(json!("555"))),
            p(PatchAction::UpdateFieldType, "done", Some(json!("string"))),
            p(PatchAction::UpdateFieldValue, "name", Some(json!("b"))),
            p(PatchAction::SetDefault, "priority", Some(json!(3))),
            p(PatchAction::AddRequiredField, "owner.email", None),
            p(PatchAction::AddField, "tags[1]", Some(json!("u"))),
            p(PatchAction::RemoveField, "missing", None),
            p(PatchAction::AddField, "x", None),
        ];
        let outcome = apply_patches(&model, &patches);
        assert_eq!(outcome.applied, 7);
        assert_eq!(outcome.skipped, 1);

        let schema = task_schema(&outcome.model);
        let owner = schema.properties["owner"].as_object().unwrap();
        assert!(owner.properties.contains_key("phone"));
        assert!(owner.required.contains("email"));
        assert_eq!(schema.properties["done"].type_name(), "string");
        assert_eq!(schema.defaults["name"], json!("b"));
        assert_eq!(schema.defaults["priority"], json!(3));
        assert_eq!(schema.properties["priority"].type_name(), "integer");
        assert!(!schema.required.contains("priority"));
    }

    #[test]
    fn test_apply_keeps_relationships_in_sync() {
        let model = task_model();
        assert!(model.relationships.is_empty());
        let patch = |action, value: Option<Value>| PatchInstruction {
            target: "GET /api/tasks/{id}".into(),
            action,
            field: "project_id".into(),
            value,
            reason: String::new(),
        };

        let added = apply_patches(&model, &[patch(PatchAction::AddField, Some(json!("p1")))]);
        assert_eq!(added.applied, 1);
        assert_eq!(added.model.relationships, relationships::detect(&added.model));
        assert!(added.model.relationships["Task"].contains("Project"));

        let removed = apply_patches(&added.model, &[patch(PatchAction::RemoveField, None)]);
        assert_eq!(removed.applied, 1);
        assert!(removed.model.relationships.is_empty());
    }

    #[test]
    fn test_apply_unknown_target_skipped() {
        let outcome = apply_patches(
            &task_model(),
            &[PatchInstruction {
                target: "GET /nope".into(),
                action: PatchAction::AddField,
                field: "a".into(),
                value: None,
                reason: String::new(),
            }],
        );
        assert_eq!((outcome.applied, outcome.skipped), (0, 1));
    }

    #[test]
    fn test_parse_patch_list_shapes() {
        let one = json!({"target": "GET /x", "action": "add_field", "field": "a", "reason": "r"});
        assert_eq!(parse_patch_list(one.clone()).len(), 1);
        assert_eq!(parse_patch_list(json!([one.clone(), {"bogus": true}])).len(), 1);
        assert_eq!(parse_patch_list(json!({"patches": [one]})).len(), 1);
        assert!(parse_patch_list(json!("text")).is_empty());
    }

    #[test]
    fn test_expected_responses_first_success() {
        let expected = expected_responses(&task_model());
        assert_eq!(expected[&ctx().endpoint]["name"], "a");
    }

    struct ScriptedOracle {
        reply: Mutex<Option<Result<Value, OracleError>>>,
    }

    #[async_trait]
    impl Oracle for ScriptedOracle {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn infer(&self, _request: &OracleRequest) -> Result<Value, OracleError> {
            self.reply
                .lock()
                .unwrap()
                .take()
                .unwrap_or(Err(OracleError::Disabled))
        }
    }

    fn report() -> DiffReport {
        diff(&json!({"name": "a"}), &json!({"name": "a", "extra": 1}))
    }

    #[tokio::test]
    async fn test_disabled_oracle_uses_table() {
        let oracle = DisabledOracle;
        let patches = Refiner::new(&oracle).derive_patches(&report(), &ctx(), &task_model()).await;
        assert_eq!(patches, to_patches(&report(), &ctx()));
    }

    #[tokio::test]
    async fn test_oracle_failure_falls_back() {
        let oracle = ScriptedOracle {
            reply: Mutex::new(Some(Err(OracleError::Transport("boom".into())))),
        };
        let patches = Refiner::new(&oracle).derive_patches(&report(), &ctx(), &task_model()).await;
        assert_eq!(patches, to_patches(&report(), &ctx()));
    }

    #[tokio::test]
    async fn test_oracle_garbage_falls_back() {
        let oracle = ScriptedOracle {
            reply: Mutex::new(Some(Ok(json!({"note": "no idea"})))),
        };
        let patches = Refiner::new(&oracle).derive_patches(&report(), &ctx(), &task_model()).await;
        assert_eq!(patches, to_patches(&report(), &ctx()));
    }

    #[tokio::test]
    async fn test_oracle_patches_retargeted() {
        let oracle = ScriptedOracle {
            reply: Mutex::new(Some(Ok(json!({"patches": [
                {"target": "Task", "action": "set_default", "field": "extra", "value": 1, "reason": "seen live"}
            ]})))),
        };
        let patches = Refiner::new(&oracle).derive_patches(&report(), &ctx(), &task_model()).await;
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].action, PatchAction::SetDefault);
        assert_eq!(patches[0].target, "GET /api/tasks/{id}");
    }
}
