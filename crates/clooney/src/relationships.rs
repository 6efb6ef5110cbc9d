//! Relationship detection between entities.
//!
//! Walks each entity's merged fields for foreign-key shaped names and records
//! which entities it references. Self-references are kept: a `parent_id` on a
//! `Parent` entity, or `task_id` inside `Task`, is reported like any other edge.

use crate::entity::{derive_entities, entity_from_field};
use crate::model::SchemaModel;
use crate::schema::InferredSchema;
use std::collections::{BTreeMap, BTreeSet};

/// Referencing entity name to the set of entities it references.
///
/// Entities without outgoing edges are omitted. Besides each entity's own
/// fields, objects nested one level down (`{"memberships": [{"project_id": ..}]}`)
/// also contribute edges to the owning entity.
pub fn detect(model: &SchemaModel) -> BTreeMap<String, BTreeSet<String>> {
    let mut out: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (name, entity) in derive_entities(model) {
        let mut targets: BTreeSet<String> = entity
            .relationships
            .values()
            .map(|rel| rel.entity.clone())
            .collect();
        for prop in entity.fields.properties.values() {
            if let Some(nested) = nested_object_fields(prop) {
                targets.extend(nested.filter_map(|f| entity_from_field(f).map(|r| r.entity)));
            }
        }
        if !targets.is_empty() {
            out.insert(name, targets);
        }
    }
    out
}

fn nested_object_fields(schema: &InferredSchema) -> Option<impl Iterator<Item = &String>> {
    match schema {
        InferredSchema::Object(obj) => Some(obj.properties.keys()),
        InferredSchema::Array { items } => match items.as_ref() {
            InferredSchema::Object(obj) => Some(obj.properties.keys()),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EndpointRecord, ResponseSample, SchemaModel};
    use crate::normalize::EndpointKey;
    use crate::schema::InferenceOptions;
    use serde_json::{json, Value};

    fn model_from(samples: &[(&str, Value)]) -> SchemaModel {
        let mut records = BTreeMap::new();
        for (key, body) in samples {
            let key: EndpointKey = key.parse().unwrap();
            let record: &mut EndpointRecord = records.entry(key.clone()).or_default();
            record.methods.insert(key.method.clone());
            record.responses.push(ResponseSample {
                status: 200,
                body: body.clone(),
            });
        }
        SchemaModel::from_records(records, &InferenceOptions::default())
    }

    #[test]
    fn test_detects_foreign_keys() {
        let model = model_from(&[
            ("GET /api/tasks/{id}", json!({"name": "a", "project_id": "p", "assignee_gid": "u", "tag_ids": ["t"]})),
            ("GET /api/projects", json!([{"name": "p", "workspaceId": "w"}])),
        ]);
        let rels = detect(&model);
        assert_eq!(
            rels["Task"],
            BTreeSet::from(["Assignee".to_string(), "Project".to_string(), "Tag".to_string()])
        );
        assert_eq!(rels["Project"], BTreeSet::from(["Workspace".to_string()]));
    }

    #[test]
    fn test_duplicates_collapse_and_order_independent() {
        let a = model_from(&[
            ("GET /api/tasks/{id}", json!({"project_id": "p"})),
            ("GET /api/tasks", json!([{"project_id": "p", "projectId": "p"}])),
        ]);
        let b = model_from(&[
            ("GET /api/tasks", json!([{"projectId": "p", "project_id": "p"}])),
            ("GET /api/tasks/{id}", json!({"project_id": "p"})),
        ]);
        assert_eq!(detect(&a), detect(&b));
        assert_eq!(detect(&a)["Task"].len(), 1);
    }

    #[test]
    fn test_self_reference_preserved() {
        let model = model_from(&[("GET /api/tasks/{id}", json!({"name": "a", "task_id": "t0"}))]);
        assert_eq!(detect(&model)["Task"], BTreeSet::from(["Task".to_string()]));
    }

    #[test]
    fn test_nested_objects_contribute() {
        let model = model_from(&[(
            "GET /api/tasks/{id}",
            json!({"memberships": [{"section_gid": "s"}], "id": "x"}),
        )]);
        assert_eq!(detect(&model)["Task"], BTreeSet::from(["Section".to_string()]));
    }

    #[test]
    fn test_no_edges_no_entry() {
        let model = model_from(&[("GET /api/tasks/{id}", json!({"id": "t", "name": "a"}))]);
        assert!(detect(&model).is_empty());
    }
}
