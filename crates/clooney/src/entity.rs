//! Entity naming heuristics and entity aggregation.
//!
//! Entity names come from two string heuristics kept here and nowhere else:
//! the last meaningful path segment (singularized, PascalCased) and
//! foreign-key shaped field names (`project_id`, `ownerGid`, `tag_ids`).
//! Both are deliberately simple. Irregular plurals (`people`) and words that
//! merely end in `s` (`status`) come out wrong; callers treat the names as
//! hints, not truth.

use crate::model::SchemaModel;
use crate::normalize::EndpointKey;
use crate::schema::{merge, InferredSchema, ObjectSchema};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Field-name suffixes implying a to-many reference.
const MANY_SUFFIXES: &[&str] = &["_ids", "_gids", "Gids", "Ids", "IDs"];
/// Field-name suffixes implying a to-one reference. `Gid` precedes `Id` so
/// `projectGid` does not strip to `projectG`.
const ONE_SUFFIXES: &[&str] = &["_gid", "_id", "Gid", "ID", "Id", "gid"];

/// Kind of edge between two entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    BelongsTo,
    HasMany,
}

/// Distinguishing CRUD operation of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityOperation {
    Create,
    List,
    Get,
    Update,
    Delete,
}

/// One relationship edge: the referenced entity and the edge kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    pub entity: String,
    pub kind: RelationKind,
}

/// Aggregate over the endpoints that share an entity name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntitySchema {
    pub name: String,
    pub endpoints: BTreeSet<EndpointKey>,
    pub fields: ObjectSchema,
    pub operations: BTreeSet<EntityOperation>,
    /// Field name to referenced entity.
    pub relationships: BTreeMap<String, Relationship>,
}

fn is_version_segment(seg: &str) -> bool {
    let digits_and_dots = |s: &str| {
        !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit() || b == b'.')
    };
    digits_and_dots(seg)
        || seg
            .strip_prefix(['v', 'V'])
            .is_some_and(digits_and_dots)
}

/// Entity name for a normalized path, e.g. `/api/1.0/tasks/{id}` gives `Task`.
pub fn entity_from_path(path: &str) -> Option<String> {
    let segment = path
        .split('/')
        .filter(|seg| {
            !seg.is_empty()
                && !seg.starts_with('{')
                && *seg != "-"
                && !seg.eq_ignore_ascii_case("api")
                && !is_version_segment(seg)
        })
        .next_back()?;
    let name = pascal_case(&singularize(segment));
    (!name.is_empty()).then_some(name)
}

/// Referenced entity for a foreign-key shaped field name.
///
/// Only names containing `id` (case-insensitive) are candidates, and a
/// reference is only produced when a known suffix strips to a non-empty stem.
pub fn entity_from_field(field: &str) -> Option<Relationship> {
    if !field.to_ascii_lowercase().contains("id") {
        return None;
    }
    let strip = |suffixes: &[&str]| {
        suffixes
            .iter()
            .find_map(|suffix| field.strip_suffix(suffix))
            .map(|stem| stem.trim_end_matches(['_', '-']))
    };
    let (stem, kind) = match strip(MANY_SUFFIXES) {
        Some(stem) => (stem, RelationKind::HasMany),
        None => (strip(ONE_SUFFIXES)?, RelationKind::BelongsTo),
    };
    let entity = pascal_case(stem);
    (!entity.is_empty()).then_some(Relationship { entity, kind })
}

/// Naive singular: `ies` to `y`, drop one trailing `s` unless the word ends in `ss`.
pub fn singularize(word: &str) -> String {
    if let Some(stem) = word.strip_suffix("ies") {
        if !stem.is_empty() {
            return format!("{stem}y");
        }
    }
    if word.ends_with("ss") {
        return word.to_string();
    }
    word.strip_suffix('s').unwrap_or(word).to_string()
}

/// Naive plural, the inverse of [`singularize`] for regular words.
pub fn pluralize(word: &str) -> String {
    let consonant_y = word.len() > 1
        && word.ends_with('y')
        && !word[..word.len() - 1].ends_with(['a', 'e', 'i', 'o', 'u']);
    if consonant_y {
        format!("{}ies", &word[..word.len() - 1])
    } else if ["s", "x", "ch", "sh"].iter().any(|s| word.ends_with(s)) {
        format!("{word}es")
    } else {
        format!("{word}s")
    }
}

/// `custom_field`, `custom-field` and `customField` all become `CustomField`.
pub fn pascal_case(word: &str) -> String {
    word.split(['_', '-', '.'])
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

/// `CustomField` becomes `custom_field`.
pub fn snake_case(word: &str) -> String {
    let mut out = String::with_capacity(word.len() + 4);
    for (i, c) in word.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// CRUD operation implied by method and path shape.
pub fn operation_for(key: &EndpointKey) -> Option<EntityOperation> {
    let item = key
        .path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .is_some_and(|seg| seg.starts_with('{'));
    match key.method.as_str() {
        "GET" if item => Some(EntityOperation::Get),
        "GET" => Some(EntityOperation::List),
        "POST" => Some(EntityOperation::Create),
        "PUT" | "PATCH" => Some(EntityOperation::Update),
        "DELETE" => Some(EntityOperation::Delete),
        _ => None,
    }
}

/// Fallback operation name such as `get_task` or `list_tasks`.
pub fn operation_name(key: &EndpointKey) -> Option<String> {
    let entity = snake_case(&entity_from_path(&key.path)?);
    let name = match operation_for(key)? {
        EntityOperation::Create => format!("create_{entity}"),
        EntityOperation::List => format!("list_{}", pluralize(&entity)),
        EntityOperation::Get => format!("get_{entity}"),
        EntityOperation::Update => format!("update_{entity}"),
        EntityOperation::Delete => format!("delete_{entity}"),
    };
    Some(name)
}

/// Object shape describing an entity inside a schema: the object itself, or
/// the items of an array of objects.
pub(crate) fn entity_object(schema: &InferredSchema) -> Option<&ObjectSchema> {
    match schema {
        InferredSchema::Object(obj) => Some(obj),
        InferredSchema::Array { items } => entity_object(items),
        InferredSchema::Union { any_of } => any_of.iter().find_map(entity_object),
        _ => None,
    }
}

/// Group endpoints by entity and merge what is known about each.
///
/// Fields come from 2xx response schemas; request schemas are used only for
/// entities that never returned a body. Relationships are drawn from both, so
/// a reference sent only in a request body still counts.
pub fn derive_entities(model: &SchemaModel) -> BTreeMap<String, EntitySchema> {
    let mut entities: BTreeMap<String, EntitySchema> = BTreeMap::new();
    let mut request_fields: BTreeMap<String, ObjectSchema> = BTreeMap::new();
    let mut has_response: BTreeSet<String> = BTreeSet::new();

    for key in model.endpoints.keys() {
        let Some(name) = entity_from_path(&key.path) else {
            continue;
        };
        let entity = entities.entry(name.clone()).or_insert_with(|| EntitySchema {
            name: name.clone(),
            ..Default::default()
        });
        entity.endpoints.insert(key.clone());
        if let Some(op) = operation_for(key) {
            entity.operations.insert(op);
        }

        let Some(schemas) = model.schemas.get(key) else {
            continue;
        };
        for obj in schemas.successes().filter_map(entity_object) {
            entity.fields = merge_fields(&entity.fields, obj, has_response.contains(&name));
            has_response.insert(name.clone());
        }
        if let Some(obj) = schemas.request.as_ref().and_then(entity_object) {
            let merged = match request_fields.get(&name) {
                Some(existing) => merge_fields(existing, obj, true),
                None => obj.clone(),
            };
            request_fields.insert(name.clone(), merged);
        }
    }

    for (name, entity) in entities.iter_mut() {
        let requested = request_fields.remove(name).unwrap_or_default();
        entity.relationships = entity
            .fields
            .properties
            .keys()
            .chain(requested.properties.keys())
            .filter_map(|field| entity_from_field(field).map(|rel| (field.clone(), rel)))
            .collect();
        if !has_response.contains(name) {
            entity.fields = requested;
        }
    }
    entities
}

fn merge_fields(existing: &ObjectSchema, next: &ObjectSchema, seeded: bool) -> ObjectSchema {
    if !seeded {
        return next.clone();
    }
    match merge(
        &InferredSchema::Object(existing.clone()),
        &InferredSchema::Object(next.clone()),
    ) {
        InferredSchema::Object(obj) => obj,
        _ => existing.clone(),
    }
}
