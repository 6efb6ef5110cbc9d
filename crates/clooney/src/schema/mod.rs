//! Structural schema inference over JSON samples.
//!
//! [`infer`] derives an [`InferredSchema`] from one sample; [`merge`] combines
//! two schemas so that an endpoint's schema is the left fold of every sample
//! it was observed with. Merging is commutative and associative up to the
//! member order of unions, which are kept sorted by kind to make even that
//! deterministic.

mod repr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::debug;

pub use repr::SchemaRepr;

/// Field names assigned by the server rather than the client.
pub const DEFAULT_VOLATILE_FIELDS: &[&str] = &[
    "id",
    "gid",
    "created_at",
    "updated_at",
    "modified_at",
    "timestamp",
    "__creationTime",
    "__modificationTime",
];

/// Recognized string formats, ordered by merge precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StringFormat {
    DateTime,
    Date,
    Uuid,
    Uri,
}

impl StringFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            StringFormat::DateTime => "date-time",
            StringFormat::Date => "date",
            StringFormat::Uuid => "uuid",
            StringFormat::Uri => "uri",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "date-time" => Some(StringFormat::DateTime),
            "date" => Some(StringFormat::Date),
            "uuid" => Some(StringFormat::Uuid),
            "uri" => Some(StringFormat::Uri),
            _ => None,
        }
    }

    /// Detect the format of a string sample. Date-time is checked before date
    /// because every date-time also carries a date prefix.
    pub fn detect(s: &str) -> Option<Self> {
        let b = s.as_bytes();
        let date_prefix = b.len() >= 10
            && b[..4].iter().all(u8::is_ascii_digit)
            && b[4] == b'-'
            && b[5..7].iter().all(u8::is_ascii_digit)
            && b[7] == b'-'
            && b[8..10].iter().all(u8::is_ascii_digit);
        if date_prefix && b.get(10) == Some(&b'T') {
            Some(StringFormat::DateTime)
        } else if date_prefix {
            Some(StringFormat::Date)
        } else if crate::normalize::is_uuid(s) {
            Some(StringFormat::Uuid)
        } else if s.starts_with("http://") || s.starts_with("https://") {
            Some(StringFormat::Uri)
        } else {
            None
        }
    }
}

impl fmt::Display for StringFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Object shape: properties, the names required in every sample, and any
/// default values written by refinement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectSchema {
    pub properties: BTreeMap<String, InferredSchema>,
    pub required: BTreeSet<String>,
    pub defaults: BTreeMap<String, Value>,
}

impl ObjectSchema {
    fn is_empty(&self) -> bool {
        self.properties.is_empty() && self.required.is_empty() && self.defaults.is_empty()
    }
}

/// Recursive structural type of a JSON value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SchemaRepr", into = "SchemaRepr")]
pub enum InferredSchema {
    Null,
    Boolean,
    Integer,
    Number,
    String { format: Option<StringFormat> },
    Array { items: Box<InferredSchema> },
    Object(ObjectSchema),
    Union { any_of: Vec<InferredSchema> },
}

impl Default for InferredSchema {
    fn default() -> Self {
        InferredSchema::placeholder()
    }
}

impl InferredSchema {
    /// Empty object shape, used for the items of empty arrays.
    pub fn placeholder() -> Self {
        InferredSchema::Object(ObjectSchema::default())
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, InferredSchema::Object(obj) if obj.is_empty())
    }

    pub fn string() -> Self {
        InferredSchema::String { format: None }
    }

    /// JSON-schema style type name.
    pub fn type_name(&self) -> &'static str {
        match self {
            InferredSchema::Null => "null",
            InferredSchema::Boolean => "boolean",
            InferredSchema::Integer => "integer",
            InferredSchema::Number => "number",
            InferredSchema::String { .. } => "string",
            InferredSchema::Array { .. } => "array",
            InferredSchema::Object(_) => "object",
            InferredSchema::Union { .. } => "union",
        }
    }

    /// Bare schema for a type name produced by [`InferredSchema::type_name`]
    /// or [`crate::diff::json_type_name`].
    pub fn from_type_name(name: &str) -> Option<Self> {
        match name {
            "null" => Some(InferredSchema::Null),
            "boolean" | "bool" => Some(InferredSchema::Boolean),
            "integer" => Some(InferredSchema::Integer),
            "number" => Some(InferredSchema::Number),
            "string" => Some(InferredSchema::string()),
            "array" => Some(InferredSchema::Array {
                items: Box::new(InferredSchema::placeholder()),
            }),
            "object" => Some(InferredSchema::placeholder()),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectSchema> {
        match self {
            InferredSchema::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn as_object_mut(&mut self) -> Option<&mut ObjectSchema> {
        match self {
            InferredSchema::Object(obj) => Some(obj),
            _ => None,
        }
    }

    fn kind_rank(&self) -> u8 {
        match self {
            InferredSchema::Null => 0,
            InferredSchema::Boolean => 1,
            InferredSchema::Integer => 2,
            InferredSchema::Number => 3,
            InferredSchema::String { .. } => 4,
            InferredSchema::Array { .. } => 5,
            InferredSchema::Object(_) => 6,
            InferredSchema::Union { .. } => 7,
        }
    }

    /// Map of field path to type name for every leaf. Objects contribute
    /// `a.b` paths, arrays contribute `a[]`, unions list their member kinds.
    pub fn leaf_types(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        collect_leaves(self, String::new(), &mut out);
        out
    }
}

fn collect_leaves(schema: &InferredSchema, path: String, out: &mut BTreeMap<String, String>) {
    match schema {
        InferredSchema::Object(obj) if !obj.properties.is_empty() => {
            for (name, prop) in &obj.properties {
                let child = if path.is_empty() {
                    name.clone()
                } else {
                    format!("{path}.{name}")
                };
                collect_leaves(prop, child, out);
            }
        }
        InferredSchema::Array { items } => collect_leaves(items, format!("{path}[]"), out),
        InferredSchema::Union { any_of } => {
            let kinds: Vec<&str> = any_of.iter().map(InferredSchema::type_name).collect();
            out.insert(path, kinds.join("|"));
        }
        other => {
            out.insert(path, other.type_name().to_string());
        }
    }
}

/// Knobs for single-sample inference.
#[derive(Debug, Clone)]
pub struct InferenceOptions {
    /// Properties kept in the schema but never marked required.
    pub volatile_fields: BTreeSet<String>,
}

impl Default for InferenceOptions {
    fn default() -> Self {
        Self {
            volatile_fields: DEFAULT_VOLATILE_FIELDS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl InferenceOptions {
    /// Every present, non-empty field counts toward `required`.
    pub fn strict() -> Self {
        Self {
            volatile_fields: BTreeSet::new(),
        }
    }
}

/// Infer a schema with the default volatile field set.
pub fn infer(value: &Value) -> InferredSchema {
    infer_with(value, &InferenceOptions::default())
}

/// Infer a schema for one JSON sample.
///
/// Arrays are inferred from their first element only.
pub fn infer_with(value: &Value, options: &InferenceOptions) -> InferredSchema {
    match value {
        Value::Null => InferredSchema::Null,
        Value::Bool(_) => InferredSchema::Boolean,
        Value::Number(n) if n.is_i64() || n.is_u64() => InferredSchema::Integer,
        Value::Number(_) => InferredSchema::Number,
        Value::String(s) => InferredSchema::String {
            format: StringFormat::detect(s),
        },
        Value::Array(items) => InferredSchema::Array {
            items: Box::new(
                items
                    .first()
                    .map(|first| infer_with(first, options))
                    .unwrap_or_else(InferredSchema::placeholder),
            ),
        },
        Value::Object(map) => {
            let mut obj = ObjectSchema::default();
            for (key, val) in map {
                obj.properties.insert(key.clone(), infer_with(val, options));
                let present = !matches!(val, Value::Null) && val.as_str() != Some("");
                if present && !options.volatile_fields.contains(key) {
                    obj.required.insert(key.clone());
                }
            }
            InferredSchema::Object(obj)
        }
    }
}

/// Merge two schemas.
///
/// Null yields to the other side. Equal kinds merge recursively: objects take
/// the union of properties and the intersection of `required`. Differing kinds
/// produce a union instead of picking a winner.
pub fn merge(a: &InferredSchema, b: &InferredSchema) -> InferredSchema {
    use InferredSchema::*;
    match (a, b) {
        (Null, other) | (other, Null) => other.clone(),
        (Boolean, Boolean) => Boolean,
        (Integer, Integer) => Integer,
        (Number, Number) => Number,
        (String { format: fa }, String { format: fb }) => String {
            format: match (fa, fb) {
                (Some(x), Some(y)) => Some((*x).min(*y)),
                (x, y) => (*x).or(*y),
            },
        },
        (Array { items: ia }, Array { items: ib }) => Array {
            items: Box::new(if ia.is_placeholder() {
                (**ib).clone()
            } else if ib.is_placeholder() {
                (**ia).clone()
            } else {
                merge(ia, ib)
            }),
        },
        (Object(oa), Object(ob)) => Object(merge_objects(oa, ob)),
        (Union { any_of }, other) | (other, Union { any_of }) => {
            let mut members = any_of.clone();
            absorb(&mut members, other);
            Union { any_of: members }
        }
        (x, y) => {
            debug!(left = x.type_name(), right = y.type_name(), "kind conflict merged to union");
            let mut members = vec![x.clone()];
            absorb(&mut members, y);
            Union { any_of: members }
        }
    }
}

fn merge_objects(a: &ObjectSchema, b: &ObjectSchema) -> ObjectSchema {
    let mut properties = a.properties.clone();
    for (name, schema) in &b.properties {
        let merged = match properties.get(name) {
            Some(existing) => merge(existing, schema),
            None => schema.clone(),
        };
        properties.insert(name.clone(), merged);
    }
    let required = a.required.intersection(&b.required).cloned().collect();
    let mut defaults = b.defaults.clone();
    defaults.extend(a.defaults.iter().map(|(k, v)| (k.clone(), v.clone())));
    ObjectSchema {
        properties,
        required,
        defaults,
    }
}

/// Fold `incoming` (possibly itself a union) into a kind-unique member list.
fn absorb(members: &mut Vec<InferredSchema>, incoming: &InferredSchema) {
    let incoming = match incoming {
        InferredSchema::Union { any_of } => any_of.clone(),
        InferredSchema::Null => Vec::new(),
        other => vec![other.clone()],
    };
    for schema in incoming {
        match members.iter_mut().find(|m| m.kind_rank() == schema.kind_rank()) {
            Some(existing) => *existing = merge(existing, &schema),
            None => members.push(schema),
        }
    }
    members.sort_by_key(InferredSchema::kind_rank);
}

/// Left fold of [`merge`] over schemas in arrival order.
pub fn merge_all<'a, I>(schemas: I) -> Option<InferredSchema>
where
    I: IntoIterator<Item = &'a InferredSchema>,
{
    schemas.into_iter().fold(None, |acc, next| {
        Some(match acc {
            Some(acc) => merge(&acc, next),
            None => next.clone(),
        })
    })
}
