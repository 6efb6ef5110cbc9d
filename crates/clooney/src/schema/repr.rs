//! Persisted JSON-schema-like form of [`InferredSchema`].

use super::{InferredSchema, ObjectSchema, StringFormat};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Wire shape: `type`, `format`, `properties`, `required`, `items`, `anyOf`,
/// plus a per-property `default`. An empty document `{}` reads back as the
/// empty-object placeholder.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaRepr {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<BTreeMap<String, SchemaRepr>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<SchemaRepr>>,
    #[serde(rename = "anyOf", default, skip_serializing_if = "Option::is_none")]
    pub any_of: Option<Vec<SchemaRepr>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl From<InferredSchema> for SchemaRepr {
    fn from(schema: InferredSchema) -> Self {
        let bare = |kind: &str| SchemaRepr {
            kind: Some(kind.to_string()),
            ..Default::default()
        };
        match schema {
            InferredSchema::Null => bare("null"),
            InferredSchema::Boolean => bare("boolean"),
            InferredSchema::Integer => bare("integer"),
            InferredSchema::Number => bare("number"),
            InferredSchema::String { format } => SchemaRepr {
                format: format.map(|f| f.as_str().to_string()),
                ..bare("string")
            },
            InferredSchema::Array { items } => SchemaRepr {
                items: Some(Box::new(SchemaRepr::from(*items))),
                ..bare("array")
            },
            InferredSchema::Object(obj) => {
                let ObjectSchema {
                    properties,
                    required,
                    mut defaults,
                } = obj;
                let properties = properties
                    .into_iter()
                    .map(|(name, prop)| {
                        let mut repr = SchemaRepr::from(prop);
                        repr.default = defaults.remove(&name);
                        (name, repr)
                    })
                    .collect();
                SchemaRepr {
                    properties: Some(properties),
                    required: Some(required.into_iter().collect()),
                    ..bare("object")
                }
            }
            InferredSchema::Union { any_of } => SchemaRepr {
                any_of: Some(any_of.into_iter().map(SchemaRepr::from).collect()),
                ..Default::default()
            },
        }
    }
}

impl TryFrom<SchemaRepr> for InferredSchema {
    type Error = String;

    fn try_from(repr: SchemaRepr) -> Result<Self, Self::Error> {
        if let Some(members) = repr.any_of {
            let any_of = members
                .into_iter()
                .map(InferredSchema::try_from)
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(InferredSchema::Union { any_of });
        }

        match repr.kind.as_deref() {
            None | Some("object") => {
                let mut obj = ObjectSchema::default();
                for (name, mut prop) in repr.properties.unwrap_or_default() {
                    if let Some(default) = prop.default.take() {
                        obj.defaults.insert(name.clone(), default);
                    }
                    obj.properties.insert(name, InferredSchema::try_from(prop)?);
                }
                obj.required = repr.required.unwrap_or_default().into_iter().collect();
                Ok(InferredSchema::Object(obj))
            }
            Some("null") => Ok(InferredSchema::Null),
            Some("boolean") => Ok(InferredSchema::Boolean),
            Some("integer") => Ok(InferredSchema::Integer),
            Some("number") => Ok(InferredSchema::Number),
            Some("string") => Ok(InferredSchema::String {
                format: repr.format.as_deref().and_then(StringFormat::parse),
            }),
            Some("array") => {
                let items = match repr.items {
                    Some(items) => InferredSchema::try_from(*items)?,
                    None => InferredSchema::placeholder(),
                };
                Ok(InferredSchema::Array {
                    items: Box::new(items),
                })
            }
            Some(other) => Err(format!("unknown schema type '{other}'")),
        }
    }
}
