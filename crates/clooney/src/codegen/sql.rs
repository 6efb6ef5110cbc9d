//! SQL DDL generator.
//!
//! One table per derived entity, columns from the merged field schema, and
//! foreign keys for every `belongs_to` edge whose target entity has a table.

use super::{ArtifactGenerator, GeneratedArtifact};
use crate::entity::{
    derive_entities, entity_from_field, pluralize, snake_case, EntitySchema, RelationKind,
};
use crate::error::Result;
use crate::model::SchemaModel;
use crate::schema::{InferredSchema, StringFormat};
use std::collections::BTreeMap;

/// Renders `schema.sql`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlSchemaGenerator;

impl ArtifactGenerator for SqlSchemaGenerator {
    fn name(&self) -> &str {
        "sql"
    }

    fn generate(&self, model: &SchemaModel) -> Result<GeneratedArtifact> {
        Ok(GeneratedArtifact {
            filename: "schema.sql".to_string(),
            content: render_schema(&derive_entities(model)),
        })
    }
}

/// Table name for an entity: `CustomField` becomes `custom_fields`.
pub fn table_name(entity: &str) -> String {
    pluralize(&snake_case(entity))
}

/// Column type for a property.
pub fn sql_type(name: &str, schema: &InferredSchema) -> &'static str {
    if is_key_column(name) {
        return "VARCHAR(255)";
    }
    match schema {
        InferredSchema::Boolean => "BOOLEAN",
        InferredSchema::Integer => "INTEGER",
        InferredSchema::Number => "DECIMAL(10, 2)",
        InferredSchema::String { format } => match format {
            Some(StringFormat::DateTime | StringFormat::Date) => "TIMESTAMP",
            Some(StringFormat::Uuid) => "UUID",
            _ => "TEXT",
        },
        InferredSchema::Array { .. } | InferredSchema::Object(_) | InferredSchema::Union { .. } => {
            "JSONB"
        }
        InferredSchema::Null => "TEXT",
    }
}

fn is_primary(name: &str) -> bool {
    name == "id" || name == "gid"
}

fn is_key_column(name: &str) -> bool {
    is_primary(name) || entity_from_field(name).is_some()
}

/// The single primary-key column of a table: `id` when captured, else `gid`.
/// Tables with neither get a serial `id`.
fn primary_key(entity: &EntitySchema) -> &'static str {
    let props = &entity.fields.properties;
    if !props.contains_key("id") && props.contains_key("gid") {
        "gid"
    } else {
        "id"
    }
}

fn render_schema(entities: &BTreeMap<String, EntitySchema>) -> String {
    let mut out = String::from("-- Generated from captured network traffic\n\n");

    for entity in entities.values() {
        out.push_str(&render_table(entity));
        out.push('\n');
    }

    for entity in entities.values() {
        let table = table_name(&entity.name);
        for (field, rel) in &entity.relationships {
            let column = entity.fields.properties.contains_key(field);
            if rel.kind != RelationKind::BelongsTo || !column {
                continue;
            }
            let Some(target) = entities.get(&rel.entity) else {
                continue;
            };
            out.push_str(&format!(
                "ALTER TABLE {table} ADD CONSTRAINT fk_{table}_{field} \
                 FOREIGN KEY ({field}) REFERENCES {}({});\n",
                table_name(&rel.entity),
                primary_key(target)
            ));
        }
    }
    out
}

fn render_table(entity: &EntitySchema) -> String {
    let table = table_name(&entity.name);
    let fields = &entity.fields;
    let primary = primary_key(entity);
    let mut columns: Vec<String> = Vec::new();

    if !fields.properties.contains_key(primary) {
        columns.push(format!("{primary} SERIAL PRIMARY KEY"));
    }
    for (name, schema) in &fields.properties {
        if name == primary {
            columns.push(format!("{name} VARCHAR(255) PRIMARY KEY"));
            continue;
        }
        let null = if fields.required.contains(name) {
            "NOT NULL"
        } else {
            "NULL"
        };
        columns.push(format!("{name} {} {null}", sql_type(name, schema)));
    }
    for stamp in ["created_at", "updated_at"] {
        if !fields.properties.contains_key(stamp) {
            columns.push(format!("{stamp} TIMESTAMP DEFAULT CURRENT_TIMESTAMP"));
        }
    }

    let mut out = format!("CREATE TABLE IF NOT EXISTS {table} (\n");
    out.push_str(
        &columns
            .iter()
            .map(|c| format!("    {c}"))
            .collect::<Vec<_>>()
            .join(",\n"),
    );
    out.push_str("\n);\n");
    if fields.properties.contains_key("name") {
        out.push_str(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_name ON {table}(name);\n"
        ));
    }
    out
}
