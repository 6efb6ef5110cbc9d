//! Artifact generation from the schema model.
//!
//! Each generator is a pure function of the model; [`generate_all`] runs them
//! in order and optionally writes the results to an output directory.

pub mod openapi;
pub mod sql;

use crate::error::{ClooneyError, Result};
use crate::model::SchemaModel;
use std::fs;
use std::path::Path;
use tracing::info;

pub use openapi::OpenApiGenerator;
pub use sql::SqlSchemaGenerator;

/// A rendered artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedArtifact {
    pub filename: String,
    pub content: String,
}

/// Renders the schema model into one artifact.
pub trait ArtifactGenerator: Send + Sync {
    fn name(&self) -> &str;

    fn generate(&self, model: &SchemaModel) -> Result<GeneratedArtifact>;
}

/// The built-in generators: OpenAPI document and SQL schema.
pub fn default_generators() -> Vec<Box<dyn ArtifactGenerator>> {
    vec![Box::new(OpenApiGenerator::default()), Box::new(SqlSchemaGenerator)]
}

/// Run every generator, stopping at the first failure.
///
/// When `output_dir` is given each artifact is also written there.
pub fn generate_all(
    generators: &[Box<dyn ArtifactGenerator>],
    model: &SchemaModel,
    output_dir: Option<&Path>,
) -> Result<Vec<GeneratedArtifact>> {
    if let Some(dir) = output_dir {
        fs::create_dir_all(dir)?;
    }

    let mut artifacts = Vec::with_capacity(generators.len());
    for generator in generators {
        let artifact = generator.generate(model).map_err(|e| match e {
            err @ ClooneyError::Generation { .. } => err,
            other => ClooneyError::Generation {
                generator: generator.name().to_string(),
                message: other.to_string(),
            },
        })?;
        if let Some(dir) = output_dir {
            fs::write(dir.join(&artifact.filename), &artifact.content)?;
        }
        info!(
            generator = generator.name(),
            file = %artifact.filename,
            bytes = artifact.content.len(),
            "artifact generated"
        );
        artifacts.push(artifact);
    }
    Ok(artifacts)
}
