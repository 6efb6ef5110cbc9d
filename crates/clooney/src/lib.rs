// Copyright 2026 Clooney Contributors
// SPDX-License-Identifier: Apache-2.0

//! Clooney: reverse-engineer a REST API from captured traffic.
//!
//! Captured exchanges are normalized into endpoints, their JSON bodies are
//! folded into structural schemas, and the resulting model is rendered to
//! artifacts. A convergence loop then probes a running clone, diffs its
//! responses against the capture, and patches the model until the clone
//! scores above a quality threshold.

pub mod capture;
pub mod codegen;
pub mod config;
pub mod convergence;
pub mod diff;
pub mod enrich;
pub mod entity;
pub mod error;
pub mod model;
pub mod normalize;
pub mod oracle;
pub mod probe;
pub mod refine;
pub mod relationships;
pub mod schema;

pub use capture::{load_capture, parse_capture, CapturedMessage};
pub use codegen::{default_generators, generate_all, ArtifactGenerator, GeneratedArtifact};
pub use config::RunConfig;
pub use convergence::{
    ConvergenceLoop, FinalReport, IterationRecord, LoopState, QualityTrend, StopReason,
};
pub use diff::{diff, quality_score, DiffEntry, DiffReport};
pub use error::{ClooneyError, OracleError, Result};
pub use model::{EndpointRecord, SchemaModel};
pub use normalize::{Classifier, ClassifierConfig, EndpointKey};
pub use oracle::{DisabledOracle, GeminiConfig, GeminiOracle, Oracle, OracleRequest, OracleTask};
pub use probe::{HttpProbe, ProbeResponse, ProbeTarget};
pub use refine::{apply_patches, to_patches, PatchAction, PatchInstruction, Refiner};
pub use schema::{infer, merge, InferenceOptions, InferredSchema};
