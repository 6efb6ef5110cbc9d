//! The refinement loop.
//!
//! Each iteration walks `Parsing -> Generating -> Testing -> Refining` and
//! appends exactly one [`IterationRecord`]. The loop stops when the average
//! probe quality reaches the threshold or the iteration budget runs out; in
//! both cases a [`FinalReport`] is returned.
//!
//! Probing is a fixed plan issued sequentially, one request at a time, each
//! under the configured timeout. Nothing is retried within an iteration.

use crate::capture::load_capture;
use crate::codegen::{generate_all, ArtifactGenerator};
use crate::config::RunConfig;
use crate::diff::{diff, normalize, quality_score};
use crate::enrich::enrich_model;
use crate::error::{ClooneyError, Result};
use crate::model::SchemaModel;
use crate::normalize::{Classifier, EndpointKey};
use crate::oracle::Oracle;
use crate::probe::{ProbeResponse, ProbeTarget};
use crate::refine::{apply_patches, expected_responses, PatchContext, PatchInstruction, Refiner};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Phase of the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Idle,
    Parsing,
    Generating,
    Testing,
    Refining,
    Converged,
    IterationLimitReached,
}

/// Where the iteration's model came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelSource {
    InMemory,
    Persisted,
    Capture,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsingStep {
    pub source: ModelSource,
    pub endpoints_found: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationStep {
    pub success: bool,
    pub artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Score of one probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeScore {
    pub method: String,
    pub path: String,
    pub status: Option<u16>,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestingStep {
    pub endpoints_tested: usize,
    pub average_quality: f64,
    pub probes: Vec<ProbeScore>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RefinementStep {
    /// Set when refinement did not run, e.g. `threshold_met`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
    pub diffs: usize,
    pub suggestions: usize,
    pub patches_applied: usize,
    pub patches_skipped: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IterationSteps {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parsing: Option<ParsingStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<GenerationStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub testing: Option<TestingStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refinement: Option<RefinementStep>,
}

/// One completed iteration. Steps after an aborting failure are absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub timestamp: DateTime<Utc>,
    pub steps: IterationSteps,
    pub quality: f64,
    pub converged: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Converged,
    IterationLimitReached,
}

/// Direction of the quality trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTrend {
    Improving,
    Regressing,
    Plateau,
    InsufficientData,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityPoint {
    pub iteration: u32,
    pub quality: f64,
}

/// Summary of a whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalReport {
    pub total_iterations: u32,
    pub converged: bool,
    pub stop_reason: StopReason,
    pub final_quality: f64,
    pub trajectory: Vec<QualityPoint>,
    pub trend: QualityTrend,
}

#[derive(Serialize)]
struct History<'a> {
    iterations: &'a [IterationRecord],
    report: &'a FinalReport,
}

/// One planned request and what it should return.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedProbe {
    pub endpoint: EndpointKey,
    pub method: String,
    pub path: String,
    pub body: Option<Value>,
    pub expected: Option<Value>,
}

struct ProbeOutcome {
    probe: PlannedProbe,
    response: ProbeResponse,
    score: f64,
}

/// Drives parse, generate, probe and refine until convergence.
pub struct ConvergenceLoop {
    config: RunConfig,
    oracle: Arc<dyn Oracle>,
    target: Arc<dyn ProbeTarget>,
    generators: Vec<Box<dyn ArtifactGenerator>>,
    model: Option<SchemaModel>,
    state: LoopState,
    history: Vec<IterationRecord>,
}

impl ConvergenceLoop {
    pub fn new(
        config: RunConfig,
        oracle: Arc<dyn Oracle>,
        target: Arc<dyn ProbeTarget>,
        generators: Vec<Box<dyn ArtifactGenerator>>,
    ) -> Self {
        Self {
            config,
            oracle,
            target,
            generators,
            model: None,
            state: LoopState::Idle,
            history: Vec::new(),
        }
    }

    /// Start from an already materialized model instead of the capture.
    pub fn with_model(mut self, model: SchemaModel) -> Self {
        self.model = Some(model);
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn history(&self) -> &[IterationRecord] {
        &self.history
    }

    pub fn model(&self) -> Option<&SchemaModel> {
        self.model.as_ref()
    }

    fn transition(&mut self, next: LoopState) {
        debug!(from = ?self.state, to = ?next, "loop state");
        self.state = next;
    }

    /// Run until convergence or the iteration limit.
    pub async fn run(&mut self) -> Result<FinalReport> {
        self.preflight()?;
        let classifier = Classifier::new(&self.config.classifier)?;

        let mut converged = false;
        for iteration in 1..=self.config.max_iterations {
            let record = self.iterate(iteration, &classifier).await;
            info!(
                iteration,
                quality = record.quality,
                converged = record.converged,
                "iteration finished"
            );
            converged = record.converged;
            self.history.push(record);
            if converged {
                break;
            }
            self.transition(LoopState::Idle);
        }

        self.transition(if converged {
            LoopState::Converged
        } else {
            LoopState::IterationLimitReached
        });
        let report = build_report(&self.history, converged);
        if let Some(path) = &self.config.history_path {
            if let Err(e) = save_history(path, &self.history, &report) {
                warn!(path = %path.display(), "cannot write history: {e}");
            }
        }
        info!(
            iterations = report.total_iterations,
            converged = report.converged,
            quality = report.final_quality,
            trend = ?report.trend,
            "convergence loop finished"
        );
        Ok(report)
    }

    fn preflight(&self) -> Result<()> {
        if self.model.is_some() {
            return Ok(());
        }
        if self.config.model_path.as_deref().is_some_and(|p| p.exists()) {
            return Ok(());
        }
        match &self.config.capture_path {
            Some(path) if path.exists() => Ok(()),
            Some(path) => Err(ClooneyError::Config(format!(
                "capture file {} does not exist and no schema model is available",
                path.display()
            ))),
            None => Err(ClooneyError::Config(
                "no capture file configured and no schema model is available".into(),
            )),
        }
    }

    async fn iterate(&mut self, iteration: u32, classifier: &Classifier) -> IterationRecord {
        let mut record = IterationRecord {
            iteration,
            timestamp: Utc::now(),
            steps: IterationSteps::default(),
            quality: 0.0,
            converged: false,
        };

        self.transition(LoopState::Parsing);
        let parsing = self.parse(classifier).await;
        let parsed = parsing.error.is_none();
        record.steps.parsing = Some(parsing);
        let Some(model) = self.model.clone().filter(|_| parsed) else {
            return record;
        };

        self.transition(LoopState::Generating);
        let output_dir = self.config.output_dir.as_deref();
        let generation = match generate_all(&self.generators, &model, output_dir) {
            Ok(artifacts) => GenerationStep {
                success: true,
                artifacts: artifacts.into_iter().map(|a| a.filename).collect(),
                error: None,
            },
            Err(e) => {
                warn!(iteration, "generation failed: {e}");
                GenerationStep {
                    success: false,
                    artifacts: Vec::new(),
                    error: Some(e.to_string()),
                }
            }
        };
        let generated = generation.success;
        record.steps.generation = Some(generation);
        if !generated {
            return record;
        }

        self.transition(LoopState::Testing);
        let outcomes = self.probe_all(&model).await;
        let average = average_quality(&outcomes);
        record.quality = average;
        record.steps.testing = Some(TestingStep {
            endpoints_tested: outcomes.len(),
            average_quality: average,
            probes: outcomes
                .iter()
                .map(|o| ProbeScore {
                    method: o.probe.method.clone(),
                    path: o.probe.path.clone(),
                    status: o.response.status,
                    score: o.score,
                    error: o.response.error.clone(),
                })
                .collect(),
        });

        self.transition(LoopState::Refining);
        if average >= self.config.quality_threshold {
            record.converged = true;
            record.steps.refinement = Some(RefinementStep {
                skipped: Some("threshold_met".to_string()),
                ..Default::default()
            });
            return record;
        }
        let (refinement, next) = self.refine(&model, &outcomes).await;
        if let Some(path) = &self.config.model_path {
            if let Err(e) = next.save(path) {
                warn!(path = %path.display(), "cannot persist refined model: {e}");
            }
        }
        self.model = Some(next);
        record.steps.refinement = Some(refinement);
        record
    }

    async fn parse(&mut self, classifier: &Classifier) -> ParsingStep {
        if let Some(model) = &self.model {
            return ParsingStep {
                source: ModelSource::InMemory,
                endpoints_found: model.endpoints.len(),
                error: None,
            };
        }

        if let Some(path) = self.config.model_path.clone().filter(|p| p.exists()) {
            return match SchemaModel::load(&path) {
                Ok(model) => {
                    let step = ParsingStep {
                        source: ModelSource::Persisted,
                        endpoints_found: model.endpoints.len(),
                        error: None,
                    };
                    self.model = Some(model);
                    step
                }
                Err(e) => {
                    warn!(path = %path.display(), "cannot load schema model: {e}");
                    ParsingStep {
                        source: ModelSource::Persisted,
                        endpoints_found: 0,
                        error: Some(e.to_string()),
                    }
                }
            };
        }

        let failed = |e: ClooneyError| ParsingStep {
            source: ModelSource::Capture,
            endpoints_found: 0,
            error: Some(e.to_string()),
        };
        let Some(capture) = self.config.capture_path.clone() else {
            return failed(ClooneyError::Config("no capture file configured".into()));
        };
        let messages = match load_capture(&capture) {
            Ok(messages) => messages,
            Err(e) => {
                warn!(path = %capture.display(), "cannot parse capture: {e}");
                return failed(e);
            }
        };

        let mut model =
            SchemaModel::from_capture(&messages, classifier, &self.config.inference_options());
        enrich_model(&mut model, self.oracle.as_ref()).await;
        if let Some(path) = &self.config.model_path {
            if let Err(e) = model.save(path) {
                warn!(path = %path.display(), "cannot persist schema model: {e}");
            }
        }
        let step = ParsingStep {
            source: ModelSource::Capture,
            endpoints_found: model.endpoints.len(),
            error: None,
        };
        self.model = Some(model);
        step
    }

    async fn probe_all(&self, model: &SchemaModel) -> Vec<ProbeOutcome> {
        let volatile = self.config.volatile_set();
        let timeout = self.config.probe.timeout();
        let mut outcomes = Vec::new();

        for probe in probe_plan(model, &self.config) {
            let request = self
                .target
                .request(&probe.method, &probe.path, probe.body.as_ref());
            let response = match tokio::time::timeout(timeout, request).await {
                Ok(response) => response,
                Err(_) => {
                    ProbeResponse::failure(format!("timed out after {}ms", timeout.as_millis()))
                }
            };
            let score = score_probe(probe.expected.as_ref(), &response, &volatile);
            debug!(
                method = %probe.method,
                path = %probe.path,
                status = ?response.status,
                score,
                "probed"
            );
            outcomes.push(ProbeOutcome {
                probe,
                response,
                score,
            });
        }
        outcomes
    }

    async fn refine(
        &self,
        model: &SchemaModel,
        outcomes: &[ProbeOutcome],
    ) -> (RefinementStep, SchemaModel) {
        let volatile = self.config.volatile_set();
        let refiner = Refiner::new(self.oracle.as_ref());
        let mut step = RefinementStep::default();
        let mut patches: Vec<PatchInstruction> = Vec::new();

        for outcome in outcomes {
            let (Some(expected), Some(actual)) =
                (outcome.probe.expected.as_ref(), outcome.response.body.as_ref())
            else {
                continue;
            };
            if !outcome.response.is_success() {
                continue;
            }
            let report = diff(&normalize(expected, &volatile), &normalize(actual, &volatile));
            if report.is_empty() {
                continue;
            }
            step.diffs += 1;
            let ctx = PatchContext {
                endpoint: outcome.probe.endpoint.clone(),
            };
            patches.extend(refiner.derive_patches(&report, &ctx, model).await);
        }

        step.suggestions = patches.len();
        let outcome = apply_patches(model, &patches);
        step.patches_applied = outcome.applied;
        step.patches_skipped = outcome.skipped;
        info!(
            diffs = step.diffs,
            applied = step.patches_applied,
            skipped = step.patches_skipped,
            "refinement applied"
        );
        (step, outcome.model)
    }
}

/// The fixed probe plan: captured GET endpoints with a 2xx body in key order,
/// capped at the probe limit, then every configured extra probe.
pub fn probe_plan(model: &SchemaModel, config: &RunConfig) -> Vec<PlannedProbe> {
    let mut plan: Vec<PlannedProbe> = expected_responses(model)
        .into_iter()
        .filter(|(key, _)| key.method == "GET")
        .take(config.probe.limit)
        .map(|(key, expected)| {
            let path = model
                .endpoints
                .get(&key)
                .and_then(|r| r.example_path.clone())
                .unwrap_or_else(|| fill_placeholders(&key.path));
            PlannedProbe {
                method: key.method.clone(),
                path,
                body: None,
                expected: Some(expected),
                endpoint: key,
            }
        })
        .collect();

    plan.extend(config.probe.extra.iter().map(|extra| PlannedProbe {
        endpoint: EndpointKey::new(&extra.method, &extra.path),
        method: extra.method.to_ascii_uppercase(),
        path: extra.path.clone(),
        body: extra.body.clone(),
        expected: extra.expected.clone(),
    }));
    plan
}

/// Substitute stable sample values for path placeholders.
pub fn fill_placeholders(path: &str) -> String {
    path.split('/')
        .map(|seg| match seg {
            "{id}" => "1",
            "{uuid}" => "00000000-0000-0000-0000-000000000001",
            "{gid}" => "100000000000001",
            other => other,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Score one probe response.
pub fn score_probe(
    expected: Option<&Value>,
    response: &ProbeResponse,
    volatile: &BTreeSet<String>,
) -> f64 {
    if !response.is_success() {
        return 0.0;
    }
    match (expected, response.body.as_ref()) {
        (None, _) => 0.5,
        (Some(_), None) => 0.0,
        (Some(expected), Some(actual)) => quality_score(expected, actual, volatile),
    }
}

fn average_quality(outcomes: &[ProbeOutcome]) -> f64 {
    if outcomes.is_empty() {
        return 0.0;
    }
    outcomes.iter().map(|o| o.score).sum::<f64>() / outcomes.len() as f64
}

fn build_report(history: &[IterationRecord], converged: bool) -> FinalReport {
    let trajectory: Vec<QualityPoint> = history
        .iter()
        .map(|r| QualityPoint {
            iteration: r.iteration,
            quality: r.quality,
        })
        .collect();
    let qualities: Vec<f64> = trajectory.iter().map(|p| p.quality).collect();
    FinalReport {
        total_iterations: history.len() as u32,
        converged,
        stop_reason: if converged {
            StopReason::Converged
        } else {
            StopReason::IterationLimitReached
        },
        final_quality: qualities.last().copied().unwrap_or(0.0),
        trend: quality_trend(&qualities),
        trajectory,
    }
}

/// Classify a quality series with a least-squares fit over iteration index.
pub fn quality_trend(qualities: &[f64]) -> QualityTrend {
    if qualities.len() < 3 {
        return QualityTrend::InsufficientData;
    }
    let n = qualities.len() as f64;
    let x: Vec<f64> = (0..qualities.len()).map(|i| i as f64).collect();

    // Least squares: slope = (n*Σxy - Σx*Σy) / (n*Σx² - (Σx)²)
    let sum_x: f64 = x.iter().sum();
    let sum_y: f64 = qualities.iter().sum();
    let sum_xy: f64 = x.iter().zip(qualities).map(|(xi, yi)| xi * yi).sum();
    let sum_x2: f64 = x.iter().map(|xi| xi * xi).sum();
    let denom = n * sum_x2 - sum_x * sum_x;
    let slope = (n * sum_xy - sum_x * sum_y) / denom;
    let intercept = (sum_y - slope * sum_x) / n;

    let y_mean = sum_y / n;
    let ss_tot: f64 = qualities.iter().map(|yi| (yi - y_mean).powi(2)).sum();
    let ss_res: f64 = x
        .iter()
        .zip(qualities)
        .map(|(xi, yi)| (yi - (slope * xi + intercept)).powi(2))
        .sum();
    let r_squared = if ss_tot > 0.0 {
        1.0 - ss_res / ss_tot
    } else {
        0.0
    };

    if slope.abs() < 0.01 || r_squared < 0.3 {
        QualityTrend::Plateau
    } else if slope > 0.0 {
        QualityTrend::Improving
    } else {
        QualityTrend::Regressing
    }
}

fn save_history(
    path: &std::path::Path,
    iterations: &[IterationRecord],
    report: &FinalReport,
) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(&History { iterations, report })?;
    std::fs::write(path, json)?;
    Ok(())
}
