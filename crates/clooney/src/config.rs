//! Run configuration loading and resolution.
//!
//! Resolution order: an explicit config file, then the file named by
//! `CLOONEY_CONFIG`, then `./clooney.json` if present, then built-in defaults.
//! `CLOONEY_*` environment variables are applied on top of whichever was used.

use crate::error::{ClooneyError, Result};
use crate::normalize::ClassifierConfig;
use crate::schema::{InferenceOptions, DEFAULT_VOLATILE_FIELDS};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "clooney.json";

/// A request issued in addition to the generated probe plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeSpec {
    pub method: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    /// Expected response body. Without one a 2xx scores 0.5.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub base_url: String,
    pub timeout_ms: u64,
    /// Maximum number of captured GET endpoints probed per iteration.
    pub limit: usize,
    pub extra: Vec<ProbeSpec>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            timeout_ms: 5000,
            limit: 5,
            extra: Vec::new(),
        }
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    /// Use the Gemini oracle when `GEMINI_API_KEY` is set.
    pub enabled: bool,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Everything one pipeline run needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub capture_path: Option<PathBuf>,
    pub model_path: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub history_path: Option<PathBuf>,
    pub max_iterations: u32,
    pub quality_threshold: f64,
    pub probe: ProbeConfig,
    pub volatile_fields: Vec<String>,
    pub classifier: ClassifierConfig,
    pub oracle: OracleConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            capture_path: None,
            model_path: None,
            output_dir: None,
            history_path: None,
            max_iterations: 10,
            quality_threshold: 0.95,
            probe: ProbeConfig::default(),
            volatile_fields: DEFAULT_VOLATILE_FIELDS.iter().map(|s| s.to_string()).collect(),
            classifier: ClassifierConfig::default(),
            oracle: OracleConfig::default(),
        }
    }
}

impl RunConfig {
    /// Resolve the configuration for this process.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let file = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => std::env::var("CLOONEY_CONFIG")
                .ok()
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .or_else(|| {
                    let local = PathBuf::from(LOCAL_CONFIG_FILE);
                    local.exists().then_some(local)
                }),
        };

        let mut config = match file {
            Some(path) => {
                debug!(path = %path.display(), "loading run config");
                Self::load(&path)?
            }
            None => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Read a config file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ClooneyError::Config(format!("cannot read config {}: {e}", path.display()))
        })?;
        serde_json::from_str(&text)
            .map_err(|e| ClooneyError::Config(format!("invalid config {}: {e}", path.display())))
    }

    /// Apply `CLOONEY_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());

        if let Some(v) = get("CLOONEY_CAPTURE") {
            self.capture_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("CLOONEY_MODEL") {
            self.model_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("CLOONEY_OUTPUT_DIR") {
            self.output_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = get("CLOONEY_HISTORY") {
            self.history_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("CLOONEY_MAX_ITERATIONS") {
            self.max_iterations = parse_env("CLOONEY_MAX_ITERATIONS", &v)?;
        }
        if let Some(v) = get("CLOONEY_THRESHOLD") {
            self.quality_threshold = parse_env("CLOONEY_THRESHOLD", &v)?;
        }
        if let Some(v) = get("CLOONEY_BASE_URL") {
            self.probe.base_url = v;
        }
        if let Some(v) = get("CLOONEY_PROBE_TIMEOUT_MS") {
            self.probe.timeout_ms = parse_env("CLOONEY_PROBE_TIMEOUT_MS", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.quality_threshold) {
            return Err(ClooneyError::Config(format!(
                "quality_threshold must be within [0, 1], got {}",
                self.quality_threshold
            )));
        }
        if self.probe.timeout_ms == 0 {
            return Err(ClooneyError::Config("probe timeout must be positive".into()));
        }
        Ok(())
    }

    pub fn volatile_set(&self) -> BTreeSet<String> {
        self.volatile_fields.iter().cloned().collect()
    }

    pub fn inference_options(&self) -> InferenceOptions {
        InferenceOptions {
            volatile_fields: self.volatile_set(),
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ClooneyError::Config(format!("{name}={value}: {e}")))
}
