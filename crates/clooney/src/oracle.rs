//! Optional inference oracle.
//!
//! The oracle is a best-effort enrichment: every caller treats an error, a
//! disabled oracle, and an unusable answer the same way and falls back to the
//! deterministic path. One instance is built per process and passed down
//! explicitly.

use crate::error::OracleError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

/// Default model for [`GeminiOracle`].
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash-exp";
/// Public Gemini REST endpoint.
pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// What the oracle is being asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OracleTask {
    SchemaInference,
    EndpointInference,
    PatchInference,
}

/// One oracle question: instructions plus structured context.
#[derive(Debug, Clone, Serialize)]
pub struct OracleRequest {
    pub task: OracleTask,
    pub prompt: String,
    pub context: Value,
}

impl OracleRequest {
    /// Prompt text with the context appended as pretty JSON.
    pub fn render(&self) -> String {
        let context = serde_json::to_string_pretty(&self.context).unwrap_or_default();
        format!(
            "{}\n\nContext:\n{context}\n\nRespond with valid JSON only, no prose.",
            self.prompt
        )
    }
}

/// Structured inference backend.
#[async_trait]
pub trait Oracle: Send + Sync {
    fn name(&self) -> &str;

    fn is_enabled(&self) -> bool {
        true
    }

    /// Answer a request with a JSON value.
    async fn infer(&self, request: &OracleRequest) -> Result<Value, OracleError>;
}

/// Oracle that is never available.
pub struct DisabledOracle;

#[async_trait]
impl Oracle for DisabledOracle {
    fn name(&self) -> &str {
        "disabled"
    }

    fn is_enabled(&self) -> bool {
        false
    }

    async fn infer(&self, _request: &OracleRequest) -> Result<Value, OracleError> {
        Err(OracleError::Disabled)
    }
}

/// Connection settings for [`GeminiOracle`].
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub temperature: f32,
    pub timeout: Duration,
}

impl GeminiConfig {
    /// Read `GEMINI_API_KEY`, `GEMINI_MODEL`, and `GEMINI_BASE_URL`.
    /// Returns `None` when no API key is set.
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("GEMINI_API_KEY").ok().filter(|k| !k.is_empty())?;
        Some(Self {
            api_key,
            model: std::env::var("GEMINI_MODEL")
                .unwrap_or_else(|_| DEFAULT_GEMINI_MODEL.to_string()),
            base_url: std::env::var("GEMINI_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_GEMINI_BASE_URL.to_string()),
            temperature: 0.1,
            timeout: Duration::from_secs(60),
        })
    }
}

/// Gemini `generateContent` client.
pub struct GeminiOracle {
    client: reqwest::Client,
    config: GeminiConfig,
}

impl GeminiOracle {
    pub fn new(config: GeminiConfig) -> Result<Self, OracleError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            self.config.model
        )
    }
}

#[async_trait]
impl Oracle for GeminiOracle {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn infer(&self, request: &OracleRequest) -> Result<Value, OracleError> {
        let body = json!({
            "contents": [{"parts": [{"text": request.render()}]}],
            "generationConfig": {
                "temperature": self.config.temperature,
                "responseMimeType": "application/json",
            },
        });
        debug!(task = ?request.task, model = %self.config.model, "calling gemini");

        let resp = self
            .client
            .post(self.endpoint())
            .query(&[("key", self.config.api_key.as_str())])
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(OracleError::Transport(format!("gemini returned HTTP {status}")));
        }
        let reply: Value = resp.json().await?;

        let text = reply
            .pointer("/candidates/0/content/parts/0/text")
            .and_then(Value::as_str)
            .ok_or_else(|| OracleError::Malformed("response carries no candidate text".into()))?;
        serde_json::from_str(strip_code_fences(text))
            .map_err(|e| OracleError::Malformed(format!("candidate is not JSON: {e}")))
    }
}

/// Remove a surrounding markdown code fence (```` ```json ... ``` ````).
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}
