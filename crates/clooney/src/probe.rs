//! Probing the live generated server.
//!
//! A probe never fails with an error: timeouts, connection failures and
//! undecodable bodies all come back as a [`ProbeResponse`] so the loop can
//! score them as missing data points.

use crate::capture::parse_body;
use crate::error::{ClooneyError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Outcome of one request. A failure has no status and carries an error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeResponse {
    pub status: Option<u16>,
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProbeResponse {
    pub fn ok(status: u16, body: Option<Value>) -> Self {
        Self {
            status: Some(status),
            body,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            status: None,
            body: None,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_some_and(|s| (200..300).contains(&s))
    }
}

/// Something that answers HTTP-like requests.
#[async_trait]
pub trait ProbeTarget: Send + Sync {
    async fn request(&self, method: &str, path: &str, body: Option<&Value>) -> ProbeResponse;
}

/// [`ProbeTarget`] backed by reqwest against a base URL.
pub struct HttpProbe {
    client: reqwest::Client,
    base_url: String,
}

impl HttpProbe {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClooneyError::Config(format!("cannot build probe client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}/{path}", self.base_url)
        }
    }
}

#[async_trait]
impl ProbeTarget for HttpProbe {
    async fn request(&self, method: &str, path: &str, body: Option<&Value>) -> ProbeResponse {
        let method = match reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes()) {
            Ok(m) => m,
            Err(e) => return ProbeResponse::failure(format!("invalid method '{method}': {e}")),
        };
        let url = self.url(path);
        let mut builder = self.client.request(method.clone(), &url);
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let resp = match builder.send().await {
            Ok(resp) => resp,
            Err(e) => {
                debug!(%method, url = %url, "probe failed: {e}");
                return ProbeResponse::failure(e.to_string());
            }
        };
        let status = resp.status().as_u16();
        match resp.text().await {
            Ok(text) => ProbeResponse::ok(status, parse_body(&text)),
            Err(e) => ProbeResponse {
                status: Some(status),
                body: None,
                error: Some(format!("unreadable body: {e}")),
            },
        }
    }
}
