//! Endpoint identity normalization.
//!
//! Maps raw captured URLs onto canonical [`EndpointKey`]s by collapsing
//! identifier-shaped path segments into typed placeholders, and decides which
//! captured messages are API traffic worth modeling at all.

use crate::capture::CapturedMessage;
use crate::error::{ClooneyError, Result};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use tracing::debug;
use url::Url;

/// URL patterns that always mark a request as API traffic.
const DEFAULT_ALLOW_PATTERNS: &[&str] = &[
    r"/api/",
    r"/-/api/",
    r"api/\d+\.\d+/",
    r"/api/v\d+/",
    r"graphql",
];

/// Substrings of known non-API destinations (analytics, ads, tag managers).
const DEFAULT_DENY_TERMS: &[&str] = &[
    "google-analytics.com",
    "googletagmanager.com",
    "googlesyndication.com",
    "googleadservices.com",
    "doubleclick",
    "facebook.net",
    "facebook.com/tr",
    "hotjar.com",
    "segment.com",
    "segment.io",
    "sentry.io",
    "newrelic.com",
    "nr-data.net",
    "fullstory.com",
    "mixpanel.com",
    "heapanalytics.com",
    "clarity.ms",
    "analytics",
    "tracking",
    "pixel",
];

const MUTATING_METHODS: &[&str] = &["POST", "PUT", "PATCH", "DELETE"];

/// Canonical identity of an endpoint: upper-cased method plus normalized path.
///
/// Displayed and persisted as `"METHOD /path"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointKey {
    pub method: String,
    pub path: String,
}

impl EndpointKey {
    /// Build a key from a method and a raw URL or path.
    pub fn new(method: &str, url_or_path: &str) -> Self {
        Self {
            method: method.trim().to_ascii_uppercase(),
            path: normalize_path(url_or_path),
        }
    }

    /// Path parameter names carried by this key.
    pub fn path_params(&self) -> BTreeSet<String> {
        path_params(&self.path)
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

impl FromStr for EndpointKey {
    type Err = ClooneyError;

    fn from_str(s: &str) -> Result<Self> {
        let (method, path) = s
            .trim()
            .split_once(' ')
            .ok_or_else(|| ClooneyError::InvalidKey(s.to_string()))?;
        if method.is_empty() || !path.trim_start().starts_with('/') {
            return Err(ClooneyError::InvalidKey(s.to_string()));
        }
        Ok(Self::new(method, path.trim()))
    }
}

impl Serialize for EndpointKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EndpointKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Extensions to the built-in classification lists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Extra allow-list regexes matched against the full URL.
    pub allow_patterns: Vec<String>,
    /// Extra deny-list substrings matched against the lower-cased URL.
    pub deny_terms: Vec<String>,
    /// Hosts whose JSON responses count as API traffic even off the allow-list.
    pub api_hosts: Vec<String>,
}

/// Decides whether a captured message is API traffic.
#[derive(Debug, Clone)]
pub struct Classifier {
    allow: Vec<Regex>,
    deny: Vec<String>,
    api_hosts: Vec<String>,
}

impl Classifier {
    /// Compile the built-in lists plus any configured extensions.
    pub fn new(config: &ClassifierConfig) -> Result<Self> {
        let mut allow = Vec::new();
        for pattern in DEFAULT_ALLOW_PATTERNS
            .iter()
            .copied()
            .chain(config.allow_patterns.iter().map(String::as_str))
        {
            let re = Regex::new(pattern).map_err(|e| {
                ClooneyError::Config(format!("invalid allow pattern '{pattern}': {e}"))
            })?;
            allow.push(re);
        }
        let deny = DEFAULT_DENY_TERMS
            .iter()
            .map(|t| t.to_string())
            .chain(config.deny_terms.iter().map(|t| t.to_ascii_lowercase()))
            .collect();
        let api_hosts = config
            .api_hosts
            .iter()
            .map(|h| h.to_ascii_lowercase())
            .collect();
        Ok(Self {
            allow,
            deny,
            api_hosts,
        })
    }

    /// Whether the message qualifies as API traffic.
    ///
    /// Allow-list matches always qualify. Otherwise the content fallback must
    /// pass and the URL must stay clear of the deny-list. Malformed URLs never
    /// qualify.
    pub fn classify(&self, message: &CapturedMessage) -> bool {
        let Some(url) = parse_url(&message.url) else {
            debug!(url = %message.url, "unparseable URL treated as non-API");
            return false;
        };
        let full = url.as_str();

        if self.allow.iter().any(|re| re.is_match(full)) {
            return true;
        }

        if !self.content_fallback(message, &url) {
            return false;
        }

        let lower = full.to_ascii_lowercase();
        if let Some(term) = self.deny.iter().find(|t| lower.contains(t.as_str())) {
            debug!(url = full, term = term.as_str(), "deny-list overrides content match");
            return false;
        }
        true
    }

    fn content_fallback(&self, message: &CapturedMessage, url: &Url) -> bool {
        let method = message.method.to_ascii_uppercase();
        if MUTATING_METHODS.contains(&method.as_str()) {
            let json_content_type = message
                .request_header("content-type")
                .is_some_and(|ct| ct.contains("json"));
            let json_body = matches!(
                message.request_body,
                Some(serde_json::Value::Object(_)) | Some(serde_json::Value::Array(_))
            );
            if json_content_type || json_body {
                return true;
            }
        }

        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
        let trusted = self.api_hosts.iter().any(|h| host == *h || host.ends_with(&format!(".{h}")));
        trusted
            && message
                .response_header("content-type")
                .is_some_and(|ct| ct.contains("application/json"))
    }
}

/// Parse an absolute URL, or a root-relative path against a dummy origin.
fn parse_url(raw: &str) -> Option<Url> {
    let raw = raw.trim();
    if raw.starts_with('/') {
        return base_url().join(raw).ok();
    }
    Url::parse(raw).ok()
}

fn base_url() -> &'static Url {
    static BASE: OnceLock<Url> = OnceLock::new();
    BASE.get_or_init(|| Url::parse("http://localhost/").expect("static base URL is valid"))
}

/// Normalize a raw URL or path into its canonical templated path.
///
/// Strips the query string and fragment and percent-decodes the rest, so an
/// absolute URL and a bare path name the same endpoint. Each segment is then
/// rewritten:
/// pure digits become `{id}`, canonical UUIDs become `{uuid}`, and hex runs of
/// 15 or more characters become `{gid}`. The UUID rule runs before the long-hex
/// rule so UUIDs keep their own placeholder.
pub fn normalize_path(url_or_path: &str) -> String {
    let raw = url_or_path.trim();
    let encoded = match Url::parse(raw) {
        Ok(url) if url.has_host() => url.path().to_string(),
        _ => {
            let end = raw.find(['?', '#']).unwrap_or(raw.len());
            raw[..end].to_string()
        }
    };
    // `Url` percent-encodes while parsing; relative paths arrive as written.
    let path = match urlencoding::decode(&encoded) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => encoded,
    };

    let normalized: Vec<&str> = path.split('/').map(normalize_segment).collect();
    let joined = normalized.join("/");
    if joined.is_empty() {
        "/".to_string()
    } else if joined.starts_with('/') {
        joined
    } else {
        format!("/{joined}")
    }
}

fn normalize_segment(segment: &str) -> &str {
    if !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit()) {
        "{id}"
    } else if is_uuid(segment) {
        "{uuid}"
    } else if segment.len() >= 15 && segment.bytes().all(|b| b.is_ascii_hexdigit()) {
        "{gid}"
    } else {
        segment
    }
}

/// Canonical 8-4-4-4-12 hexadecimal UUID.
pub(crate) fn is_uuid(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() == 36
        && bytes.iter().enumerate().all(|(i, b)| match i {
            8 | 13 | 18 | 23 => *b == b'-',
            _ => b.is_ascii_hexdigit(),
        })
}

/// Placeholder names present in a normalized path (`{id}` yields `id`).
pub fn path_params(path: &str) -> BTreeSet<String> {
    path.split('/')
        .filter_map(|seg| seg.strip_prefix('{').and_then(|s| s.strip_suffix('}')))
        .filter(|name| !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_'))
        .map(str::to_string)
        .collect()
}

/// Query parameter names present in a raw URL.
pub fn query_param_names(url_or_path: &str) -> BTreeSet<String> {
    parse_url(url_or_path)
        .map(|url| url.query_pairs().map(|(k, _)| k.into_owned()).collect())
        .unwrap_or_default()
}

/// Canonical key plus query parameter names, or `None` for malformed URLs.
pub fn endpoint_key(method: &str, url: &str) -> Option<(EndpointKey, BTreeSet<String>)> {
    let parsed = parse_url(url)?;
    let key = EndpointKey {
        method: method.trim().to_ascii_uppercase(),
        path: normalize_path(parsed.path()),
    };
    Some((key, query_param_names(url)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(method: &str, url: &str) -> CapturedMessage {
        CapturedMessage {
            method: method.into(),
            url: url.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_numeric_segments_collapse() {
        assert_eq!(
            normalize_path("https://app.example.com/api/1.0/tasks/1?opt_fields=name"),
            "/api/1.0/tasks/{id}"
        );
        assert_eq!(normalize_path("/users/42/posts/7"), "/users/{id}/posts/{id}");
    }

    #[test]
    fn test_uuid_before_long_hex() {
        assert_eq!(
            normalize_path("/things/123e4567-e89b-12d3-a456-426614174000"),
            "/things/{uuid}"
        );
        assert_eq!(normalize_path("/things/1a2b3c4d5e6f7a8b9c"), "/things/{gid}");
        // 14 hex chars stay literal
        assert_eq!(normalize_path("/things/abcdefabcdefab"), "/things/abcdefabcdefab");
    }

    #[test]
    fn test_absolute_and_relative_agree_on_non_ascii() {
        let absolute = normalize_path("https://app.example.com/api/caf\u{e9}/men\u{fc} items/3");
        let relative = normalize_path("/api/caf\u{e9}/men\u{fc} items/3");
        assert_eq!(absolute, relative);
        assert_eq!(relative, "/api/caf\u{e9}/men\u{fc} items/{id}");
        assert_eq!(normalize_path("/api/caf%C3%A9/1"), "/api/caf\u{e9}/{id}");
    }

    #[test]
    fn test_normalize_idempotent() {
        for raw in [
            "https://x.io/api/v1/projects/1203847561029384/tasks/55?limit=5#frag",
            "/a/123e4567-e89b-12d3-a456-426614174000/b",
            "/",
            "",
            "relative/9",
        ] {
            let once = normalize_path(raw);
            assert_eq!(normalize_path(&once), once, "input {raw}");
        }
    }

    #[test]
    fn test_path_params() {
        let params = path_params("/workspaces/{gid}/tasks/{id}");
        assert_eq!(params, BTreeSet::from(["gid".to_string(), "id".to_string()]));
        assert!(path_params("/plain/path").is_empty());
    }

    #[test]
    fn test_endpoint_key_display_and_parse() {
        let key = EndpointKey::new("get", "/api/1.0/tasks/1");
        assert_eq!(key.to_string(), "GET /api/1.0/tasks/{id}");
        let parsed: EndpointKey = "GET /api/1.0/tasks/{id}".parse().unwrap();
        assert_eq!(parsed, key);
        assert!("garbage".parse::<EndpointKey>().is_err());
    }

    #[test]
    fn test_endpoint_key_serde_as_string() {
        let key = EndpointKey::new("POST", "/api/tasks");
        let s = serde_json::to_string(&key).unwrap();
        assert_eq!(s, "\"POST /api/tasks\"");
        let back: EndpointKey = serde_json::from_str(&s).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn test_query_param_names() {
        let names = query_param_names("https://x.io/api/tasks?limit=5&opt_fields=a,b&limit=6");
        assert_eq!(names, BTreeSet::from(["limit".to_string(), "opt_fields".to_string()]));
    }

    #[test]
    fn test_allow_list_wins() {
        let c = Classifier::new(&ClassifierConfig::default()).unwrap();
        assert!(c.classify(&message("GET", "https://app.example.com/api/1.0/tasks")));
        assert!(c.classify(&message("GET", "https://x.io/graphql")));
        assert!(!c.classify(&message("GET", "https://x.io/static/app.js")));
    }

    #[test]
    fn test_content_fallback_and_deny_precedence() {
        let c = Classifier::new(&ClassifierConfig::default()).unwrap();
        let mut msg = message("POST", "https://x.io/rpc/save");
        msg.request_body = Some(json!({"name": "a"}));
        assert!(c.classify(&msg));

        let mut tracked = message("POST", "https://www.google-analytics.com/collect");
        tracked.request_body = Some(json!({"event": "view"}));
        assert!(!c.classify(&tracked));

        // GET without allow-list match or trusted host is ignored
        assert!(!c.classify(&message("GET", "https://x.io/rpc/load")));
    }

    #[test]
    fn test_trusted_host_json_response() {
        let c = Classifier::new(&ClassifierConfig {
            api_hosts: vec!["example.com".into()],
            ..Default::default()
        })
        .unwrap();
        let mut msg = message("GET", "https://app.example.com/rpc/load");
        msg.response_headers
            .insert("content-type".into(), "application/json; charset=utf-8".into());
        assert!(c.classify(&msg));
    }

    #[test]
    fn test_malformed_url_is_not_api() {
        let c = Classifier::new(&ClassifierConfig::default()).unwrap();
        let mut msg = message("POST", "ht!tp://::bad url");
        msg.request_body = Some(json!({"a": 1}));
        assert!(!c.classify(&msg));
        assert!(endpoint_key("GET", "not a url").is_none());
    }

    #[test]
    fn test_invalid_configured_pattern() {
        let err = Classifier::new(&ClassifierConfig {
            allow_patterns: vec!["(".into()],
            ..Default::default()
        });
        assert!(matches!(err, Err(ClooneyError::Config(_))));
    }
}
