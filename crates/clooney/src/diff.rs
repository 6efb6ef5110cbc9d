//! Structural comparison of expected and actual JSON responses.
//!
//! Both sides are first stripped of volatile keys. Objects are compared key by
//! key; arrays are compared as multisets so element order never produces a
//! difference on its own.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// A single difference, located by a dotted/bracketed path such as
/// `owner.email`, `tags[0]`, or `[1].name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<Value>,
}

/// Differences between an expected and an actual value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffReport {
    /// Present only in the actual value.
    pub added: Vec<DiffEntry>,
    /// Present only in the expected value.
    pub removed: Vec<DiffEntry>,
    /// Same type, different scalar value.
    pub value_changed: Vec<DiffEntry>,
    /// Different JSON type.
    pub type_changed: Vec<DiffEntry>,
}

impl DiffReport {
    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len() + self.value_changed.len() + self.type_changed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// JSON type name, matching the names used by inferred schemas.
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Recursively drop volatile keys at every nesting level, including inside
/// objects held by arrays.
pub fn normalize(value: &Value, volatile: &BTreeSet<String>) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !volatile.contains(k.as_str()))
                .map(|(k, v)| (k.clone(), normalize(v, volatile)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|v| normalize(v, volatile)).collect()),
        other => other.clone(),
    }
}

/// Compare two (already normalized) values.
pub fn diff(expected: &Value, actual: &Value) -> DiffReport {
    let mut report = DiffReport::default();
    walk("", expected, actual, &mut report);
    report
}

fn key_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{parent}.{key}")
    }
}

fn walk(path: &str, expected: &Value, actual: &Value, report: &mut DiffReport) {
    match (expected, actual) {
        (Value::Object(e), Value::Object(a)) => {
            for (key, ev) in e {
                match a.get(key) {
                    Some(av) => walk(&key_path(path, key), ev, av, report),
                    None => report.removed.push(DiffEntry {
                        path: key_path(path, key),
                        expected: Some(ev.clone()),
                        actual: None,
                    }),
                }
            }
            for (key, av) in a.iter().filter(|(k, _)| !e.contains_key(k.as_str())) {
                report.added.push(DiffEntry {
                    path: key_path(path, key),
                    expected: None,
                    actual: Some(av.clone()),
                });
            }
        }
        (Value::Array(e), Value::Array(a)) => walk_arrays(path, e, a, report),
        (e, a) if json_type_name(e) != json_type_name(a) => report.type_changed.push(DiffEntry {
            path: path.to_string(),
            expected: Some(e.clone()),
            actual: Some(a.clone()),
        }),
        (e, a) if e != a => report.value_changed.push(DiffEntry {
            path: path.to_string(),
            expected: Some(e.clone()),
            actual: Some(a.clone()),
        }),
        _ => {}
    }
}

/// Multiset comparison: equal elements cancel out, the leftovers are paired
/// in canonical order and compared recursively, and any surplus on either
/// side is reported as removed or added.
fn walk_arrays(path: &str, expected: &[Value], actual: &[Value], report: &mut DiffReport) {
    let mut unmatched_actual: Vec<(usize, String)> = actual
        .iter()
        .enumerate()
        .map(|(i, v)| (i, canonical(v)))
        .collect();
    let mut unmatched_expected: Vec<(usize, String)> = Vec::new();

    for (i, ev) in expected.iter().enumerate() {
        let form = canonical(ev);
        match unmatched_actual.iter().position(|(_, f)| *f == form) {
            Some(pos) => {
                unmatched_actual.remove(pos);
            }
            None => unmatched_expected.push((i, form)),
        }
    }

    unmatched_expected.sort_by(|a, b| a.1.cmp(&b.1));
    unmatched_actual.sort_by(|a, b| a.1.cmp(&b.1));

    let paired = unmatched_expected.len().min(unmatched_actual.len());
    for ((ei, _), (ai, _)) in unmatched_expected.iter().zip(&unmatched_actual) {
        walk(&format!("{path}[{ei}]"), &expected[*ei], &actual[*ai], report);
    }
    for (ei, _) in &unmatched_expected[paired..] {
        report.removed.push(DiffEntry {
            path: format!("{path}[{ei}]"),
            expected: Some(expected[*ei].clone()),
            actual: None,
        });
    }
    for (ai, _) in &unmatched_actual[paired..] {
        report.added.push(DiffEntry {
            path: format!("{path}[{ai}]"),
            expected: None,
            actual: Some(actual[*ai].clone()),
        });
    }
}

/// Order-independent textual form: object keys sorted, arrays sorted by
/// their elements' canonical forms.
fn canonical(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, String)> =
                map.iter().map(|(k, v)| (k, canonical(v))).collect();
            entries.sort();
            let body: Vec<String> = entries
                .into_iter()
                .map(|(k, v)| format!("{}:{v}", Value::String(k.clone())))
                .collect();
            format!("{{{}}}", body.join(","))
        }
        Value::Array(items) => {
            let mut forms: Vec<String> = items.iter().map(canonical).collect();
            forms.sort();
            format!("[{}]", forms.join(","))
        }
        other => other.to_string(),
    }
}

/// Number of leaf values in a document. Scalars count once, as do empty
/// containers.
pub fn leaf_count(value: &Value) -> usize {
    match value {
        Value::Object(map) if !map.is_empty() => map.values().map(leaf_count).sum(),
        Value::Array(items) if !items.is_empty() => items.iter().map(leaf_count).sum(),
        _ => 1,
    }
}

/// Score in `[0, 1]`: one minus the share of differing entries relative to
/// the expected document's leaves, after volatile keys are stripped.
pub fn quality_score(expected: &Value, actual: &Value, volatile: &BTreeSet<String>) -> f64 {
    let expected = normalize(expected, volatile);
    let actual = normalize(actual, volatile);
    score_report(&diff(&expected, &actual), &expected)
}

/// Score a precomputed report against its normalized expected document.
pub fn score_report(report: &DiffReport, expected: &Value) -> f64 {
    let leaves = leaf_count(expected).max(1) as f64;
    (1.0 - report.len() as f64 / leaves).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::DEFAULT_VOLATILE_FIELDS;
    use serde_json::json;

    fn volatile() -> BTreeSet<String> {
        DEFAULT_VOLATILE_FIELDS.iter().map(|s| s.to_string()).collect()
    }

    fn paths(entries: &[DiffEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.path.as_str()).collect()
    }

    #[test]
    fn test_added_means_only_in_actual() {
        let report = diff(&json!({"name": "A"}), &json!({"name": "A", "extra": 1}));
        assert_eq!(paths(&report.added), vec!["extra"]);
        assert!(report.removed.is_empty());
        assert_eq!(report.added[0].actual, Some(json!(1)));
    }

    #[test]
    fn test_removed_means_only_in_expected() {
        let report = diff(&json!({"name": "A", "extra": 1}), &json!({"name": "A"}));
        assert_eq!(paths(&report.removed), vec!["extra"]);
        assert!(report.added.is_empty());
        assert_eq!(report.removed[0].expected, Some(json!(1)));
    }

    #[test]
    fn test_value_and_type_changes_with_paths() {
        let report = diff(
            &json!({"owner": {"email": "a@x.io", "age": 3}, "done": false}),
            &json!({"owner": {"email": "b@x.io", "age": "3"}, "done": false}),
        );
        assert_eq!(paths(&report.value_changed), vec!["owner.email"]);
        assert_eq!(paths(&report.type_changed), vec!["owner.age"]);
        assert_eq!(report.len(), 2);
    }

    #[test]
    fn test_array_order_ignored() {
        let report = diff(
            &json!({"tags": ["a", "b", {"k": 1, "j": [2, 1]}]}),
            &json!({"tags": [{"j": [1, 2], "k": 1}, "b", "a"]}),
        );
        assert!(report.is_empty(), "{report:?}");
    }

    #[test]
    fn test_array_leftovers_are_compared() {
        let report = diff(
            &json!([{"name": "a"}, {"name": "b"}]),
            &json!([{"name": "b"}, {"name": "c"}, {"name": "d"}]),
        );
        assert_eq!(paths(&report.value_changed), vec!["[0].name"]);
        assert_eq!(report.added.len(), 1);
        assert!(report.removed.is_empty());
    }

    #[test]
    fn test_normalize_strips_nested_volatile() {
        let value = json!({
            "id": "1",
            "items": [{"gid": "2", "name": "x", "created_at": "2024"}],
            "meta": {"updated_at": "t", "count": 1}
        });
        assert_eq!(
            normalize(&value, &volatile()),
            json!({"items": [{"name": "x"}], "meta": {"count": 1}})
        );
    }

    #[test]
    fn test_quality_boundaries() {
        let v = json!({"id": "a", "name": "x", "list": [1, 2]});
        let mut reordered = v.clone();
        reordered["id"] = json!("b");
        reordered["list"] = json!([2, 1]);
        assert_eq!(quality_score(&v, &reordered, &volatile()), 1.0);
        assert_eq!(
            quality_score(&json!({"a": 1, "b": 2}), &json!({"c": 3, "d": 4}), &volatile()),
            0.0
        );
    }

    #[test]
    fn test_quality_partial() {
        let expected = json!({"a": 1, "b": 2, "c": 3, "d": 4});
        let actual = json!({"a": 1, "b": 2, "c": 3, "d": 5});
        assert!((quality_score(&expected, &actual, &BTreeSet::new()) - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_leaf_count() {
        assert_eq!(leaf_count(&json!({"a": 1, "b": {"c": [1, 2], "d": {}}})), 4);
        assert_eq!(leaf_count(&json!(null)), 1);
    }
}
