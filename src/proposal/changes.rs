//! Change operations
//!
//! A change set is an ordered list of typed operations on a JSON document,
//! addressed by dot paths (`cache.max_size_mb`). Operations are checked once
//! when a change set is built; applying them never has to guess at intent.

use crate::error::{validation_error, AppError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ChangeOp {
    /// Replace the value at `path`
    Set { path: String, value: Value },
    /// Add `delta` to the number at `path` (missing counts as 0)
    Increment { path: String, delta: f64 },
    /// Multiply the number at `path` by `factor` (missing counts as 1)
    Multiply { path: String, factor: f64 },
    /// Push onto the array at `path`, creating `[value]` if missing
    Append { path: String, value: Value },
}

impl ChangeOp {
    pub fn set(path: impl Into<String>, value: impl Into<Value>) -> Self {
        ChangeOp::Set { path: path.into(), value: value.into() }
    }

    pub fn increment(path: impl Into<String>, delta: f64) -> Self {
        ChangeOp::Increment { path: path.into(), delta }
    }

    pub fn multiply(path: impl Into<String>, factor: f64) -> Self {
        ChangeOp::Multiply { path: path.into(), factor }
    }

    pub fn append(path: impl Into<String>, value: impl Into<Value>) -> Self {
        ChangeOp::Append { path: path.into(), value: value.into() }
    }

    pub fn path(&self) -> &str {
        match self {
            ChangeOp::Set { path, .. }
            | ChangeOp::Increment { path, .. }
            | ChangeOp::Multiply { path, .. }
            | ChangeOp::Append { path, .. } => path,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ChangeOp::Set { path, value } => format!("set {} = {}", path, value),
            ChangeOp::Increment { path, delta } => format!("increment {} by {}", path, delta),
            ChangeOp::Multiply { path, factor } => format!("multiply {} by {}", path, factor),
            ChangeOp::Append { path, value } => format!("append {} to {}", value, path),
        }
    }

    fn check(&self) -> Result<(), AppError> {
        let path = self.path();
        if path.is_empty() || path.split('.').any(|seg| seg.trim().is_empty()) {
            return Err(validation_error(format!("Invalid change path '{}'", path)));
        }
        match self {
            ChangeOp::Increment { delta, .. } if !delta.is_finite() => Err(validation_error(
                format!("Increment delta for '{}' must be finite", path),
            )),
            ChangeOp::Multiply { factor, .. } if !factor.is_finite() => Err(validation_error(
                format!("Multiply factor for '{}' must be finite", path),
            )),
            _ => Ok(()),
        }
    }

    /// Apply this operation to `doc` in place
    pub fn apply_to(&self, doc: &mut Value) -> Result<(), AppError> {
        let path = self.path();
        let (parent, leaf) = parent_of(doc, path)?;
        match self {
            ChangeOp::Set { value, .. } => {
                parent.insert(leaf.to_string(), value.clone());
            }
            ChangeOp::Increment { delta, .. } => {
                let updated = arithmetic(parent.get(leaf), path, 0.0, |base| base + delta)?;
                parent.insert(leaf.to_string(), updated);
            }
            ChangeOp::Multiply { factor, .. } => {
                let updated = arithmetic(parent.get(leaf), path, 1.0, |base| base * factor)?;
                parent.insert(leaf.to_string(), updated);
            }
            ChangeOp::Append { value, .. } => {
                match parent.get_mut(leaf) {
                    Some(Value::Array(items)) => {
                        items.push(value.clone());
                        return Ok(());
                    }
                    None | Some(Value::Null) => {}
                    Some(other) => {
                        return Err(validation_error(format!(
                            "Cannot append to '{}': existing value {} is not a list",
                            path, other
                        )))
                    }
                }
                parent.insert(leaf.to_string(), Value::Array(vec![value.clone()]));
            }
        }
        Ok(())
    }
}

/// Walk to the object holding the final path segment, creating objects on the way
fn parent_of<'a, 'p>(
    doc: &'a mut Value,
    path: &'p str,
) -> Result<(&'a mut Map<String, Value>, &'p str), AppError> {
    let mut segments: Vec<&str> = path.split('.').collect();
    let leaf = segments
        .pop()
        .ok_or_else(|| validation_error("Empty change path"))?;

    let mut current = doc
        .as_object_mut()
        .ok_or_else(|| validation_error("Document root is not a JSON object"))?;
    for seg in segments {
        let next = current
            .entry(seg.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        current = next.as_object_mut().ok_or_else(|| {
            validation_error(format!("'{}' in path '{}' is not an object", seg, path))
        })?;
    }
    Ok((current, leaf))
}

fn arithmetic(
    existing: Option<&Value>,
    path: &str,
    default: f64,
    op: impl Fn(f64) -> f64,
) -> Result<Value, AppError> {
    let (base, integral) = match existing {
        None | Some(Value::Null) => (default, true),
        Some(Value::Number(n)) => {
            let integral = n.is_i64() || n.is_u64();
            let base = n.as_f64().ok_or_else(|| {
                validation_error(format!("Value at '{}' is not representable", path))
            })?;
            (base, integral)
        }
        Some(other) => {
            return Err(validation_error(format!(
                "Cannot do arithmetic on '{}': existing value {} is not a number",
                path, other
            )))
        }
    };

    let result = op(base);
    if integral && result.fract() == 0.0 && result.abs() < 9.0e15 {
        return Ok(Value::from(result as i64));
    }
    Number::from_f64(result)
        .map(Value::Number)
        .ok_or_else(|| validation_error(format!("Result at '{}' is not a finite number", path)))
}

/// Check every operation in a change set
pub fn validate_change_set(ops: &[ChangeOp]) -> Result<(), AppError> {
    ops.iter().try_for_each(ChangeOp::check)
}

/// Apply a change set to a copy of `doc`; the original is never modified
pub fn apply_change_set(doc: &Value, ops: &[ChangeOp]) -> Result<Value, AppError> {
    let mut working = doc.clone();
    for op in ops {
        op.apply_to(&mut working)?;
    }
    Ok(working)
}

/// Stable hash over category, title and change set
pub fn dedup_hash(category: &str, title: &str, ops: &[ChangeOp]) -> String {
    let canonical = serde_json::to_value(ops)
        .map(|value| sort_keys(value).to_string())
        .unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(category.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(title.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Maps keep insertion order, so hash input needs its keys sorted
fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(entries.into_iter().map(|(k, v)| (k, sort_keys(v))).collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

/// Change sets as they arrive over the API: either typed operations, or the
/// legacy map form `{"a.b": value}` / `{"a.b": {"_operation": "increment", "value": 5}}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ChangeSetInput {
    Ops(Vec<ChangeOp>),
    Legacy(Map<String, Value>),
}

impl ChangeSetInput {
    /// Convert to typed operations and validate them
    pub fn into_ops(self) -> Result<Vec<ChangeOp>, AppError> {
        let ops = match self {
            ChangeSetInput::Ops(ops) => ops,
            ChangeSetInput::Legacy(map) => map
                .into_iter()
                .map(|(path, value)| legacy_op(path, value))
                .collect::<Result<Vec<_>, _>>()?,
        };
        validate_change_set(&ops)?;
        Ok(ops)
    }
}

fn legacy_op(path: String, value: Value) -> Result<ChangeOp, AppError> {
    let operation = value
        .as_object()
        .and_then(|obj| obj.get("_operation"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let Some(operation) = operation else {
        return Ok(ChangeOp::Set { path, value });
    };
    let operand = value.get("value").cloned().unwrap_or(Value::Null);

    match operation.as_str() {
        "set" => Ok(ChangeOp::Set { path, value: operand }),
        "increment" => {
            let delta = numeric_operand(&operand, "increment", &path)?;
            Ok(ChangeOp::Increment { path, delta })
        }
        "multiply" => {
            let factor = numeric_operand(&operand, "multiply", &path)?;
            Ok(ChangeOp::Multiply { path, factor })
        }
        "append" => Ok(ChangeOp::Append { path, value: operand }),
        other => Err(validation_error(format!(
            "Unknown operation '{}' on '{}'",
            other, path
        ))),
    }
}

fn numeric_operand(operand: &Value, what: &str, path: &str) -> Result<f64, AppError> {
    operand
        .as_f64()
        .ok_or_else(|| validation_error(format!("'{}' on '{}' needs a numeric value", what, path)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_set_creates_intermediate_objects() {
        let doc = json!({});
        let out = apply_change_set(&doc, &[ChangeOp::set("cache.limits.max_size_mb", 200)]).unwrap();
        assert_eq!(out, json!({"cache": {"limits": {"max_size_mb": 200}}}));
        assert_eq!(doc, json!({}));
    }

    #[test]
    fn test_increment_defaults_to_zero() {
        let out = apply_change_set(&json!({}), &[ChangeOp::increment("a.count", 5.0)]).unwrap();
        assert_eq!(out, json!({"a": {"count": 5}}));
    }

    #[test]
    fn test_multiply_defaults_to_one_and_keeps_integers() {
        let out = apply_change_set(&json!({}), &[ChangeOp::multiply("x", 3.0)]).unwrap();
        assert_eq!(out, json!({"x": 3}));

        let out = apply_change_set(&json!({"t": 10}), &[ChangeOp::multiply("t", 1.2)]).unwrap();
        assert_eq!(out, json!({"t": 12}));

        let out = apply_change_set(&json!({"t": 5}), &[ChangeOp::multiply("t", 0.5)]).unwrap();
        assert_eq!(out, json!({"t": 2.5}));
    }

    #[test]
    fn test_append_initializes_list() {
        let ops = [ChangeOp::append("rules.muted", "a"), ChangeOp::append("rules.muted", "b")];
        let out = apply_change_set(&json!({}), &ops).unwrap();
        assert_eq!(out, json!({"rules": {"muted": ["a", "b"]}}));
    }

    #[test]
    fn test_type_mismatches_are_validation_errors() {
        let doc = json!({"a": "text", "b": {"c": 1}, "d": 5});
        assert!(matches!(
            apply_change_set(&doc, &[ChangeOp::increment("a", 1.0)]),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            apply_change_set(&doc, &[ChangeOp::set("d.e", 1)]),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            apply_change_set(&doc, &[ChangeOp::append("d", 1)]),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            apply_change_set(&json!([1, 2]), &[ChangeOp::set("x", 1)]),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_invalid_paths_rejected() {
        assert!(validate_change_set(&[ChangeOp::set("", 1)]).is_err());
        assert!(validate_change_set(&[ChangeOp::set("a..b", 1)]).is_err());
        assert!(validate_change_set(&[ChangeOp::multiply("a", f64::NAN)]).is_err());
        assert!(validate_change_set(&[ChangeOp::set("a.b", 1)]).is_ok());
    }

    #[test]
    fn test_legacy_encoding_converted() {
        let input: ChangeSetInput = serde_json::from_value(json!({
            "cache.ttl_hours": 12,
            "thresholds.count": {"_operation": "increment", "value": 2},
            "alert_rules.muted": {"_operation": "append", "value": "x"}
        }))
        .unwrap();
        let ops = input.into_ops().unwrap();
        assert!(ops.contains(&ChangeOp::set("cache.ttl_hours", 12)));
        assert!(ops.contains(&ChangeOp::increment("thresholds.count", 2.0)));
        assert!(ops.contains(&ChangeOp::append("alert_rules.muted", "x")));
    }

    #[test]
    fn test_legacy_encoding_keeps_submission_order() {
        let input: ChangeSetInput =
            serde_json::from_str(r#"{"cache.ttl_hours": 5, "cache": {"max_size_mb": 10}}"#).unwrap();
        let ops = input.into_ops().unwrap();
        assert_eq!(
            ops,
            vec![
                ChangeOp::set("cache.ttl_hours", 5),
                ChangeOp::set("cache", json!({"max_size_mb": 10})),
            ]
        );
        let doc = apply_change_set(&json!({}), &ops).unwrap();
        assert_eq!(doc, json!({"cache": {"max_size_mb": 10}}));
    }

    #[test]
    fn test_legacy_unknown_operation_rejected() {
        let input: ChangeSetInput =
            serde_json::from_value(json!({"a": {"_operation": "divide", "value": 2}})).unwrap();
        assert!(matches!(input.into_ops(), Err(AppError::Validation(_))));
    }

    #[test]
    fn test_typed_encoding_parsed() {
        let input: ChangeSetInput =
            serde_json::from_value(json!([{"op": "multiply", "path": "a", "factor": 2.0}])).unwrap();
        assert_eq!(input.into_ops().unwrap(), vec![ChangeOp::multiply("a", 2.0)]);
    }

    #[test]
    fn test_dedup_hash_is_stable_and_sensitive() {
        let ops = vec![ChangeOp::set("a", json!({"y": 1, "x": 2}))];
        let h1 = dedup_hash("cache_tuning", "t", &ops);
        let h2 = dedup_hash("cache_tuning", "t", &ops.clone());
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert_ne!(h1, dedup_hash("cache_tuning", "other", &ops));
        assert_ne!(h1, dedup_hash("perf_tuning", "t", &ops));

        let reordered = vec![ChangeOp::set("a", json!({"x": 2, "y": 1}))];
        assert_eq!(h1, dedup_hash("cache_tuning", "t", &reordered));
    }
}
