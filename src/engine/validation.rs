//! Configuration validation
//!
//! Two passes over the document a change would produce: declared schema
//! rules (types and ranges per field), then business rules that encode
//! operational limits. Resources without a declared schema only need to be
//! JSON objects.

use crate::error::{validation_error, AppError};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static SCHEDULE_TIME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-2][0-9]:[0-5][0-9]$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq)]
enum FieldKind {
    Number,
    Integer,
    Text,
}

#[derive(Debug, Clone)]
struct FieldRule {
    path: &'static str,
    kind: FieldKind,
    min: Option<f64>,
    max: Option<f64>,
    pattern: Option<&'static Lazy<Regex>>,
}

impl FieldRule {
    fn number(path: &'static str, min: f64, max: f64) -> Self {
        Self { path, kind: FieldKind::Number, min: Some(min), max: Some(max), pattern: None }
    }

    fn integer(path: &'static str, min: f64, max: f64) -> Self {
        Self { path, kind: FieldKind::Integer, min: Some(min), max: Some(max), pattern: None }
    }

    fn text(path: &'static str, pattern: Option<&'static Lazy<Regex>>) -> Self {
        Self { path, kind: FieldKind::Text, min: None, max: None, pattern }
    }

    fn check(&self, doc: &Value, errors: &mut Vec<String>) {
        let Some(value) = lookup(doc, self.path) else {
            return;
        };

        match self.kind {
            FieldKind::Number | FieldKind::Integer => {
                let Some(n) = value.as_f64() else {
                    errors.push(format!("{} must be a number, got {}", self.path, value));
                    return;
                };
                if self.kind == FieldKind::Integer && n.fract() != 0.0 {
                    errors.push(format!("{} must be an integer, got {}", self.path, n));
                }
                if let Some(min) = self.min.filter(|min| n < *min) {
                    errors.push(format!("{} must be >= {}, got {}", self.path, min, n));
                }
                if let Some(max) = self.max.filter(|max| n > *max) {
                    errors.push(format!("{} must be <= {}, got {}", self.path, max, n));
                }
            }
            FieldKind::Text => {
                let Some(s) = value.as_str() else {
                    errors.push(format!("{} must be a string, got {}", self.path, value));
                    return;
                };
                if let Some(re) = self.pattern {
                    if !re.is_match(s) {
                        errors.push(format!("{} '{}' does not match {}", self.path, s, re.as_str()));
                    }
                }
            }
        }
    }
}

/// Limits the business rules are checked against
#[derive(Debug, Clone, Copy)]
pub struct BusinessLimits {
    pub max_cache_size_mb: f64,
}

type BusinessRule = fn(&Value, &BusinessLimits, &mut Vec<String>);

struct ResourceSchema {
    resource: &'static str,
    fields: Vec<FieldRule>,
    business: BusinessRule,
}

fn monitor_rules(doc: &Value, limits: &BusinessLimits, errors: &mut Vec<String>) {
    if let Some(size) = lookup(doc, "cache.max_size_mb").and_then(Value::as_f64) {
        if size > limits.max_cache_size_mb {
            errors.push(format!(
                "Cache size cannot exceed {}MB (got {})",
                limits.max_cache_size_mb, size
            ));
        }
    }
    if let Some(ttl) = lookup(doc, "cache.ttl_hours").and_then(Value::as_f64) {
        if ttl > 168.0 {
            errors.push(format!("Cache TTL cannot exceed 1 week (got {}h)", ttl));
        }
    }
}

fn alert_rules(doc: &Value, _: &BusinessLimits, errors: &mut Vec<String>) {
    if let Some(rt) = lookup(doc, "thresholds.max_response_time").and_then(Value::as_f64) {
        if rt < 1.0 {
            errors.push("Response time threshold must be at least 1 second".to_string());
        }
    }
    if let Some(tokens) = lookup(doc, "thresholds.max_tokens_per_request").and_then(Value::as_f64) {
        if tokens < 50.0 {
            errors.push("Token threshold must be at least 50".to_string());
        }
    }
}

fn report_rules(doc: &Value, _: &BusinessLimits, errors: &mut Vec<String>) {
    let Some(daily) = lookup(doc, "schedule.daily_report").and_then(Value::as_str) else {
        return;
    };
    let parsed = daily
        .split_once(':')
        .and_then(|(h, m)| Some((h.parse::<u32>().ok()?, m.parse::<u32>().ok()?)));
    match parsed {
        Some((hour, minute)) if hour <= 23 && minute <= 59 => {}
        _ => errors.push(format!("Daily report time '{}' is not a valid HH:MM time", daily)),
    }
}

fn builtin_schemas() -> Vec<ResourceSchema> {
    vec![
        ResourceSchema {
            resource: "monitoring/mcp_monitor_config.json",
            fields: vec![
                FieldRule::number("cache.max_size_mb", 1.0, 1000.0),
                FieldRule::number("cache.ttl_hours", 0.1, 168.0),
                FieldRule::number("performance.max_response_time", 1.0, 300.0),
                FieldRule::integer("performance.max_tokens_per_request", 50.0, 5000.0),
            ],
            business: monitor_rules,
        },
        ResourceSchema {
            resource: "monitoring/alert_config.json",
            fields: vec![
                FieldRule::number("thresholds.max_response_time", 1.0, 60.0),
                FieldRule::integer("thresholds.max_tokens_per_request", 100.0, 2000.0),
                FieldRule::number("thresholds.min_success_rate", 0.5, 1.0),
            ],
            business: alert_rules,
        },
        ResourceSchema {
            resource: "reports/report_config.json",
            fields: vec![
                FieldRule::text("schedule.daily_report", Some(&SCHEDULE_TIME)),
                FieldRule::text("schedule.weekly_report", None),
                FieldRule::text("schedule.monthly_report", None),
            ],
            business: report_rules,
        },
    ]
}

/// Resolve a dot path inside a document
pub fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |node, seg| node.get(seg))
}

pub struct ConfigValidator {
    schemas: Vec<ResourceSchema>,
    limits: BusinessLimits,
    schema_checks: bool,
    business_checks: bool,
}

impl ConfigValidator {
    /// `schema_checks` follows `validation.strict_mode`, `business_checks`
    /// follows `validation.business_logic_checks`
    pub fn new(limits: BusinessLimits, schema_checks: bool, business_checks: bool) -> Self {
        Self { schemas: builtin_schemas(), limits, schema_checks, business_checks }
    }

    pub fn has_schema(&self, resource: &str) -> bool {
        self.schema_for(resource).is_some()
    }

    fn schema_for(&self, resource: &str) -> Option<&ResourceSchema> {
        let resource = resource.trim_start_matches("./");
        self.schemas.iter().find(|s| s.resource == resource)
    }

    /// Schema pass then business pass; the first failing pass is reported
    pub fn validate(&self, resource: &str, doc: &Value) -> Result<(), AppError> {
        if !doc.is_object() {
            return Err(validation_error(format!("{} must be a JSON object", resource)));
        }
        let Some(schema) = self.schema_for(resource) else {
            return Ok(());
        };

        let mut errors = Vec::new();
        if self.schema_checks {
            for field in &schema.fields {
                field.check(doc, &mut errors);
            }
        }
        if !errors.is_empty() {
            return Err(validation_error(format!(
                "Schema validation failed for {}: {}",
                resource,
                errors.join("; ")
            )));
        }

        if self.business_checks {
            (schema.business)(doc, &self.limits, &mut errors);
            if !errors.is_empty() {
                return Err(validation_error(format!(
                    "Business rule validation failed for {}: {}",
                    resource,
                    errors.join("; ")
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validator() -> ConfigValidator {
        ConfigValidator::new(BusinessLimits { max_cache_size_mb: 500.0 }, true, true)
    }

    const MONITOR: &str = "monitoring/mcp_monitor_config.json";

    #[test]
    fn test_valid_monitor_config() {
        let doc = json!({"cache": {"max_size_mb": 150.0, "ttl_hours": 24}, "performance": {"max_tokens_per_request": 800}});
        assert!(validator().validate(MONITOR, &doc).is_ok());
    }

    #[test]
    fn test_schema_range_violation() {
        let doc = json!({"cache": {"max_size_mb": 2000}});
        let err = validator().validate(MONITOR, &doc).unwrap_err();
        assert!(err.to_string().contains("Schema validation failed"), "{}", err);
    }

    #[test]
    fn test_business_rule_violation_after_schema_passes() {
        // 800 is inside the schema range but above the operational limit
        let doc = json!({"cache": {"max_size_mb": 800}});
        let err = validator().validate(MONITOR, &doc).unwrap_err();
        assert!(err.to_string().contains("Business rule"), "{}", err);

        let lenient = ConfigValidator::new(BusinessLimits { max_cache_size_mb: 500.0 }, true, false);
        assert!(lenient.validate(MONITOR, &doc).is_ok());
    }

    #[test]
    fn test_schema_pass_can_be_disabled() {
        let relaxed = ConfigValidator::new(BusinessLimits { max_cache_size_mb: 5000.0 }, false, true);
        assert!(relaxed.validate(MONITOR, &json!({"cache": {"max_size_mb": 2000}})).is_ok());
    }

    #[test]
    fn test_integer_and_type_checks() {
        let doc = json!({"performance": {"max_tokens_per_request": 800.5}});
        assert!(validator().validate(MONITOR, &doc).is_err());
        let doc = json!({"performance": {"max_tokens_per_request": 800.0}});
        assert!(validator().validate(MONITOR, &doc).is_ok());
        let doc = json!({"cache": {"ttl_hours": "long"}});
        assert!(validator().validate(MONITOR, &doc).is_err());
    }

    #[test]
    fn test_report_schedule() {
        let resource = "reports/report_config.json";
        assert!(validator().validate(resource, &json!({"schedule": {"daily_report": "09:30"}})).is_ok());
        assert!(validator().validate(resource, &json!({"schedule": {"daily_report": "9:30"}})).is_err());
        // Passes the pattern but not the business rule
        let err = validator()
            .validate(resource, &json!({"schedule": {"daily_report": "25:00"}}))
            .unwrap_err();
        assert!(err.to_string().contains("Business rule"), "{}", err);
    }

    #[test]
    fn test_unknown_resource_must_be_object() {
        assert!(validator().validate("custom/thing.json", &json!({"anything": [1, 2]})).is_ok());
        assert!(validator().validate("custom/thing.json", &json!([1, 2])).is_err());
        assert!(!validator().has_schema("custom/thing.json"));
        assert!(validator().has_schema("./monitoring/alert_config.json"));
    }

    #[test]
    fn test_lookup() {
        let doc = json!({"a": {"b": {"c": 3}}});
        assert_eq!(lookup(&doc, "a.b.c"), Some(&json!(3)));
        assert_eq!(lookup(&doc, "a.x"), None);
    }
}
