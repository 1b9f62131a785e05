//! Auto-approval rules
//!
//! Each rule is a pure predicate over a proposal plus an hourly quota. Rules
//! are evaluated in declaration order; the first one that matches and still
//! has quota left wins.

use crate::config::AutoApprovalConfig;
use crate::proposal::{Category, OptimizationProposal, Severity};
use serde::Serialize;

/// Immutable inputs shared by all predicates
#[derive(Debug, Clone, Copy)]
pub struct RuleParams {
    pub performance_improvement_threshold: f64,
}

pub type RulePredicate = fn(&OptimizationProposal, &RuleParams) -> bool;

#[derive(Debug, Clone)]
pub struct AutoApprovalRule {
    pub name: String,
    pub description: String,
    pub predicate: RulePredicate,
    pub hourly_quota: u32,
    pub enabled: bool,
}

impl AutoApprovalRule {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        hourly_quota: u32,
        predicate: RulePredicate,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            predicate,
            hourly_quota,
            enabled: true,
        }
    }

    pub fn matches(&self, proposal: &OptimizationProposal, params: &RuleParams) -> bool {
        self.enabled && (self.predicate)(proposal, params)
    }
}

/// Serializable view of a rule
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleInfo {
    pub name: String,
    pub description: String,
    pub hourly_quota: u32,
    pub enabled: bool,
    pub used_this_hour: u32,
}

fn low_risk_cache(p: &OptimizationProposal, _: &RuleParams) -> bool {
    p.severity == Severity::Low && p.confidence_score > 0.8 && p.category == Category::CacheTuning
}

fn high_performance_gain(p: &OptimizationProposal, params: &RuleParams) -> bool {
    p.impact("performance_improvement") > params.performance_improvement_threshold
        && p.confidence_score > 0.9
}

fn error_fix(p: &OptimizationProposal, _: &RuleParams) -> bool {
    let description = p.description.to_lowercase();
    description.contains("error") || description.contains("fix")
}

/// Built-in rules, in evaluation order
pub fn default_rules(config: &AutoApprovalConfig) -> Vec<AutoApprovalRule> {
    let mut rules = Vec::new();
    if config.low_risk_auto_approve {
        rules.push(AutoApprovalRule::new(
            "low_risk_auto_approve",
            "Low-severity cache tuning with confidence above 0.8",
            5,
            low_risk_cache,
        ));
    }
    rules.push(AutoApprovalRule::new(
        "high_performance_gain",
        "Estimated performance improvement above threshold with confidence above 0.9",
        2,
        high_performance_gain,
    ));
    rules.push(AutoApprovalRule::new(
        "critical_fixes",
        "Changes that fix an observed error",
        1,
        error_fix,
    ));
    rules
}
