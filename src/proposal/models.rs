//! Proposal data models
//!
//! Defines the optimization proposal and its lifecycle.

use crate::proposal::changes::ChangeOp;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// What kind of tuning a proposal performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    CacheTuning,
    ConfigUpdate,
    ThresholdAdjust,
    ResourceRealloc,
    AlertRuleUpdate,
    PerfTuning,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::CacheTuning => "cache_tuning",
            Category::ConfigUpdate => "config_update",
            Category::ThresholdAdjust => "threshold_adjust",
            Category::ResourceRealloc => "resource_realloc",
            Category::AlertRuleUpdate => "alert_rule_update",
            Category::PerfTuning => "perf_tuning",
        }
    }
}

/// Ordered Low < Medium < High < Critical
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// High and Critical changes always go to a human
    pub fn requires_human(&self) -> bool {
        *self >= Severity::High
    }
}

/// Proposal lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalState {
    /// Built by the factory, not yet gated
    Created,
    /// Passed an auto-approval rule
    AutoApproved,
    /// Waiting for an operator
    Pending,
    /// Approved by an operator
    Approved,
    /// Rejected by an operator, or evicted from a full queue
    Rejected,
    /// Expiry pushed out; the proposal is back to Pending
    Deferred,
    /// Not decided before its deadline
    Expired,
    /// Change written to the target resource
    Applied,
    /// Apply failed; the resource was not touched
    Failed,
    /// Change reverted from backup
    RolledBack,
}

impl Default for ProposalState {
    fn default() -> Self {
        ProposalState::Created
    }
}

/// A structured, reviewable configuration change
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationProposal {
    pub id: Uuid,
    pub category: Category,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub rationale: String,
    /// Resource path (relative to the config root) the change set targets
    pub target_resource: String,
    pub change_set: Vec<ChangeOp>,
    /// How to undo the change by hand if automatic rollback is unavailable
    pub backup_hint: String,
    pub risk_assessment: String,
    /// Expected metric deltas, e.g. `performance_improvement -> 20.0`
    pub estimated_impact: BTreeMap<String, f64>,
    pub confidence_score: f64,
    pub dedup_hash: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub state: ProposalState,
    pub decision_reason: Option<String>,
    /// Set once the proposal has been handed to the apply engine
    pub update_id: Option<Uuid>,
}

impl OptimizationProposal {
    pub fn impact(&self, metric: &str) -> f64 {
        self.estimated_impact.get(metric).copied().unwrap_or(0.0)
    }
}

/// Human-facing view used by list/info
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalSummary {
    pub id: Uuid,
    pub category: Category,
    pub severity: Severity,
    pub title: String,
    pub target_resource: String,
    pub confidence_score: f64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub hours_until_expiry: f64,
}

impl ProposalSummary {
    pub fn of(proposal: &OptimizationProposal, now: DateTime<Utc>) -> Self {
        let remaining = (proposal.expires_at - now).num_seconds().max(0) as f64 / 3600.0;
        Self {
            id: proposal.id,
            category: proposal.category,
            severity: proposal.severity,
            title: proposal.title.clone(),
            target_resource: proposal.target_resource.clone(),
            confidence_score: proposal.confidence_score,
            created_at: proposal.created_at,
            expires_at: proposal.expires_at,
            hours_until_expiry: (remaining * 10.0).round() / 10.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::High < Severity::Critical);
        assert!(!Severity::Medium.requires_human());
        assert!(Severity::High.requires_human());
        assert!(Severity::Critical.requires_human());
    }

    #[test]
    fn test_enum_wire_names() {
        assert_eq!(serde_json::to_string(&Severity::Critical).unwrap(), "\"critical\"");
        assert_eq!(
            serde_json::to_string(&ProposalState::AutoApproved).unwrap(),
            "\"auto_approved\""
        );
        assert_eq!(
            serde_json::to_string(&Category::CacheTuning).unwrap(),
            format!("\"{}\"", Category::CacheTuning.as_str())
        );
    }
}
