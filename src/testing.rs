//! Shared test fixtures

use crate::proposal::{Category, OptimizationProposal, ProposalState, Severity};
use chrono::{TimeDelta, Utc};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A minimal proposal with a unique dedup hash
pub fn proposal(category: Category, severity: Severity, confidence: f64) -> OptimizationProposal {
    let now = Utc::now();
    OptimizationProposal {
        id: Uuid::new_v4(),
        category,
        severity,
        title: "t".into(),
        description: "tune things".into(),
        rationale: String::new(),
        target_resource: "a.json".into(),
        change_set: vec![],
        backup_hint: String::new(),
        risk_assessment: String::new(),
        estimated_impact: BTreeMap::new(),
        confidence_score: confidence,
        dedup_hash: Uuid::new_v4().to_string(),
        created_at: now,
        expires_at: now + TimeDelta::hours(24),
        state: ProposalState::Created,
        decision_reason: None,
        update_id: None,
    }
}
