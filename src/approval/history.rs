//! Decision history
//!
//! Every proposal that leaves the gate or the queue is archived here and
//! never deleted. Later lifecycle changes (Applied, Failed, RolledBack) are
//! recorded against the archived copy.

use crate::error::{not_found_error, AppError};
use crate::proposal::{OptimizationProposal, ProposalState};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// One decision, as shown in the history listing
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRecord {
    pub proposal_id: Uuid,
    pub title: String,
    /// Decision taken: AutoApproved, Approved, Rejected or Expired
    pub decision: ProposalState,
    pub decision_reason: String,
    pub requested_at: DateTime<Utc>,
    pub decided_at: DateTime<Utc>,
}

impl ApprovalRecord {
    pub fn is_auto(&self) -> bool {
        self.decision_reason.starts_with("auto:")
    }
}

/// Archived proposal with its decision
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub record: ApprovalRecord,
    pub proposal: OptimizationProposal,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionStats {
    pub total_decisions: usize,
    pub status_breakdown: BTreeMap<String, usize>,
    pub auto_approvals: usize,
    /// Fraction of decisions taken by the gate, 0.0 to 1.0
    pub auto_approval_rate: f64,
    /// Mean time from request to decision, expired requests excluded
    pub avg_decision_time_hours: f64,
    pub decisions_last_7_days: usize,
    pub applied: usize,
    pub failed: usize,
    pub rolled_back: usize,
}

#[derive(Debug, Default)]
pub struct DecisionHistory {
    records: Vec<ApprovalRecord>,
    proposals: HashMap<Uuid, OptimizationProposal>,
}

impl DecisionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Archive a proposal with its decision
    pub fn archive(
        &mut self,
        mut proposal: OptimizationProposal,
        decision: ProposalState,
        reason: impl Into<String>,
        requested_at: DateTime<Utc>,
        decided_at: DateTime<Utc>,
    ) -> ApprovalRecord {
        let reason = reason.into();
        proposal.state = decision;
        proposal.decision_reason = Some(reason.clone());

        let record = ApprovalRecord {
            proposal_id: proposal.id,
            title: proposal.title.clone(),
            decision,
            decision_reason: reason,
            requested_at,
            decided_at,
        };
        self.records.push(record.clone());
        self.proposals.insert(proposal.id, proposal);
        record
    }

    pub fn get(&self, id: Uuid) -> Option<&OptimizationProposal> {
        self.proposals.get(&id)
    }

    /// Move an archived proposal to a later lifecycle state
    pub fn set_state(&mut self, id: Uuid, state: ProposalState) -> Result<(), AppError> {
        let proposal = self
            .proposals
            .get_mut(&id)
            .ok_or_else(|| not_found_error(format!("Proposal {} not found in history", id)))?;
        proposal.state = state;
        Ok(())
    }

    pub fn link_update(&mut self, id: Uuid, update_id: Uuid) {
        if let Some(proposal) = self.proposals.get_mut(&id) {
            proposal.update_id = Some(update_id);
        }
    }

    /// Most recent first
    pub fn entries(&self, limit: usize) -> Vec<HistoryEntry> {
        self.records
            .iter()
            .rev()
            .take(limit)
            .filter_map(|record| {
                self.proposals.get(&record.proposal_id).map(|p| HistoryEntry {
                    record: record.clone(),
                    proposal: p.clone(),
                })
            })
            .collect()
    }

    pub fn stats(&self, now: DateTime<Utc>) -> DecisionStats {
        let total = self.records.len();

        let mut status_breakdown = BTreeMap::new();
        for record in &self.records {
            let key = serde_json::to_value(record.decision)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            *status_breakdown.entry(key).or_insert(0) += 1;
        }

        let auto_approvals = self.records.iter().filter(|r| r.is_auto()).count();

        let decided: Vec<f64> = self
            .records
            .iter()
            .filter(|r| r.decision != ProposalState::Expired)
            .map(|r| (r.decided_at - r.requested_at).num_seconds() as f64 / 3600.0)
            .collect();
        let avg_decision_time_hours = if decided.is_empty() {
            0.0
        } else {
            decided.iter().sum::<f64>() / decided.len() as f64
        };

        let week_ago = now - TimeDelta::days(7);
        let count_state = |state: ProposalState| {
            self.proposals.values().filter(|p| p.state == state).count()
        };

        DecisionStats {
            total_decisions: total,
            status_breakdown,
            auto_approvals,
            auto_approval_rate: if total == 0 { 0.0 } else { auto_approvals as f64 / total as f64 },
            avg_decision_time_hours,
            decisions_last_7_days: self.records.iter().filter(|r| r.decided_at > week_ago).count(),
            applied: count_state(ProposalState::Applied),
            failed: count_state(ProposalState::Failed),
            rolled_back: count_state(ProposalState::RolledBack),
        }
    }
}
