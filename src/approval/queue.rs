//! Approval queue
//!
//! Pending proposals waiting for an operator, in arrival order.

use crate::error::{not_found_error, AppError};
use crate::proposal::{OptimizationProposal, ProposalState, ProposalSummary, Severity};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use uuid::Uuid;

/// A pending proposal plus its review bookkeeping
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub proposal: OptimizationProposal,
    pub requested_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub decision_reason: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub defer_count: u32,
}

impl ApprovalRequest {
    pub fn id(&self) -> Uuid {
        self.proposal.id
    }
}

/// What happened when a proposal was offered to the queue
#[derive(Debug)]
pub enum Admission {
    Queued,
    /// Admitted after evicting the oldest Low-severity proposal
    QueuedWithEviction(Box<ApprovalRequest>),
    /// Queue full and nothing evictable; the new proposal is handed back
    Dropped(Box<OptimizationProposal>),
}

#[derive(Debug)]
pub struct ApprovalQueue {
    pending: Vec<ApprovalRequest>,
    capacity: usize,
    defer_by: TimeDelta,
}

impl ApprovalQueue {
    pub fn new(capacity: usize, defer_by: TimeDelta) -> Self {
        Self { pending: Vec::new(), capacity, defer_by }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn contains_hash(&self, hash: &str) -> bool {
        self.pending.iter().any(|r| r.proposal.dedup_hash == hash)
    }

    pub fn admit(&mut self, mut proposal: OptimizationProposal, now: DateTime<Utc>) -> Admission {
        let mut evicted = None;
        if self.pending.len() >= self.capacity {
            let victim = self
                .pending
                .iter()
                .enumerate()
                .filter(|(_, r)| r.proposal.severity == Severity::Low)
                .min_by_key(|(_, r)| r.requested_at)
                .map(|(i, _)| i);
            match victim {
                Some(i) => evicted = Some(Box::new(self.pending.remove(i))),
                None => return Admission::Dropped(Box::new(proposal)),
            }
        }

        proposal.state = ProposalState::Pending;
        self.pending.push(ApprovalRequest {
            requested_at: now,
            expires_at: proposal.expires_at,
            proposal,
            decision_reason: None,
            decided_at: None,
            defer_count: 0,
        });

        match evicted {
            Some(request) => Admission::QueuedWithEviction(request),
            None => Admission::Queued,
        }
    }

    pub fn get(&self, id: Uuid) -> Result<&ApprovalRequest, AppError> {
        self.pending
            .iter()
            .find(|r| r.id() == id)
            .ok_or_else(|| not_found_error(format!("Pending proposal {} not found", id)))
    }

    /// Remove a request so a decision can be recorded against it
    pub fn take(&mut self, id: Uuid) -> Result<ApprovalRequest, AppError> {
        let index = self
            .pending
            .iter()
            .position(|r| r.id() == id)
            .ok_or_else(|| not_found_error(format!("Pending proposal {} not found", id)))?;
        Ok(self.pending.remove(index))
    }

    /// Push the expiry out; the request stays pending
    pub fn defer(
        &mut self,
        id: Uuid,
        reason: String,
        now: DateTime<Utc>,
    ) -> Result<&ApprovalRequest, AppError> {
        let defer_by = self.defer_by;
        let request = self
            .pending
            .iter_mut()
            .find(|r| r.id() == id)
            .ok_or_else(|| not_found_error(format!("Pending proposal {} not found", id)))?;

        request.expires_at = now + defer_by;
        request.proposal.expires_at = request.expires_at;
        request.proposal.decision_reason = Some(reason.clone());
        request.decision_reason = Some(reason);
        request.defer_count += 1;
        Ok(request)
    }

    /// Remove every request past its expiry. Calling again is a no-op.
    pub fn sweep_expired(&mut self, now: DateTime<Utc>) -> Vec<ApprovalRequest> {
        let (expired, live): (Vec<_>, Vec<_>) =
            self.pending.drain(..).partition(|r| now > r.expires_at);
        self.pending = live;
        expired
    }

    pub fn list(&self, now: DateTime<Utc>) -> Vec<ProposalSummary> {
        self.pending
            .iter()
            .map(|r| ProposalSummary::of(&r.proposal, now))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proposal::Category;
    use crate::testing::proposal;

    fn queue(capacity: usize) -> ApprovalQueue {
        ApprovalQueue::new(capacity, TimeDelta::hours(24))
    }

    #[test]
    fn test_admit_and_take() {
        let mut q = queue(10);
        let p = proposal(Category::ConfigUpdate, Severity::Medium, 0.5);
        let id = p.id;
        assert!(matches!(q.admit(p, Utc::now()), Admission::Queued));
        assert_eq!(q.get(id).unwrap().proposal.state, ProposalState::Pending);
        assert_eq!(q.take(id).unwrap().id(), id);
        assert!(matches!(q.take(id), Err(AppError::NotFound(_))));
    }

    #[test]
    fn test_full_queue_evicts_oldest_low() {
        let mut q = queue(2);
        let now = Utc::now();
        let old_low = proposal(Category::CacheTuning, Severity::Low, 0.5);
        let old_low_id = old_low.id;
        q.admit(old_low, now);
        q.admit(proposal(Category::CacheTuning, Severity::Low, 0.5), now + TimeDelta::minutes(1));

        let admission = q.admit(
            proposal(Category::PerfTuning, Severity::High, 0.5),
            now + TimeDelta::minutes(2),
        );
        match admission {
            Admission::QueuedWithEviction(evicted) => assert_eq!(evicted.id(), old_low_id),
            other => panic!("unexpected admission {:?}", other),
        }
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_full_queue_without_low_drops_new() {
        let mut q = queue(1);
        q.admit(proposal(Category::PerfTuning, Severity::Medium, 0.5), Utc::now());
        let admission = q.admit(proposal(Category::CacheTuning, Severity::Low, 0.9), Utc::now());
        assert!(matches!(admission, Admission::Dropped(_)));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_defer_extends_expiry() {
        let mut q = queue(10);
        let p = proposal(Category::ConfigUpdate, Severity::Medium, 0.5);
        let id = p.id;
        let now = Utc::now();
        q.admit(p, now);

        let later = now + TimeDelta::hours(20);
        let request = q.defer(id, "need more data".into(), later).unwrap();
        assert_eq!(request.expires_at, later + TimeDelta::hours(24));
        assert_eq!(request.defer_count, 1);
        assert!(q.sweep_expired(now + TimeDelta::hours(30)).is_empty());
    }

    #[test]
    fn test_sweep_is_idempotent() {
        let mut q = queue(10);
        let now = Utc::now();
        q.admit(proposal(Category::ConfigUpdate, Severity::Medium, 0.5), now);
        let later = now + TimeDelta::hours(25);
        assert_eq!(q.sweep_expired(later).len(), 1);
        assert!(q.sweep_expired(later).is_empty());
        assert_eq!(q.len(), 0);
    }
}
