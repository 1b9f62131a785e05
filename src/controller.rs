//! Optimization controller
//!
//! Owns the pending queue, the auto-approval gate, decision history and the
//! active update set behind one lock, and wires them to the factory, the
//! apply engine, the backup store and the audit log. File I/O is never done
//! while the state lock is held.

use crate::approval::{
    default_rules, Admission, ApprovalQueue, ApprovalRequest, AutoApprovalGate, DecisionHistory,
    DecisionStats, GatePolicy, HistoryEntry, RuleInfo, RuleParams,
};
use crate::audit::{AuditAction, AuditEntry, AuditLog};
use crate::backup::{BackupStore, ConfigBackup, PruneReport};
use crate::clock::Clock;
use crate::config::{ControllerConfig, PathsConfig, MAX_ROLLBACK_TIMEOUT_MINUTES};
use crate::engine::{
    ApplyEngine, BusinessLimits, ConfigUpdate, ConfigValidator, ResourceGuard, UpdateState,
};
use crate::error::{not_found_error, validation_error, AppError};
use crate::proposal::{
    validate_change_set, ChangeOp, ImprovementSignal, ProposalFactory, ProposalState,
    ProposalSummary,
};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use validator::Validate;

const FINISHED_CAPACITY: usize = 1000;
const EVICTION_REASON: &str = "evicted: pending capacity reached";

// ==================== Outcomes ====================

/// What `propose` did with a signal
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProposeOutcome {
    /// The signal did not warrant a change
    NoChange,
    /// Same change already pending or auto-approved this hour
    #[serde(rename_all = "camelCase")]
    Duplicate { dedup_hash: String },
    #[serde(rename_all = "camelCase")]
    AutoApplied { proposal_id: Uuid, update_id: Uuid, rule: String },
    #[serde(rename_all = "camelCase")]
    AutoApprovedApplyFailed { proposal_id: Uuid, rule: String, error: String },
    #[serde(rename_all = "camelCase")]
    Queued { proposal_id: Uuid, evicted: Option<Uuid> },
    /// Queue full with nothing evictable
    #[serde(rename_all = "camelCase")]
    Dropped { proposal_id: Uuid, reason: String },
}

impl ProposeOutcome {
    pub fn proposal_id(&self) -> Option<Uuid> {
        match self {
            ProposeOutcome::AutoApplied { proposal_id, .. }
            | ProposeOutcome::AutoApprovedApplyFailed { proposal_id, .. }
            | ProposeOutcome::Queued { proposal_id, .. } => Some(*proposal_id),
            ProposeOutcome::NoChange
            | ProposeOutcome::Duplicate { .. }
            | ProposeOutcome::Dropped { .. } => None,
        }
    }
}

/// Result of an operator decision
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionOutcome {
    pub success: bool,
    pub message: String,
    pub proposal_id: Uuid,
    pub state: ProposalState,
    pub update_id: Option<Uuid>,
}

/// Pending proposal with review bookkeeping
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalDetail {
    #[serde(flatten)]
    pub request: ApprovalRequest,
    pub hours_until_expiry: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackReport {
    pub rolled_back: Vec<Uuid>,
    pub failed: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStats {
    pub total_updates_7d: usize,
    pub successful_updates: usize,
    pub rolled_back: usize,
    pub rollback_failed: usize,
    /// Percentage of the last 7 days' updates still Applied
    pub success_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerStats {
    pub pending: usize,
    pub active_updates: usize,
    pub applied: usize,
    pub auto_approval_rate: f64,
    pub avg_decision_time_hours: f64,
    pub auto_approvals_this_hour: u32,
    pub auto_approvals_today: u32,
    pub total_backups: usize,
    pub backup_retention_days: i64,
    pub updates: UpdateStats,
    pub decisions: DecisionStats,
}

// ==================== Controller ====================

pub struct ControllerState {
    queue: ApprovalQueue,
    gate: AutoApprovalGate,
    history: DecisionHistory,
    active: HashMap<Uuid, ConfigUpdate>,
    finished: VecDeque<ConfigUpdate>,
}

impl ControllerState {
    fn finish(&mut self, update: ConfigUpdate) {
        if self.finished.len() == FINISHED_CAPACITY {
            self.finished.pop_front();
        }
        self.finished.push_back(update);
    }

    /// Pending lookups fail with Expired when the id expired, NotFound otherwise
    fn explain_missing(&self, id: Uuid, err: AppError) -> AppError {
        match self.history.get(id) {
            Some(p) if p.state == ProposalState::Expired => AppError::Expired(format!(
                "Proposal {} expired at {}",
                id,
                p.expires_at.to_rfc3339()
            )),
            _ => err,
        }
    }
}

pub struct Controller {
    config: ControllerConfig,
    state: Mutex<ControllerState>,
    factory: ProposalFactory,
    engine: ApplyEngine,
    backups: Arc<BackupStore>,
    audit: AuditLog,
    clock: Arc<dyn Clock>,
}

impl Controller {
    /// Open the on-disk stores under `paths` and build the in-memory state
    pub async fn open(
        config: ControllerConfig,
        paths: &PathsConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AppError> {
        config
            .validate()
            .map_err(|e| AppError::Config(format!("Invalid controller config: {}", e)))?;
        let now = clock.now();
        let backups = Arc::new(BackupStore::open(paths.backups_dir()).await?);
        let audit = AuditLog::open(paths.audit_log()).await?;

        let validator = ConfigValidator::new(
            BusinessLimits { max_cache_size_mb: config.limits.max_cache_size_mb },
            config.validation.strict_mode,
            config.validation.business_logic_checks,
        );
        let engine = ApplyEngine::new(
            paths.config_dir.clone(),
            backups.clone(),
            validator,
            config.safety.require_validation,
        );
        let factory = ProposalFactory::new(
            TimeDelta::hours(config.interface.confirmation_timeout_hours),
            config.limits.clone(),
            config.resources.clone(),
        );
        let gate = AutoApprovalGate::new(
            GatePolicy::from_config(&config),
            RuleParams {
                performance_improvement_threshold: config
                    .auto_approval
                    .performance_improvement_threshold,
            },
            default_rules(&config.auto_approval),
            now,
        );
        let state = ControllerState {
            queue: ApprovalQueue::new(
                config.interface.max_pending_proposals,
                TimeDelta::hours(config.interface.defer_hours),
            ),
            gate,
            history: DecisionHistory::new(),
            active: HashMap::new(),
            finished: VecDeque::new(),
        };

        info!(
            "Controller ready: {} backups on disk, config root {}",
            backups.count().await,
            paths.config_dir.display()
        );

        Ok(Self {
            config,
            state: Mutex::new(state),
            factory,
            engine,
            backups,
            audit,
            clock,
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    fn rollback_timeout(&self) -> TimeDelta {
        TimeDelta::minutes(self.config.safety.rollback_timeout_minutes)
    }

    // ==================== Proposals ====================

    /// Turn a signal into a proposal and route it through the gate or the queue
    pub async fn propose(&self, signal: ImprovementSignal) -> Result<ProposeOutcome, AppError> {
        signal.check()?;
        let now = self.clock.now();
        let Some(proposal) = self.factory.create(&signal, now)? else {
            return Ok(ProposeOutcome::NoChange);
        };
        self.sweep_expired_at(now).await;

        let mut state = self.state.lock().await;
        if state.queue.contains_hash(&proposal.dedup_hash)
            || state.gate.quota().approved_this_hour(&proposal.dedup_hash, now)
        {
            debug!(
                "Suppressed duplicate proposal '{}' ({})",
                proposal.title, proposal.dedup_hash
            );
            return Ok(ProposeOutcome::Duplicate { dedup_hash: proposal.dedup_hash });
        }

        let created = AuditEntry::new(AuditAction::ProposalCreated, now)
            .proposal(proposal.id)
            .state(ProposalState::Created)
            .details(json!({
                "title": proposal.title,
                "category": proposal.category,
                "severity": proposal.severity,
                "confidence": proposal.confidence_score,
                "dedupHash": proposal.dedup_hash,
                "signal": signal.kind(),
            }));

        let decision = state.gate.try_auto_approve(&proposal, now);
        if let (true, Some(rule)) = (decision.approved, decision.rule_name) {
            let (id, resource, ops) = (
                proposal.id,
                proposal.target_resource.clone(),
                proposal.change_set.clone(),
            );
            state
                .history
                .archive(proposal, ProposalState::AutoApproved, decision.reason.clone(), now, now);
            drop(state);

            info!("Auto-approved proposal {} via rule {}", id, rule);
            self.audit.record(created).await;
            self.audit
                .record(
                    AuditEntry::new(AuditAction::ProposalAutoApproved, now)
                        .proposal(id)
                        .state(ProposalState::AutoApproved)
                        .details(json!({ "reason": decision.reason })),
                )
                .await;

            return Ok(match self.run_update(Some(id), resource, ops, self.rollback_timeout()).await {
                Ok(update) => ProposeOutcome::AutoApplied {
                    proposal_id: id,
                    update_id: update.update_id,
                    rule,
                },
                Err(e) => ProposeOutcome::AutoApprovedApplyFailed {
                    proposal_id: id,
                    rule,
                    error: e.to_string(),
                },
            });
        }

        let id = proposal.id;
        let gate_reason = decision.reason;
        let admission = state.queue.admit(proposal, now);
        let (outcome, follow_up) = match admission {
            Admission::Queued => (ProposeOutcome::Queued { proposal_id: id, evicted: None }, None),
            Admission::QueuedWithEviction(victim) => {
                let victim = *victim;
                let victim_id = victim.id();
                state.history.archive(
                    victim.proposal,
                    ProposalState::Rejected,
                    EVICTION_REASON,
                    victim.requested_at,
                    now,
                );
                let entry = AuditEntry::new(AuditAction::ProposalEvicted, now)
                    .proposal(victim_id)
                    .state(ProposalState::Rejected)
                    .details(json!({ "reason": EVICTION_REASON, "admitted": id }));
                (ProposeOutcome::Queued { proposal_id: id, evicted: Some(victim_id) }, Some(entry))
            }
            Admission::Dropped(dropped) => {
                let reason = format!(
                    "pending queue full ({} proposals) and no low-severity proposal to evict",
                    self.config.interface.max_pending_proposals
                );
                let entry = AuditEntry::new(AuditAction::ProposalDropped, now)
                    .proposal(dropped.id)
                    .details(json!({ "reason": reason, "title": dropped.title }));
                (ProposeOutcome::Dropped { proposal_id: dropped.id, reason }, Some(entry))
            }
        };
        drop(state);

        self.audit.record(created).await;
        if let ProposeOutcome::Queued { .. } = outcome {
            debug!("Queued proposal {} for review ({})", id, gate_reason);
            self.audit
                .record(
                    AuditEntry::new(AuditAction::ProposalQueued, now)
                        .proposal(id)
                        .state(ProposalState::Pending)
                        .details(json!({ "gate": gate_reason })),
                )
                .await;
        } else {
            warn!("Dropped proposal {}: pending queue is full", id);
        }
        if let Some(entry) = follow_up {
            self.audit.record(entry).await;
        }
        Ok(outcome)
    }

    pub async fn list_pending(&self) -> Vec<ProposalSummary> {
        let now = self.clock.now();
        self.sweep_expired_at(now).await;
        self.state.lock().await.queue.list(now)
    }

    pub async fn info(&self, id: Uuid) -> Result<ProposalDetail, AppError> {
        let now = self.clock.now();
        self.sweep_expired_at(now).await;
        let state = self.state.lock().await;
        let request = match state.queue.get(id) {
            Ok(request) => request.clone(),
            Err(e) => return Err(state.explain_missing(id, e)),
        };
        let hours_until_expiry = ProposalSummary::of(&request.proposal, now).hours_until_expiry;
        Ok(ProposalDetail { request, hours_until_expiry })
    }

    /// Approve a pending proposal and hand it to the apply engine
    pub async fn approve(&self, id: Uuid, reason: Option<String>) -> Result<DecisionOutcome, AppError> {
        let now = self.clock.now();
        self.sweep_expired_at(now).await;
        let reason = reason.unwrap_or_else(|| "Approved by operator".to_string());

        let request = self.take_pending(id).await?;
        let (resource, ops) = (
            request.proposal.target_resource.clone(),
            request.proposal.change_set.clone(),
        );
        self.state.lock().await.history.archive(
            request.proposal,
            ProposalState::Approved,
            reason.clone(),
            request.requested_at,
            now,
        );
        info!("Proposal {} approved: {}", id, reason);
        self.audit
            .record(
                AuditEntry::new(AuditAction::ProposalApproved, now)
                    .proposal(id)
                    .state(ProposalState::Approved)
                    .details(json!({ "reason": reason })),
            )
            .await;

        Ok(match self.run_update(Some(id), resource, ops, self.rollback_timeout()).await {
            Ok(update) => DecisionOutcome {
                success: true,
                message: format!("Proposal {} approved and applied", id),
                proposal_id: id,
                state: ProposalState::Applied,
                update_id: Some(update.update_id),
            },
            Err(e) => DecisionOutcome {
                success: false,
                message: format!("Proposal {} approved but apply failed: {}", id, e),
                proposal_id: id,
                state: ProposalState::Failed,
                update_id: None,
            },
        })
    }

    pub async fn reject(&self, id: Uuid, reason: Option<String>) -> Result<DecisionOutcome, AppError> {
        let now = self.clock.now();
        self.sweep_expired_at(now).await;
        let reason = reason.unwrap_or_else(|| "Rejected by operator".to_string());

        let request = self.take_pending(id).await?;
        self.state.lock().await.history.archive(
            request.proposal,
            ProposalState::Rejected,
            reason.clone(),
            request.requested_at,
            now,
        );
        info!("Proposal {} rejected: {}", id, reason);
        self.audit
            .record(
                AuditEntry::new(AuditAction::ProposalRejected, now)
                    .proposal(id)
                    .state(ProposalState::Rejected)
                    .details(json!({ "reason": reason })),
            )
            .await;

        Ok(DecisionOutcome {
            success: true,
            message: format!("Proposal {} rejected", id),
            proposal_id: id,
            state: ProposalState::Rejected,
            update_id: None,
        })
    }

    /// Push a pending proposal's expiry out; it stays pending
    pub async fn defer(&self, id: Uuid, reason: Option<String>) -> Result<DecisionOutcome, AppError> {
        let now = self.clock.now();
        self.sweep_expired_at(now).await;
        let reason = reason.unwrap_or_else(|| "Deferred by operator".to_string());

        let (expires_at, defer_count) = {
            let mut state = self.state.lock().await;
            match state.queue.defer(id, reason.clone(), now) {
                Ok(request) => (request.expires_at, request.defer_count),
                Err(e) => return Err(state.explain_missing(id, e)),
            }
        };
        info!("Proposal {} deferred until {}", id, expires_at);
        self.audit
            .record(
                AuditEntry::new(AuditAction::ProposalDeferred, now)
                    .proposal(id)
                    .state(ProposalState::Pending)
                    .details(json!({
                        "reason": reason,
                        "expiresAt": expires_at,
                        "deferCount": defer_count,
                    })),
            )
            .await;

        Ok(DecisionOutcome {
            success: true,
            message: format!("Proposal {} deferred until {}", id, expires_at.to_rfc3339()),
            proposal_id: id,
            state: ProposalState::Pending,
            update_id: None,
        })
    }

    async fn take_pending(&self, id: Uuid) -> Result<ApprovalRequest, AppError> {
        let mut state = self.state.lock().await;
        match state.queue.take(id) {
            Ok(request) => Ok(request),
            Err(e) => Err(state.explain_missing(id, e)),
        }
    }

    /// Expire overdue pending proposals. Returns how many expired.
    pub async fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(self.clock.now()).await
    }

    async fn sweep_expired_at(&self, now: DateTime<Utc>) -> usize {
        let expired = {
            let mut state = self.state.lock().await;
            let expired = state.queue.sweep_expired(now);
            for request in &expired {
                state.history.archive(
                    request.proposal.clone(),
                    ProposalState::Expired,
                    "expired",
                    request.requested_at,
                    now,
                );
            }
            expired
        };

        for request in &expired {
            info!("Proposal {} expired without a decision", request.id());
            self.audit
                .record(
                    AuditEntry::new(AuditAction::ProposalExpired, now)
                        .proposal(request.id())
                        .state(ProposalState::Expired)
                        .details(json!({ "expiresAt": request.expires_at })),
                )
                .await;
        }
        expired.len()
    }

    // ==================== Updates ====================

    /// Apply a change set directly, bypassing the proposal gate
    pub async fn apply_direct(
        &self,
        resource: String,
        ops: Vec<ChangeOp>,
        rollback_timeout_minutes: Option<i64>,
    ) -> Result<ConfigUpdate, AppError> {
        if ops.is_empty() {
            return Err(validation_error("Change set must not be empty"));
        }
        validate_change_set(&ops)?;
        self.engine.resolve(&resource)?;
        let timeout = match rollback_timeout_minutes {
            Some(minutes) if !(1..=MAX_ROLLBACK_TIMEOUT_MINUTES).contains(&minutes) => {
                return Err(validation_error(format!(
                    "rollbackTimeoutMinutes must be between 1 and {}",
                    MAX_ROLLBACK_TIMEOUT_MINUTES
                )));
            }
            Some(minutes) => TimeDelta::minutes(minutes),
            None => self.rollback_timeout(),
        };
        self.run_update(None, resource, ops, timeout).await
    }

    /// Reserve a slot, run the engine outside the state lock, then record the
    /// result before releasing the resource
    async fn run_update(
        &self,
        proposal_id: Option<Uuid>,
        resource: String,
        ops: Vec<ChangeOp>,
        rollback_timeout: TimeDelta,
    ) -> Result<ConfigUpdate, AppError> {
        let now = self.clock.now();
        let mut update = ConfigUpdate::new(proposal_id, resource, ops, rollback_timeout, now);
        let cap = self.config.safety.max_concurrent_updates;

        {
            let mut state = self.state.lock().await;
            if let Some(pid) = proposal_id {
                state.history.link_update(pid, update.update_id);
            }
            if state.active.len() >= cap {
                let message = format!("{} updates already active (max {})", state.active.len(), cap);
                update.mark_failed(message.clone(), now);
                if let Some(pid) = proposal_id {
                    state.history.set_state(pid, ProposalState::Failed)?;
                }
                state.finish(update.clone());
                drop(state);

                warn!("Refusing update {} to {}: {}", update.update_id, update.target_resource, message);
                self.record_update_failed(&update, "QUOTA_EXCEEDED").await;
                return Err(AppError::QuotaExceeded(message));
            }
            state.active.insert(update.update_id, update.clone());
        }

        let guard = self.engine.lock_resource(&update.target_resource).await;
        let result = self.engine.execute(&guard, &mut update, now).await;
        let finished_at = self.clock.now();

        let mut state = self.state.lock().await;
        match result {
            Ok(()) => {
                state.active.insert(update.update_id, update.clone());
                if let Some(pid) = proposal_id {
                    state.history.set_state(pid, ProposalState::Applied)?;
                }
                drop(state);
                drop(guard);

                let mut entry = AuditEntry::new(AuditAction::UpdateApplied, finished_at)
                    .update(update.update_id)
                    .state(update.state)
                    .details(json!({
                        "targetResource": update.target_resource,
                        "changes": update.change_set.iter().map(ChangeOp::describe).collect::<Vec<_>>(),
                        "rollbackDeadline": update.rollback_deadline,
                    }));
                if let Some(pid) = proposal_id {
                    entry = entry.proposal(pid);
                }
                if let Some(backup_id) = &update.backup_id {
                    entry = entry.backup(backup_id.clone());
                }
                self.audit.record(entry).await;
                Ok(update)
            }
            Err(e) => {
                state.active.remove(&update.update_id);
                update.mark_failed(e.to_string(), finished_at);
                if let Some(pid) = proposal_id {
                    state.history.set_state(pid, ProposalState::Failed)?;
                }
                state.finish(update.clone());
                drop(state);
                drop(guard);

                warn!("Update {} to {} failed: {}", update.update_id, update.target_resource, e);
                self.record_update_failed(&update, e.code()).await;
                Err(e)
            }
        }
    }

    async fn record_update_failed(&self, update: &ConfigUpdate, code: &str) {
        let mut entry = AuditEntry::new(AuditAction::UpdateFailed, update.finished_at.unwrap_or(update.created_at))
            .update(update.update_id)
            .state(update.state)
            .details(json!({
                "targetResource": update.target_resource,
                "code": code,
                "error": update.error_message,
            }));
        if let Some(pid) = update.proposal_id {
            entry = entry.proposal(pid);
        }
        if let Some(backup_id) = &update.backup_id {
            entry = entry.backup(backup_id.clone());
        }
        self.audit.record(entry).await;
    }

    /// Mark an applied update healthy; it leaves the active set.
    ///
    /// Older unconfirmed updates to the same resource are confirmed with it:
    /// the content being vouched for already contains their changes.
    pub async fn confirm(&self, update_id: Uuid) -> Result<ConfigUpdate, AppError> {
        let now = self.clock.now();
        let confirmed = {
            let mut state = self.state.lock().await;
            let target = state
                .active
                .get(&update_id)
                .ok_or_else(|| not_found_error(format!("Active update {} not found", update_id)))?;
            if target.state != UpdateState::Applied {
                return Err(AppError::BadRequest(format!(
                    "Update {} is {:?} and cannot be confirmed yet",
                    update_id, target.state
                )));
            }
            let (resource, ceiling) = (target.target_resource.clone(), target.write_sequence);

            let mut beneath: Vec<(u64, Uuid)> = state
                .active
                .values()
                .filter(|u| {
                    u.target_resource == resource
                        && u.state == UpdateState::Applied
                        && u.write_sequence <= ceiling
                })
                .map(|u| (u.write_sequence, u.update_id))
                .collect();
            beneath.sort_unstable();

            let mut confirmed = Vec::with_capacity(beneath.len());
            for (_, id) in beneath {
                if let Some(mut update) = state.active.remove(&id) {
                    update.confirmed_at = Some(now);
                    state.finish(update.clone());
                    confirmed.push(update);
                }
            }
            confirmed
        };

        let mut result = None;
        for update in confirmed {
            let mut entry = AuditEntry::new(AuditAction::UpdateConfirmed, now)
                .update(update.update_id)
                .state(update.state);
            if update.update_id == update_id {
                info!("Update {} confirmed", update_id);
            } else {
                info!("Update {} confirmed together with newer update {}", update.update_id, update_id);
                entry = entry.details(json!({ "confirmedWith": update_id }));
            }
            if let Some(pid) = update.proposal_id {
                entry = entry.proposal(pid);
            }
            self.audit.record(entry).await;
            if update.update_id == update_id {
                result = Some(update);
            }
        }
        result.ok_or_else(|| not_found_error(format!("Active update {} not found", update_id)))
    }

    /// Restore the backup taken for an active update.
    ///
    /// Newer unconfirmed updates to the same resource were written on top of
    /// this one, so they are rolled back first, newest first. The resource
    /// stays locked for the whole sequence.
    pub async fn rollback(&self, update_id: Uuid, reason: &str) -> Result<ConfigUpdate, AppError> {
        let resource = {
            let state = self.state.lock().await;
            let update = state
                .active
                .get(&update_id)
                .ok_or_else(|| not_found_error(format!("Active update {} not found", update_id)))?;
            ensure_rollbackable(update)?;
            update.target_resource.clone()
        };
        let guard = self.engine.lock_resource(&resource).await;

        let (target, mut newer) = {
            let mut state = self.state.lock().await;
            // Confirmed or rolled back while waiting for the resource
            let floor = match state.active.get(&update_id) {
                Some(update) => {
                    ensure_rollbackable(update)?;
                    update.write_sequence
                }
                None => {
                    return Err(not_found_error(format!("Active update {} not found", update_id)));
                }
            };
            let mut stacked: Vec<(u64, Uuid)> = state
                .active
                .values()
                .filter(|u| {
                    u.target_resource == resource
                        && u.state == UpdateState::Applied
                        && u.write_sequence > floor
                })
                .map(|u| (u.write_sequence, u.update_id))
                .collect();
            stacked.sort_unstable_by(|a, b| b.cmp(a));

            let newer: VecDeque<ConfigUpdate> = stacked
                .into_iter()
                .filter_map(|(_, id)| state.active.remove(&id))
                .collect();
            let target = state
                .active
                .remove(&update_id)
                .ok_or_else(|| not_found_error(format!("Active update {} not found", update_id)))?;
            (target, newer)
        };

        if !newer.is_empty() {
            info!(
                "Rolling back {} newer updates to {} before update {}",
                newer.len(),
                resource,
                update_id
            );
        }
        let cascade_reason = format!("{} (stacked on {})", reason, update_id);
        while let Some(update) = newer.pop_front() {
            let newer_id = update.update_id;
            if let Err(e) = self.restore_update(&guard, update, &cascade_reason).await {
                let mut state = self.state.lock().await;
                for rest in newer.drain(..).chain(std::iter::once(target)) {
                    state.active.insert(rest.update_id, rest);
                }
                return Err(AppError::Rollback(format!(
                    "Update {} left in place: newer update {} on {} could not be rolled back: {}",
                    update_id, newer_id, resource, e
                )));
            }
        }

        self.restore_update(&guard, target, reason).await
    }

    /// Restore one update that has already left the active set
    async fn restore_update(
        &self,
        guard: &ResourceGuard,
        mut update: ConfigUpdate,
        reason: &str,
    ) -> Result<ConfigUpdate, AppError> {
        let update_id = update.update_id;
        let result = self.engine.restore(guard, &update).await;
        let now = self.clock.now();

        match result {
            Ok(()) => {
                update.mark_rolled_back(now)?;
                {
                    let mut state = self.state.lock().await;
                    if let Some(pid) = update.proposal_id {
                        state.history.set_state(pid, ProposalState::RolledBack)?;
                    }
                    state.finish(update.clone());
                }

                info!("Rolled back update {} ({})", update_id, reason);
                let mut entry = AuditEntry::new(AuditAction::UpdateRolledBack, now)
                    .update(update_id)
                    .state(update.state)
                    .details(json!({ "reason": reason, "targetResource": update.target_resource }));
                if let Some(pid) = update.proposal_id {
                    entry = entry.proposal(pid);
                }
                if let Some(backup_id) = &update.backup_id {
                    entry = entry.backup(backup_id.clone());
                }
                self.audit.record(entry).await;
                Ok(update)
            }
            Err(e) => {
                update.mark_rollback_failed(e.to_string(), now);
                self.state.lock().await.finish(update.clone());

                error!(
                    "Rollback of update {} on {} failed: {}",
                    update_id, update.target_resource, e
                );
                let mut entry = AuditEntry::new(AuditAction::RollbackFailed, now)
                    .update(update_id)
                    .state(update.state)
                    .details(json!({
                        "reason": reason,
                        "targetResource": update.target_resource,
                        "error": e.to_string(),
                    }));
                if let Some(pid) = update.proposal_id {
                    entry = entry.proposal(pid);
                }
                if let Some(backup_id) = &update.backup_id {
                    entry = entry.backup(backup_id.clone());
                }
                self.audit.record(entry).await;
                Err(e)
            }
        }
    }

    /// Roll back every unconfirmed update past its deadline, newest write
    /// first. One failure does not stop the others.
    pub async fn rollback_overdue(&self) -> RollbackReport {
        let now = self.clock.now();
        let mut overdue: Vec<(u64, Uuid)> = {
            let state = self.state.lock().await;
            state
                .active
                .values()
                .filter(|u| u.is_overdue(now))
                .map(|u| (u.write_sequence, u.update_id))
                .collect()
        };
        overdue.sort_unstable_by(|a, b| b.cmp(a));

        let mut report = RollbackReport::default();
        if overdue.is_empty() {
            return report;
        }
        if !self.config.safety.auto_rollback_overdue {
            warn!(
                "{} updates are past their rollback deadline; automatic rollback is disabled",
                overdue.len()
            );
            return report;
        }

        for (_, update_id) in overdue {
            match self.rollback(update_id, "rollback deadline passed").await {
                Ok(_) => report.rolled_back.push(update_id),
                // Confirmed or rolled back by an operator in the meantime
                Err(AppError::NotFound(_)) => {}
                Err(_) => report.failed.push(update_id),
            }
        }
        report
    }

    // ==================== Backups ====================

    /// Prune expired backups, sparing those referenced by active updates
    pub async fn enforce_retention(&self) -> Result<PruneReport, AppError> {
        let now = self.clock.now();
        let referenced: HashSet<String> = {
            let state = self.state.lock().await;
            state.active.values().filter_map(|u| u.backup_id.clone()).collect()
        };

        let retention = TimeDelta::days(self.config.safety.backup_retention_days);
        let report = self.backups.prune(retention, &referenced, now).await?;
        if !report.removed.is_empty() {
            info!(
                "Pruned {} backups older than {} days ({} kept for active updates)",
                report.removed.len(),
                self.config.safety.backup_retention_days,
                report.kept_referenced
            );
            self.audit
                .record(
                    AuditEntry::new(AuditAction::BackupsPruned, now).details(json!({
                        "removed": report.removed,
                        "keptReferenced": report.kept_referenced,
                    })),
                )
                .await;
        }
        Ok(report)
    }

    pub async fn backups(&self, resource: Option<&str>) -> Vec<ConfigBackup> {
        self.backups.list(resource).await
    }

    pub async fn backup(&self, backup_id: &str) -> Result<ConfigBackup, AppError> {
        self.backups.get(backup_id).await
    }

    // ==================== Queries ====================

    pub async fn history(&self, limit: usize) -> Vec<HistoryEntry> {
        self.state.lock().await.history.entries(limit)
    }

    /// Updates still inside their rollback window, oldest first
    pub async fn active_updates(&self) -> Vec<ConfigUpdate> {
        let mut updates: Vec<_> = self.state.lock().await.active.values().cloned().collect();
        updates.sort_by_key(|u| (u.created_at, u.write_sequence));
        updates
    }

    /// Finished updates, newest first
    pub async fn finished_updates(&self, limit: usize) -> Vec<ConfigUpdate> {
        self.state
            .lock()
            .await
            .finished
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn rules(&self) -> Vec<RuleInfo> {
        let now = self.clock.now();
        self.state.lock().await.gate.rules(now)
    }

    pub async fn audit(&self, limit: usize, action: Option<AuditAction>) -> Vec<AuditEntry> {
        self.audit.recent(limit, action).await
    }

    pub async fn stats(&self) -> ControllerStats {
        let now = self.clock.now();
        self.sweep_expired_at(now).await;

        let (pending, active_updates, applied, quota, decisions, updates) = {
            let state = self.state.lock().await;
            let all: Vec<&ConfigUpdate> = state.active.values().chain(state.finished.iter()).collect();
            let applied = all.iter().filter(|u| u.applied_at.is_some()).count();

            let week_ago = now - TimeDelta::days(7);
            let recent: Vec<_> = all.iter().filter(|u| u.created_at >= week_ago).collect();
            let count = |s: UpdateState| recent.iter().filter(|u| u.state == s).count();
            let successful = count(UpdateState::Applied);
            let updates = UpdateStats {
                total_updates_7d: recent.len(),
                successful_updates: successful,
                rolled_back: count(UpdateState::RolledBack),
                rollback_failed: count(UpdateState::RollbackFailed),
                success_rate: if recent.is_empty() {
                    0.0
                } else {
                    successful as f64 / recent.len() as f64 * 100.0
                },
            };

            (
                state.queue.len(),
                state.active.len(),
                applied,
                (state.gate.quota().total(now), state.gate.quota().today(now)),
                state.history.stats(now),
                updates,
            )
        };

        ControllerStats {
            pending,
            active_updates,
            applied,
            auto_approval_rate: decisions.auto_approval_rate,
            avg_decision_time_hours: decisions.avg_decision_time_hours,
            auto_approvals_this_hour: quota.0,
            auto_approvals_today: quota.1,
            total_backups: self.backups.count().await,
            backup_retention_days: self.config.safety.backup_retention_days,
            updates,
            decisions,
        }
    }
}

fn ensure_rollbackable(update: &ConfigUpdate) -> Result<(), AppError> {
    if update.state != UpdateState::Applied {
        return Err(AppError::BadRequest(format!(
            "Update {} is {:?} and cannot be rolled back",
            update.update_id, update.state
        )));
    }
    Ok(())
}
