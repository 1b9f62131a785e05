//! Configuration update records

use crate::error::AppError;
use crate::proposal::ChangeOp;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Update lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateState {
    Pending,
    Validating,
    Applying,
    Applied,
    Failed,
    RolledBack,
    /// Restore was attempted and could not be completed
    RollbackFailed,
}

impl UpdateState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UpdateState::Failed | UpdateState::RolledBack | UpdateState::RollbackFailed
        )
    }

    fn can_move_to(&self, next: UpdateState) -> bool {
        use UpdateState::*;
        matches!(
            (*self, next),
            (Pending, Validating)
                | (Pending, Failed)
                | (Validating, Applying)
                | (Validating, Failed)
                | (Applying, Applied)
                | (Applying, Failed)
                | (Applied, RolledBack)
                | (Applied, RollbackFailed)
        )
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigUpdate {
    pub update_id: Uuid,
    pub proposal_id: Option<Uuid>,
    pub target_resource: String,
    pub change_set: Vec<ChangeOp>,
    pub state: UpdateState,
    pub backup_id: Option<String>,
    pub rollback_timeout_minutes: i64,
    pub created_at: DateTime<Utc>,
    pub applied_at: Option<DateTime<Utc>>,
    pub rollback_deadline: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// Order of the committing write across all resources; 0 until applied
    pub write_sequence: u64,
}

impl ConfigUpdate {
    pub fn new(
        proposal_id: Option<Uuid>,
        target_resource: impl Into<String>,
        change_set: Vec<ChangeOp>,
        rollback_timeout: TimeDelta,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            update_id: Uuid::new_v4(),
            proposal_id,
            target_resource: target_resource.into(),
            change_set,
            state: UpdateState::Pending,
            backup_id: None,
            rollback_timeout_minutes: rollback_timeout.num_minutes(),
            created_at: now,
            applied_at: None,
            rollback_deadline: None,
            confirmed_at: None,
            finished_at: None,
            error_message: None,
            write_sequence: 0,
        }
    }

    pub fn transition(&mut self, next: UpdateState) -> Result<(), AppError> {
        if !self.state.can_move_to(next) {
            return Err(AppError::Internal(format!(
                "Update {} cannot move from {:?} to {:?}",
                self.update_id, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    pub fn mark_applied(&mut self, now: DateTime<Utc>) -> Result<(), AppError> {
        self.transition(UpdateState::Applied)?;
        self.applied_at = Some(now);
        self.rollback_deadline = Some(now + TimeDelta::minutes(self.rollback_timeout_minutes));
        Ok(())
    }

    /// Record a failure from any non-terminal pre-apply state
    pub fn mark_failed(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        if !self.state.is_terminal() {
            self.state = UpdateState::Failed;
        }
        self.error_message = Some(message.into());
        self.finished_at = Some(now);
    }

    pub fn mark_rolled_back(&mut self, now: DateTime<Utc>) -> Result<(), AppError> {
        self.transition(UpdateState::RolledBack)?;
        self.finished_at = Some(now);
        Ok(())
    }

    pub fn mark_rollback_failed(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        if self.state == UpdateState::Applied {
            self.state = UpdateState::RollbackFailed;
        }
        self.error_message = Some(message.into());
        self.finished_at = Some(now);
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.state == UpdateState::Applied
            && self.confirmed_at.is_none()
            && self.rollback_deadline.is_some_and(|deadline| now > deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(now: DateTime<Utc>) -> ConfigUpdate {
        ConfigUpdate::new(None, "a.json", vec![], TimeDelta::minutes(30), now)
    }

    #[test]
    fn test_happy_path_sets_deadline() {
        let now = Utc::now();
        let mut u = update(now);
        u.transition(UpdateState::Validating).unwrap();
        u.transition(UpdateState::Applying).unwrap();
        u.mark_applied(now).unwrap();
        assert_eq!(u.rollback_deadline, Some(now + TimeDelta::minutes(30)));
        assert!(!u.is_overdue(now + TimeDelta::minutes(30)));
        assert!(u.is_overdue(now + TimeDelta::minutes(31)));
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut u = update(Utc::now());
        assert!(u.transition(UpdateState::Applied).is_err());
        assert!(u.transition(UpdateState::RolledBack).is_err());
        u.mark_failed("boom", Utc::now());
        assert!(u.state.is_terminal());
        assert!(u.transition(UpdateState::Validating).is_err());
    }
}
