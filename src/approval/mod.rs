//! Approval module
//!
//! Auto-approval gate with hourly quotas, the human approval queue, and the
//! archive of every decision taken.

mod gate;
mod history;
mod queue;
mod rules;

pub use gate::{AutoApprovalGate, GateDecision, GatePolicy};
pub use history::{ApprovalRecord, DecisionHistory, DecisionStats, HistoryEntry};
pub use queue::{Admission, ApprovalQueue, ApprovalRequest};
pub use rules::{default_rules, AutoApprovalRule, RuleInfo, RuleParams};
