//! Auto-approval gate
//!
//! Decides whether a proposal may skip human review. Quotas are counted per
//! calendar hour (UTC): every hourly counter resets when the clock enters a
//! new hour. A separate daily total resets at UTC midnight.

use crate::approval::rules::{AutoApprovalRule, RuleInfo, RuleParams};
use crate::clock::{day_bucket, hour_bucket};
use crate::config::{CategoryToggles, ControllerConfig};
use crate::proposal::OptimizationProposal;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Counters for the current hour bucket, plus the running daily total
#[derive(Debug)]
pub struct HourlyQuota {
    bucket: DateTime<Utc>,
    total: u32,
    per_rule: HashMap<String, u32>,
    approved_hashes: HashSet<String>,
    day: DateTime<Utc>,
    today: u32,
}

impl HourlyQuota {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            bucket: hour_bucket(now),
            total: 0,
            per_rule: HashMap::new(),
            approved_hashes: HashSet::new(),
            day: day_bucket(now),
            today: 0,
        }
    }

    fn roll(&mut self, now: DateTime<Utc>) {
        let bucket = hour_bucket(now);
        if bucket != self.bucket {
            self.bucket = bucket;
            self.total = 0;
            self.per_rule.clear();
            self.approved_hashes.clear();
        }
        let day = day_bucket(now);
        if day != self.day {
            self.day = day;
            self.today = 0;
        }
    }

    fn in_bucket(&self, now: DateTime<Utc>) -> bool {
        hour_bucket(now) == self.bucket
    }

    pub fn total(&self, now: DateTime<Utc>) -> u32 {
        if self.in_bucket(now) {
            self.total
        } else {
            0
        }
    }

    /// Auto-approvals since UTC midnight
    pub fn today(&self, now: DateTime<Utc>) -> u32 {
        if day_bucket(now) == self.day {
            self.today
        } else {
            0
        }
    }

    pub fn rule_count(&self, rule: &str, now: DateTime<Utc>) -> u32 {
        if self.in_bucket(now) {
            self.per_rule.get(rule).copied().unwrap_or(0)
        } else {
            0
        }
    }

    /// Was a proposal with this hash auto-approved in the current hour?
    pub fn approved_this_hour(&self, hash: &str, now: DateTime<Utc>) -> bool {
        self.in_bucket(now) && self.approved_hashes.contains(hash)
    }

    fn record(&mut self, rule: &str, hash: &str, now: DateTime<Utc>) {
        self.roll(now);
        self.total += 1;
        self.today += 1;
        *self.per_rule.entry(rule.to_string()).or_insert(0) += 1;
        self.approved_hashes.insert(hash.to_string());
    }
}

/// Outcome of a gate evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct GateDecision {
    pub approved: bool,
    pub rule_name: Option<String>,
    pub reason: String,
}

impl GateDecision {
    fn deny(reason: impl Into<String>) -> Self {
        Self { approved: false, rule_name: None, reason: reason.into() }
    }
}

/// Checks applied before any rule is consulted
#[derive(Debug, Clone)]
pub struct GatePolicy {
    pub enabled: bool,
    pub hourly_cap: u32,
    pub daily_cap: u32,
    pub categories: CategoryToggles,
}

impl GatePolicy {
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self {
            enabled: config.auto_approval.enabled,
            hourly_cap: config.auto_approval.max_auto_approve_per_hour,
            daily_cap: config.limits.max_daily_optimizations,
            categories: config.categories,
        }
    }
}

pub struct AutoApprovalGate {
    policy: GatePolicy,
    params: RuleParams,
    rules: Vec<AutoApprovalRule>,
    quota: HourlyQuota,
}

impl AutoApprovalGate {
    pub fn new(
        policy: GatePolicy,
        params: RuleParams,
        rules: Vec<AutoApprovalRule>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            policy,
            params,
            rules,
            quota: HourlyQuota::new(now),
        }
    }

    pub fn quota(&self) -> &HourlyQuota {
        &self.quota
    }

    /// Evaluate a proposal; approving consumes global and rule quota
    pub fn try_auto_approve(
        &mut self,
        proposal: &OptimizationProposal,
        now: DateTime<Utc>,
    ) -> GateDecision {
        if !self.policy.enabled {
            return GateDecision::deny("auto-approval disabled");
        }

        if self.quota.total(now) >= self.policy.hourly_cap {
            debug!(
                "Global auto-approval cap of {}/hour reached, queueing '{}'",
                self.policy.hourly_cap, proposal.title
            );
            return GateDecision::deny("global hourly auto-approval cap reached");
        }

        if self.quota.today(now) >= self.policy.daily_cap {
            debug!(
                "Daily auto-approval limit of {} reached, queueing '{}'",
                self.policy.daily_cap, proposal.title
            );
            return GateDecision::deny("daily auto-approval limit reached");
        }

        if !self.policy.categories.enabled_for(proposal.category) {
            return GateDecision::deny(format!(
                "{} proposals are disabled for auto-approval",
                CategoryToggles::family(proposal.category)
            ));
        }

        if proposal.severity.requires_human() {
            return GateDecision::deny(format!(
                "{:?} severity requires human approval",
                proposal.severity
            ));
        }

        let mut saw_exhausted = false;
        let mut matched: Option<String> = None;
        for rule in &self.rules {
            if !rule.matches(proposal, &self.params) {
                continue;
            }
            if self.quota.rule_count(&rule.name, now) >= rule.hourly_quota {
                saw_exhausted = true;
                continue;
            }
            matched = Some(rule.name.clone());
            break;
        }

        match matched {
            Some(name) => {
                self.quota.record(&name, &proposal.dedup_hash, now);
                GateDecision {
                    approved: true,
                    reason: format!("auto:{}", name),
                    rule_name: Some(name),
                }
            }
            None if saw_exhausted => GateDecision::deny("matching rule quota exhausted"),
            None => GateDecision::deny("no auto-approval rule matched"),
        }
    }

    pub fn rules(&self, now: DateTime<Utc>) -> Vec<RuleInfo> {
        self.rules
            .iter()
            .map(|r| RuleInfo {
                name: r.name.clone(),
                description: r.description.clone(),
                hourly_quota: r.hourly_quota,
                enabled: r.enabled,
                used_this_hour: self.quota.rule_count(&r.name, now),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::rules::default_rules;
    use crate::config::ControllerConfig;
    use crate::proposal::{Category, Severity};
    use crate::testing::proposal;
    use chrono::{TimeDelta, TimeZone};

    fn gate_with(policy: GatePolicy, now: DateTime<Utc>) -> AutoApprovalGate {
        let config = ControllerConfig::default().auto_approval;
        AutoApprovalGate::new(
            policy,
            RuleParams { performance_improvement_threshold: 15.0 },
            default_rules(&config),
            now,
        )
    }

    fn gate(global_cap: u32, now: DateTime<Utc>) -> AutoApprovalGate {
        let mut policy = GatePolicy::from_config(&ControllerConfig::default());
        policy.hourly_cap = global_cap;
        policy.daily_cap = 1000;
        gate_with(policy, now)
    }

    fn t(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, h, m, 0).unwrap()
    }

    #[test]
    fn test_low_risk_cache_auto_approved() {
        let mut gate = gate(10, t(9, 0));
        let p = proposal(Category::CacheTuning, Severity::Low, 0.95);
        let decision = gate.try_auto_approve(&p, t(9, 1));
        assert!(decision.approved);
        assert_eq!(decision.reason, "auto:low_risk_auto_approve");
        assert!(gate.quota().approved_this_hour(&p.dedup_hash, t(9, 59)));
        assert!(!gate.quota().approved_this_hour(&p.dedup_hash, t(10, 0)));
    }

    #[test]
    fn test_high_severity_never_auto_approved() {
        let mut gate = gate(10, t(9, 0));
        for severity in [Severity::High, Severity::Critical] {
            let mut p = proposal(Category::CacheTuning, severity, 1.0);
            p.description = "fix error".into();
            assert!(!gate.try_auto_approve(&p, t(9, 0)).approved);
        }
        assert_eq!(gate.quota().total(t(9, 0)), 0);
    }

    #[test]
    fn test_rule_quota_caps_per_hour() {
        let mut gate = gate(100, t(9, 0));
        let approved = (0..8)
            .filter(|_| {
                let p = proposal(Category::CacheTuning, Severity::Low, 0.95);
                gate.try_auto_approve(&p, t(9, 30)).approved
            })
            .count();
        assert_eq!(approved, 5);

        // A new hour bucket resets the counters
        let p = proposal(Category::CacheTuning, Severity::Low, 0.95);
        assert!(gate.try_auto_approve(&p, t(10, 0)).approved);
    }

    #[test]
    fn test_global_cap_checked_before_rules() {
        let mut gate = gate(3, t(9, 0));
        for _ in 0..3 {
            let p = proposal(Category::CacheTuning, Severity::Low, 0.95);
            assert!(gate.try_auto_approve(&p, t(9, 10)).approved);
        }
        let p = proposal(Category::CacheTuning, Severity::Low, 0.95);
        let decision = gate.try_auto_approve(&p, t(9, 20));
        assert!(!decision.approved);
        assert!(decision.reason.contains("global"));
    }

    #[test]
    fn test_falls_through_to_next_rule() {
        let mut gate = gate(100, t(9, 0));
        let mut p = proposal(Category::PerfTuning, Severity::Medium, 0.95);
        p.description = "fix timeout error".into();
        assert_eq!(
            gate.try_auto_approve(&p, t(9, 0)).rule_name.as_deref(),
            Some("critical_fixes")
        );
        let mut q = p.clone();
        q.dedup_hash = "other".into();
        let decision = gate.try_auto_approve(&q, t(9, 0) + TimeDelta::minutes(5));
        assert!(!decision.approved);
        assert_eq!(decision.reason, "matching rule quota exhausted");
    }

    #[test]
    fn test_disabled_gate() {
        let mut policy = GatePolicy::from_config(&ControllerConfig::default());
        policy.enabled = false;
        let mut gate = gate_with(policy, t(9, 0));
        let p = proposal(Category::CacheTuning, Severity::Low, 0.95);
        assert!(!gate.try_auto_approve(&p, t(9, 0)).approved);
    }

    #[test]
    fn test_daily_limit_spans_hours() {
        // Default policy: 3 per hour, 5 per day
        let mut gate = gate_with(GatePolicy::from_config(&ControllerConfig::default()), t(8, 0));
        let mut approve = |at| {
            let p = proposal(Category::CacheTuning, Severity::Low, 0.95);
            gate.try_auto_approve(&p, at)
        };
        for _ in 0..3 {
            assert!(approve(t(8, 10)).approved);
        }
        assert!(approve(t(9, 10)).approved);
        assert!(approve(t(10, 10)).approved);

        let decision = approve(t(11, 10));
        assert!(!decision.approved);
        assert_eq!(decision.reason, "daily auto-approval limit reached");

        // Resets at UTC midnight
        let tomorrow = t(11, 10) + TimeDelta::days(1);
        assert!(approve(tomorrow).approved);
    }

    #[test]
    fn test_disabled_category_goes_to_review() {
        let mut policy = GatePolicy::from_config(&ControllerConfig::default());
        policy.categories.cache.enabled = false;
        let mut gate = gate_with(policy, t(9, 0));

        let p = proposal(Category::CacheTuning, Severity::Low, 0.95);
        let decision = gate.try_auto_approve(&p, t(9, 0));
        assert!(!decision.approved);
        assert_eq!(decision.reason, "cache proposals are disabled for auto-approval");
        assert_eq!(gate.quota().total(t(9, 0)), 0);

        let mut q = proposal(Category::ConfigUpdate, Severity::Medium, 0.95);
        q.description = "fix startup error".into();
        assert!(gate.try_auto_approve(&q, t(9, 0)).approved);
    }
}
