//! Proposal factory
//!
//! Turns analyzer signals into optimization proposals. Classification is
//! threshold based; a signal that does not cross any threshold produces
//! nothing.

use crate::config::{ResourceMap, SafetyLimits};
use crate::error::AppError;
use crate::proposal::changes::{dedup_hash, validate_change_set, ChangeOp};
use crate::proposal::models::{Category, OptimizationProposal, ProposalState, Severity};
use crate::proposal::signal::{
    AlertFrequency, AnalyzerRecommendation, CacheStats, ImprovementSignal, PerformanceTrend,
    TrendDirection,
};
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::BTreeMap;
use tracing::debug;
use uuid::Uuid;

/// Everything the factory decides about a signal, before ids and timestamps
struct Draft {
    category: Category,
    severity: Severity,
    title: String,
    description: String,
    rationale: String,
    target_resource: String,
    change_set: Vec<ChangeOp>,
    estimated_impact: BTreeMap<String, f64>,
    confidence: f64,
}

pub struct ProposalFactory {
    ttl: TimeDelta,
    limits: SafetyLimits,
    resources: ResourceMap,
}

impl ProposalFactory {
    pub fn new(ttl: TimeDelta, limits: SafetyLimits, resources: ResourceMap) -> Self {
        Self { ttl, limits, resources }
    }

    /// Build a proposal from a signal, or `None` if the signal warrants no change
    pub fn create(
        &self,
        signal: &ImprovementSignal,
        now: DateTime<Utc>,
    ) -> Result<Option<OptimizationProposal>, AppError> {
        let draft = match signal {
            ImprovementSignal::CacheEfficiency(stats) => self.from_cache_stats(stats),
            ImprovementSignal::AlertFrequency(alerts) => self.from_alert_frequency(alerts),
            ImprovementSignal::PerformanceTrend(trend) => self.from_performance_trend(trend),
            ImprovementSignal::Recommendation(rec) => self.from_recommendation(rec),
        };

        let Some(draft) = draft else {
            debug!("{} signal did not cross any threshold", signal.kind());
            return Ok(None);
        };
        if draft.change_set.is_empty() {
            return Ok(None);
        }
        validate_change_set(&draft.change_set)?;

        let hash = dedup_hash(draft.category.as_str(), &draft.title, &draft.change_set);
        Ok(Some(OptimizationProposal {
            id: Uuid::new_v4(),
            category: draft.category,
            severity: draft.severity,
            backup_hint: backup_hint(&draft.target_resource),
            risk_assessment: risk_assessment(draft.severity, draft.category),
            title: draft.title,
            description: draft.description,
            rationale: draft.rationale,
            target_resource: draft.target_resource,
            change_set: draft.change_set,
            estimated_impact: draft.estimated_impact,
            confidence_score: draft.confidence.clamp(0.0, 1.0),
            dedup_hash: hash,
            created_at: now,
            expires_at: now + self.ttl,
            state: ProposalState::Created,
            decision_reason: None,
            update_id: None,
        }))
    }

    fn from_cache_stats(&self, stats: &CacheStats) -> Option<Draft> {
        let max = self.limits.max_cache_size_mb;

        if stats.hit_rate > 0.8 && stats.space_efficiency > 0.9 && stats.total_size_mb < max {
            let new_size = (stats.total_size_mb * 1.5).min(max);
            return Some(Draft {
                category: Category::CacheTuning,
                severity: Severity::Low,
                title: "Expand cache size".to_string(),
                description: format!(
                    "Cache is performing well ({:.1}% hit rate) and nearly full; grow it to {} MB",
                    stats.hit_rate * 100.0,
                    new_size
                ),
                rationale: "High hit rate and space efficiency suggest more capacity will help"
                    .to_string(),
                target_resource: self.resources.monitor.clone(),
                change_set: vec![ChangeOp::set("cache.max_size_mb", new_size)],
                estimated_impact: impact(&[("cache_hit_rate", 0.05), ("response_time", -0.5)]),
                confidence: 0.85,
            });
        }

        if stats.hit_rate < 0.3 && stats.total_entries > 50 {
            return Some(Draft {
                category: Category::CacheTuning,
                severity: Severity::Low,
                title: "Clean up inefficient cache".to_string(),
                description: format!(
                    "Low hit rate ({:.1}%) across {} entries; shorten TTL and drop expired entries",
                    stats.hit_rate * 100.0,
                    stats.total_entries
                ),
                rationale: "Many entries with few hits waste memory".to_string(),
                target_resource: self.resources.monitor.clone(),
                change_set: vec![
                    ChangeOp::multiply("cache.ttl_hours", 0.5),
                    ChangeOp::set("cache.cleanup_expired", true),
                ],
                estimated_impact: impact(&[("cache_efficiency", 0.2), ("memory_usage", -20.0)]),
                confidence: 0.9,
            });
        }

        None
    }

    fn from_alert_frequency(&self, alerts: &AlertFrequency) -> Option<Draft> {
        if alerts.count < self.limits.frequent_alert_threshold {
            return None;
        }

        if alerts.alert_type == "performance_degradation" {
            return Some(Draft {
                category: Category::ThresholdAdjust,
                severity: Severity::Medium,
                title: format!("Adjust response time threshold for {}", alerts.server),
                description: format!(
                    "{} performance alerts from {}; raise the response time threshold by 20%",
                    alerts.count, alerts.server
                ),
                rationale: "Frequent alerts on the same server indicate the threshold is too tight"
                    .to_string(),
                target_resource: self.resources.alerts.clone(),
                change_set: vec![ChangeOp::multiply("thresholds.max_response_time", 1.2)],
                estimated_impact: impact(&[("alert_reduction", alerts.count as f64 * 0.7)]),
                confidence: 0.75,
            });
        }

        let key = format!("{}:{}", alerts.alert_type, alerts.server);
        Some(Draft {
            category: Category::AlertRuleUpdate,
            severity: Severity::Medium,
            title: format!("Mute repeated {} alerts for {}", alerts.alert_type, alerts.server),
            description: format!(
                "{} {} alerts from {}; add them to the muted alert rules",
                alerts.count, alerts.alert_type, alerts.server
            ),
            rationale: "Repeated identical alerts add noise without new information".to_string(),
            target_resource: self.resources.alerts.clone(),
            change_set: vec![ChangeOp::append("alert_rules.muted", key)],
            estimated_impact: impact(&[("alert_reduction", alerts.count as f64 * 0.5)]),
            confidence: 0.7,
        })
    }

    fn from_performance_trend(&self, trend: &PerformanceTrend) -> Option<Draft> {
        if trend.direction != TrendDirection::Degrading
            || trend.efficiency_score >= self.limits.degraded_efficiency_score
        {
            return None;
        }

        Some(Draft {
            category: Category::PerfTuning,
            severity: Severity::High,
            title: format!("Address performance degradation for {}", trend.server),
            description: format!(
                "{} efficiency is degrading (score {:.1}); throttle it and cap request size",
                trend.server, trend.efficiency_score
            ),
            rationale: "A degrading server with low efficiency needs load reduced".to_string(),
            target_resource: self.resources.monitor.clone(),
            change_set: vec![
                ChangeOp::set(format!("servers.{}.throttle", trend.server), true),
                ChangeOp::multiply("performance.max_tokens_per_request", 0.8),
            ],
            estimated_impact: impact(&[("efficiency_improvement", 20.0)]),
            confidence: 0.8,
        })
    }

    fn from_recommendation(&self, rec: &AnalyzerRecommendation) -> Option<Draft> {
        let description = rec.description.to_lowercase();

        let category = if description.contains("token") {
            Category::ThresholdAdjust
        } else if description.contains("cache") {
            Category::CacheTuning
        } else if description.contains("server") {
            Category::ConfigUpdate
        } else {
            Category::PerfTuning
        };

        let severity = match rec.priority {
            5.. => Severity::Critical,
            4 => Severity::High,
            3 => Severity::Medium,
            _ => Severity::Low,
        };

        let (target_resource, change_set) = match &rec.server {
            Some(server) if description.contains("token") => (
                self.resources.servers.clone(),
                vec![ChangeOp::set(format!("mcpServers.{}.token_limit", server), 800)],
            ),
            _ if description.contains("cache") => (
                self.resources.monitor.clone(),
                vec![ChangeOp::set("cache.target_hit_rate", 0.7)],
            ),
            Some(server) if description.contains("response time") => (
                self.resources.servers.clone(),
                vec![ChangeOp::set(format!("mcpServers.{}.timeout", server), 20000)],
            ),
            _ => return None,
        };

        let mut estimated_impact = rec.estimated_savings.clone();
        estimated_impact
            .entry("performance_improvement".to_string())
            .or_insert(0.0);

        Some(Draft {
            category,
            severity,
            title: format!("Auto-optimization: {}", rec.title),
            description: rec.description.clone(),
            rationale: format!("Analyzer recommendation {}", rec.id),
            target_resource,
            change_set,
            estimated_impact,
            confidence: rec.confidence,
        })
    }
}

fn impact(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

fn backup_hint(resource: &str) -> String {
    format!(
        "A checksummed backup of {} is taken before writing; roll back via the update id to restore it",
        resource
    )
}

fn risk_assessment(severity: Severity, category: Category) -> String {
    let level = match severity {
        Severity::Low => "Low risk: reversible tuning with limited blast radius",
        Severity::Medium => "Medium risk: changes alerting or thresholds operators rely on",
        Severity::High => "High risk: affects live server behaviour, review before applying",
        Severity::Critical => "Critical risk: may disrupt service, requires explicit sign-off",
    };
    format!("{} ({})", level, category.as_str())
}
