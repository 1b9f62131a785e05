//! Improvement signals
//!
//! Signals are produced by the external analyzer. They reach the controller
//! either over the API or through a [`SignalSource`] polled in the background.

use crate::error::{validation_error, AppError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    #[validate(range(min = 0.0, max = 1.0))]
    pub hit_rate: f64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub space_efficiency: f64,
    pub total_entries: u64,
    #[validate(range(min = 0.0))]
    pub total_size_mb: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AlertFrequency {
    #[validate(length(min = 1))]
    pub alert_type: String,
    #[validate(length(min = 1))]
    pub server: String,
    pub count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Improving,
    Stable,
    Degrading,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceTrend {
    #[validate(length(min = 1))]
    pub server: String,
    pub direction: TrendDirection,
    #[validate(range(min = 0.0, max = 100.0))]
    pub efficiency_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzerRecommendation {
    pub id: String,
    #[validate(length(min = 1, max = 200))]
    pub title: String,
    #[validate(length(min = 1))]
    pub description: String,
    #[validate(range(min = 1, max = 5))]
    pub priority: u8,
    pub confidence: f64,
    pub server: Option<String>,
    #[serde(default)]
    pub estimated_savings: BTreeMap<String, f64>,
}

/// One observation from the analyzer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImprovementSignal {
    CacheEfficiency(CacheStats),
    AlertFrequency(AlertFrequency),
    PerformanceTrend(PerformanceTrend),
    Recommendation(AnalyzerRecommendation),
}

impl ImprovementSignal {
    pub fn kind(&self) -> &'static str {
        match self {
            ImprovementSignal::CacheEfficiency(_) => "cache_efficiency",
            ImprovementSignal::AlertFrequency(_) => "alert_frequency",
            ImprovementSignal::PerformanceTrend(_) => "performance_trend",
            ImprovementSignal::Recommendation(_) => "recommendation",
        }
    }

    pub fn check(&self) -> Result<(), AppError> {
        let result = match self {
            ImprovementSignal::CacheEfficiency(s) => s.validate(),
            ImprovementSignal::AlertFrequency(s) => s.validate(),
            ImprovementSignal::PerformanceTrend(s) => s.validate(),
            ImprovementSignal::Recommendation(s) => s.validate(),
        };
        result.map_err(|e| validation_error(format!("Invalid {} signal: {}", self.kind(), e)))
    }
}

/// Where the background poll gets signals from
pub trait SignalSource: Send + Sync {
    fn poll(&self) -> Result<Vec<ImprovementSignal>, AppError>;
}

/// Drains `*.json` files from a spool directory.
///
/// Each file holds one signal or an array of signals. Files are removed once
/// read; unparseable files are renamed to `*.rejected` so they are not retried.
pub struct InboxSignalSource {
    dir: PathBuf,
}

impl InboxSignalSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn read_file(path: &Path) -> Result<Vec<ImprovementSignal>, AppError> {
        let text = std::fs::read_to_string(path)?;
        let value: serde_json::Value = serde_json::from_str(&text)?;
        if value.is_array() {
            Ok(serde_json::from_value(value)?)
        } else {
            Ok(vec![serde_json::from_value(value)?])
        }
    }
}

impl SignalSource for InboxSignalSource {
    fn poll(&self) -> Result<Vec<ImprovementSignal>, AppError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();

        let mut signals = Vec::new();
        for path in files {
            match Self::read_file(&path) {
                Ok(mut batch) => {
                    debug!("Read {} signal(s) from {}", batch.len(), path.display());
                    signals.append(&mut batch);
                    std::fs::remove_file(&path)?;
                }
                Err(e) => {
                    warn!("Rejecting signal file {}: {}", path.display(), e);
                    std::fs::rename(&path, path.with_extension("rejected"))?;
                }
            }
        }
        Ok(signals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_signal_wire_format() {
        let signal: ImprovementSignal = serde_json::from_value(json!({
            "kind": "cache_efficiency",
            "hitRate": 0.9,
            "spaceEfficiency": 0.95,
            "totalEntries": 120,
            "totalSizeMb": 100.0
        }))
        .unwrap();
        assert_eq!(signal.kind(), "cache_efficiency");
        assert!(signal.check().is_ok());
    }

    #[test]
    fn test_out_of_range_signal_rejected() {
        let signal = ImprovementSignal::Recommendation(AnalyzerRecommendation {
            id: "r1".into(),
            title: "t".into(),
            description: "d".into(),
            priority: 9,
            confidence: 0.5,
            server: None,
            estimated_savings: BTreeMap::new(),
        });
        assert!(matches!(signal.check(), Err(AppError::Validation(_))));
    }

    #[test]
    fn test_inbox_drains_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("a.json"),
            json!([{
                "kind": "alert_frequency",
                "alertType": "performance_degradation",
                "server": "fs",
                "count": 7
            }])
            .to_string(),
        )
        .unwrap();
        std::fs::write(dir.path().join("b.json"), "not json").unwrap();

        let source = InboxSignalSource::new(dir.path());
        let signals = source.poll().unwrap();
        assert_eq!(signals.len(), 1);
        assert!(!dir.path().join("a.json").exists());
        assert!(dir.path().join("b.rejected").exists());
        assert!(source.poll().unwrap().is_empty());
    }

    #[test]
    fn test_missing_inbox_is_empty() {
        let source = InboxSignalSource::new("/nonexistent/autotune/inbox");
        assert!(source.poll().unwrap().is_empty());
    }
}
