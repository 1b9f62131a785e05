//! Application configuration module
//!
//! Process settings come from environment variables (with `.env` support).
//! Controller policy lives in a JSON document under the data directory and is
//! merged with defaults at the top level only: a section present in the file
//! replaces the default section wholesale.

use crate::proposal::Category;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};
use validator::Validate;

#[derive(Error, Debug)]
#[allow(dead_code)]
pub enum ConfigError {
    #[error("Failed to load environment variables: {0}")]
    EnvLoad(#[from] dotenvy::Error),

    #[error("Missing required environment variable: {0}")]
    MissingVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Failed to read or write configuration file: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ConfigError> for crate::error::AppError {
    fn from(err: ConfigError) -> Self {
        crate::error::AppError::Config(err.to_string())
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: Ipv4Addr,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::new(0, 0, 0, 0), // Bind to 0.0.0.0 for Docker
            port: 3000,
        }
    }
}

/// CORS configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["http://localhost:3001".to_string()],
        }
    }
}

/// Filesystem locations used by the controller
#[derive(Debug, Clone)]
pub struct PathsConfig {
    /// Root that target resources (JSON documents) are resolved against
    pub config_dir: PathBuf,
    /// Backups, audit log and controller config live here
    pub data_dir: PathBuf,
    /// Spool directory drained by the analyzer poll task
    pub signal_inbox: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("./config"),
            data_dir: PathBuf::from("./data"),
            signal_inbox: None,
        }
    }
}

impl PathsConfig {
    pub fn backups_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }

    pub fn audit_log(&self) -> PathBuf {
        self.data_dir.join("audit").join("decisions.jsonl")
    }

    pub fn controller_config(&self) -> PathBuf {
        self.data_dir.join("controller_config.json")
    }
}

/// Complete application settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub cors: CorsConfig,
    pub paths: PathsConfig,
}

impl Settings {
    /// Load settings from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if it exists (ignore errors if file not found)
        let _ = dotenvy::dotenv();

        let server = ServerConfig {
            host: std::env::var("HOST")
                .ok()
                .and_then(|h| h.parse().ok())
                .unwrap_or_else(|| ServerConfig::default().host),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or_else(|| ServerConfig::default().port),
        };

        let cors = CorsConfig {
            allowed_origins: std::env::var("ALLOWED_ORIGINS")
                .ok()
                .map(|s| s.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_else(|| CorsConfig::default().allowed_origins),
        };

        let defaults = PathsConfig::default();
        let paths = PathsConfig {
            config_dir: std::env::var("AUTOTUNE_CONFIG_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.config_dir),
            data_dir: std::env::var("AUTOTUNE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            signal_inbox: std::env::var("AUTOTUNE_SIGNAL_INBOX").ok().map(PathBuf::from),
        };

        if paths.config_dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue(
                "AUTOTUNE_CONFIG_DIR must not be empty".to_string(),
            ));
        }

        Ok(Self { server, cors, paths })
    }
}

// ==================== Controller policy ====================

/// Longest rollback window an update may ask for (one week)
pub const MAX_ROLLBACK_TIMEOUT_MINUTES: i64 = 10_080;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct InterfaceConfig {
    /// Pending proposal lifetime
    #[validate(range(min = 1, max = 8760))]
    pub confirmation_timeout_hours: i64,
    #[validate(range(min = 1, max = 10_000))]
    pub max_pending_proposals: usize,
    /// How far Defer pushes the expiry out
    #[validate(range(min = 1, max = 8760))]
    pub defer_hours: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AutoApprovalConfig {
    pub enabled: bool,
    pub low_risk_auto_approve: bool,
    pub performance_improvement_threshold: f64,
    /// Global cap across all rules, per clock hour
    pub max_auto_approve_per_hour: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SafetyConfig {
    pub require_validation: bool,
    pub auto_rollback_overdue: bool,
    #[validate(range(min = 1, max = 64))]
    pub max_concurrent_updates: usize,
    #[validate(range(min = 1, max = 3650))]
    pub backup_retention_days: i64,
    #[validate(range(min = 1, max = 10_080))]
    pub rollback_timeout_minutes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ValidationConfig {
    pub strict_mode: bool,
    pub business_logic_checks: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SafetyLimits {
    #[validate(range(min = 1.0))]
    pub max_cache_size_mb: f64,
    #[validate(range(min = 1))]
    pub frequent_alert_threshold: u32,
    pub degraded_efficiency_score: f64,
    /// Auto-approvals allowed per UTC day, across all rules
    pub max_daily_optimizations: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ScheduleConfig {
    #[validate(range(min = 1, max = 10_080))]
    pub analysis_interval_minutes: u64,
    #[validate(range(min = 1, max = 604_800))]
    pub rollback_check_interval_secs: u64,
    #[validate(range(min = 1, max = 604_800))]
    pub expiry_sweep_interval_secs: u64,
    #[validate(range(min = 1, max = 604_800))]
    pub retention_sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CategoryToggle {
    pub enabled: bool,
}

/// Per-family switches; a disabled family is never auto-approved
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Validate)]
pub struct CategoryToggles {
    pub cache: CategoryToggle,
    pub thresholds: CategoryToggle,
    pub config: CategoryToggle,
    pub resources: CategoryToggle,
}

impl CategoryToggles {
    pub fn family(category: Category) -> &'static str {
        match category {
            Category::CacheTuning => "cache",
            Category::ThresholdAdjust | Category::AlertRuleUpdate => "thresholds",
            Category::ConfigUpdate => "config",
            Category::ResourceRealloc | Category::PerfTuning => "resources",
        }
    }

    pub fn enabled_for(&self, category: Category) -> bool {
        match Self::family(category) {
            "cache" => self.cache.enabled,
            "thresholds" => self.thresholds.enabled,
            "config" => self.config.enabled,
            _ => self.resources.enabled,
        }
    }
}

/// Which resource each signal family targets
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ResourceMap {
    #[validate(length(min = 1))]
    pub monitor: String,
    #[validate(length(min = 1))]
    pub alerts: String,
    #[validate(length(min = 1))]
    pub servers: String,
}

/// Controller policy knobs
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ControllerConfig {
    #[validate(nested)]
    pub interface: InterfaceConfig,
    #[validate(nested)]
    pub auto_approval: AutoApprovalConfig,
    #[validate(nested)]
    pub safety: SafetyConfig,
    #[validate(nested)]
    pub validation: ValidationConfig,
    #[validate(nested)]
    pub limits: SafetyLimits,
    #[validate(nested)]
    pub schedule: ScheduleConfig,
    #[validate(nested)]
    pub resources: ResourceMap,
    #[validate(nested)]
    pub categories: CategoryToggles,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            interface: InterfaceConfig {
                confirmation_timeout_hours: 24,
                max_pending_proposals: 10,
                defer_hours: 24,
            },
            auto_approval: AutoApprovalConfig {
                enabled: true,
                low_risk_auto_approve: true,
                performance_improvement_threshold: 15.0,
                max_auto_approve_per_hour: 3,
            },
            safety: SafetyConfig {
                require_validation: true,
                auto_rollback_overdue: true,
                max_concurrent_updates: 3,
                backup_retention_days: 30,
                rollback_timeout_minutes: 30,
            },
            validation: ValidationConfig {
                strict_mode: true,
                business_logic_checks: true,
            },
            limits: SafetyLimits {
                max_cache_size_mb: 500.0,
                frequent_alert_threshold: 5,
                degraded_efficiency_score: 70.0,
                max_daily_optimizations: 5,
            },
            schedule: ScheduleConfig {
                analysis_interval_minutes: 30,
                rollback_check_interval_secs: 60,
                expiry_sweep_interval_secs: 300,
                retention_sweep_interval_secs: 3600,
            },
            resources: ResourceMap {
                monitor: "monitoring/mcp_monitor_config.json".to_string(),
                alerts: "monitoring/alert_config.json".to_string(),
                servers: ".mcp.json".to_string(),
            },
            categories: CategoryToggles {
                cache: CategoryToggle { enabled: true },
                thresholds: CategoryToggle { enabled: true },
                config: CategoryToggle { enabled: true },
                resources: CategoryToggle { enabled: true },
            },
        }
    }
}

const SECTIONS: [&str; 8] = [
    "interface",
    "auto_approval",
    "safety",
    "validation",
    "limits",
    "schedule",
    "resources",
    "categories",
];

impl ControllerConfig {
    /// Parse a config document, filling in missing top-level sections.
    ///
    /// Sections are not deep-merged. A section that is present but incomplete
    /// is rejected with an error naming it.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let loaded: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        let serde_json::Value::Object(mut merged) = loaded else {
            return Err(ConfigError::InvalidValue(
                "controller config must be a JSON object".to_string(),
            ));
        };

        let defaults = serde_json::to_value(Self::default())
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        if let serde_json::Value::Object(defaults) = defaults {
            for (key, value) in defaults {
                merged.entry(key).or_insert(value);
            }
        }

        let config = Self {
            interface: section(&merged, "interface")?,
            auto_approval: section(&merged, "auto_approval")?,
            safety: section(&merged, "safety")?,
            validation: section(&merged, "validation")?,
            limits: section(&merged, "limits")?,
            schedule: section(&merged, "schedule")?,
            resources: section(&merged, "resources")?,
            categories: section(&merged, "categories")?,
        };

        for key in merged.keys() {
            if !SECTIONS.contains(&key.as_str()) {
                warn!("Ignoring unknown controller config section '{}'", key);
            }
        }

        config
            .validate()
            .map_err(|e| ConfigError::InvalidValue(e.to_string()))?;
        Ok(config)
    }

    /// Load the config file, writing the defaults on first run
    pub fn load_or_init(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            let config = Self::default();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let text = serde_json::to_string_pretty(&config)
                .map_err(|e| ConfigError::ParseError(e.to_string()))?;
            std::fs::write(path, text)?;
            info!("Wrote default controller config to {}", path.display());
            return Ok(config);
        }

        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}

fn section<T: DeserializeOwned>(
    doc: &serde_json::Map<String, serde_json::Value>,
    name: &str,
) -> Result<T, ConfigError> {
    let value = doc
        .get(name)
        .cloned()
        .ok_or_else(|| ConfigError::MissingVar(name.to_string()))?;
    serde_json::from_value(value)
        .map_err(|e| ConfigError::InvalidValue(format!("section '{}': {}", name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_server_config() {
        let config = ServerConfig::default();
        assert_eq!(config.host, Ipv4Addr::new(0, 0, 0, 0));
        assert_eq!(config.port, 3000);
    }

    #[test]
    fn test_controller_defaults() {
        let config = ControllerConfig::default();
        assert_eq!(config.safety.max_concurrent_updates, 3);
        assert_eq!(config.safety.rollback_timeout_minutes, 30);
        assert_eq!(config.safety.backup_retention_days, 30);
        assert_eq!(config.interface.max_pending_proposals, 10);
        assert_eq!(config.auto_approval.max_auto_approve_per_hour, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_sections_filled_from_defaults() {
        let text = r#"{
            "safety": {
                "require_validation": true,
                "auto_rollback_overdue": false,
                "max_concurrent_updates": 5,
                "backup_retention_days": 7,
                "rollback_timeout_minutes": 10
            }
        }"#;
        let config = ControllerConfig::from_json_str(text).unwrap();
        assert_eq!(config.safety.max_concurrent_updates, 5);
        assert_eq!(config.safety.backup_retention_days, 7);
        assert_eq!(config.interface.confirmation_timeout_hours, 24);
        assert_eq!(config.resources.alerts, "monitoring/alert_config.json");
    }

    #[test]
    fn test_partial_section_is_not_deep_merged() {
        // Top-level merge only: an incomplete section does not inherit defaults.
        let text = r#"{ "safety": { "max_concurrent_updates": 5 } }"#;
        let err = ControllerConfig::from_json_str(text).unwrap_err();
        assert!(err.to_string().contains("section 'safety'"), "{}", err);
    }

    #[test]
    fn test_range_validation() {
        let mut config = serde_json::to_value(ControllerConfig::default()).unwrap();
        config["safety"]["max_concurrent_updates"] = serde_json::json!(0);
        let err = ControllerConfig::from_json_str(&config.to_string()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn test_unbounded_windows_are_rejected() {
        let cases = [
            ("interface", "confirmation_timeout_hours", serde_json::json!(2_000_000_000_000i64)),
            ("interface", "defer_hours", serde_json::json!(8761)),
            ("safety", "rollback_timeout_minutes", serde_json::json!(i64::MAX)),
            ("safety", "backup_retention_days", serde_json::json!(1_000_000_000_000i64)),
            ("schedule", "rollback_check_interval_secs", serde_json::json!(u64::MAX)),
        ];
        for (section, key, value) in cases {
            let mut config = serde_json::to_value(ControllerConfig::default()).unwrap();
            config[section][key] = value;
            let err = ControllerConfig::from_json_str(&config.to_string()).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidValue(_)), "{}.{}: {}", section, key, err);
        }
    }

    #[test]
    fn test_category_families() {
        let mut toggles = ControllerConfig::default().categories;
        assert!(toggles.enabled_for(Category::PerfTuning));
        toggles.thresholds.enabled = false;
        assert!(!toggles.enabled_for(Category::ThresholdAdjust));
        assert!(!toggles.enabled_for(Category::AlertRuleUpdate));
        assert!(toggles.enabled_for(Category::CacheTuning));

        let text = r#"{ "categories": {
            "cache": {"enabled": false},
            "thresholds": {"enabled": true},
            "config": {"enabled": true},
            "resources": {"enabled": true}
        } }"#;
        let config = ControllerConfig::from_json_str(text).unwrap();
        assert!(!config.categories.enabled_for(Category::CacheTuning));
        assert_eq!(config.limits.max_daily_optimizations, 5);
    }

    #[test]
    fn test_load_or_init_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("controller_config.json");
        let first = ControllerConfig::load_or_init(&path).unwrap();
        assert!(path.exists());
        let second = ControllerConfig::load_or_init(&path).unwrap();
        assert_eq!(
            first.safety.max_concurrent_updates,
            second.safety.max_concurrent_updates
        );
    }
}
