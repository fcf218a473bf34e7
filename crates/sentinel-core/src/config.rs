//! C2: Config store.
//!
//! Loads/saves/validates a JSON config across seven sections: monitoring,
//! detection, response, integrity, shadow, database, logging. Plain
//! `serde`/`serde_json` persistence, no config-management crate.

use crate::audit::AuditChain;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    pub max_events_per_batch: usize,
    pub event_retention_hours: u64,
    pub ring_capacity: usize,
    pub dedup_window_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionThresholds {
    pub low_risk_threshold: f64,
    pub medium_risk_threshold: f64,
    pub high_risk_threshold: f64,
    pub deviation_threshold_sigma: f64,
    pub connection_frequency_multiplier: f64,
    pub session_duration_multiplier: f64,
    pub learning_window_hours: u64,
    pub min_learning_events: u64,
    pub min_persistence_indicators: u32,
    pub min_sequence_events: u32,
    pub correlation_window_seconds: u64,
    pub sequence_timeout_seconds: u64,
}

impl Default for DetectionThresholds {
    fn default() -> Self {
        Self {
            low_risk_threshold: 0.3,
            medium_risk_threshold: 0.6,
            high_risk_threshold: 0.8,
            deviation_threshold_sigma: 2.5,
            connection_frequency_multiplier: 4.0,
            session_duration_multiplier: 6.0,
            learning_window_hours: 72,
            min_learning_events: 100,
            min_persistence_indicators: 2,
            min_sequence_events: 2,
            correlation_window_seconds: 300,
            sequence_timeout_seconds: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    pub enabled: bool,
    pub thresholds: DetectionThresholds,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseConfig {
    pub auto_response_enabled: bool,
    pub max_actions_per_minute: u32,
    pub credential_rotation_enabled: bool,
    pub session_termination_enabled: bool,
    pub component_isolation_enabled: bool,
    pub backup_activation_enabled: bool,
    pub credential_rollback_deadline_minutes: u32,
    pub backup_endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityConfig {
    pub enabled: bool,
    pub verification_interval_seconds: u64,
    pub auto_restore: bool,
    pub watched_paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowConfig {
    pub enabled: bool,
    pub heartbeat_interval_seconds: u64,
    pub primary_health_check_interval_seconds: u64,
    pub failover_timeout_seconds: u64,
    pub audit_log_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub connection_timeout_seconds: u64,
    pub query_timeout_seconds: u64,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentinelConfig {
    pub monitoring: MonitoringConfig,
    pub detection: DetectionConfig,
    pub response: ResponseConfig,
    pub integrity: IntegrityConfig,
    pub shadow: ShadowConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

impl SentinelConfig {
    pub fn secure_defaults() -> Self {
        Self {
            monitoring: MonitoringConfig {
                enabled: true,
                interval_seconds: 30,
                max_events_per_batch: 1000,
                event_retention_hours: 48,
                ring_capacity: 50_000,
                dedup_window_seconds: 5,
            },
            detection: DetectionConfig {
                enabled: true,
                thresholds: DetectionThresholds::default(),
            },
            response: ResponseConfig {
                auto_response_enabled: true,
                max_actions_per_minute: 10,
                credential_rotation_enabled: true,
                session_termination_enabled: true,
                component_isolation_enabled: true,
                backup_activation_enabled: true,
                credential_rollback_deadline_minutes: 30,
                backup_endpoint: None,
            },
            integrity: IntegrityConfig {
                enabled: true,
                verification_interval_seconds: 300,
                auto_restore: true,
                watched_paths: Vec::new(),
            },
            shadow: ShadowConfig {
                enabled: true,
                heartbeat_interval_seconds: 60,
                primary_health_check_interval_seconds: 30,
                failover_timeout_seconds: 120,
                audit_log_path: PathBuf::from("shadow_audit.log"),
            },
            database: DatabaseConfig {
                host: "localhost".to_string(),
                port: 3306,
                database: "monitored_db".to_string(),
                user: "sentinel_svc".to_string(),
                connection_timeout_seconds: 30,
                query_timeout_seconds: 60,
                max_connections: 10,
            },
            logging: LoggingConfig {
                level: "INFO".to_string(),
                json: false,
            },
        }
    }

    /// Required-field presence and numeric range checks.
    pub fn validate(&self) -> (bool, Vec<String>) {
        let mut errors = Vec::new();

        if self.monitoring.interval_seconds == 0 {
            errors.push("monitoring.interval_seconds must be positive".to_string());
        }

        if self.database.host.is_empty() {
            errors.push("database.host is required".to_string());
        }
        if self.database.database.is_empty() {
            errors.push("database.database is required".to_string());
        }
        if self.database.user.is_empty() {
            errors.push("database.user is required".to_string());
        }
        if self.database.port == 0 {
            errors.push("database.port must be a valid port number (1-65535)".to_string());
        }

        for (name, value) in [
            ("low_risk_threshold", self.detection.thresholds.low_risk_threshold),
            ("medium_risk_threshold", self.detection.thresholds.medium_risk_threshold),
            ("high_risk_threshold", self.detection.thresholds.high_risk_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                errors.push(format!("detection.thresholds.{name} must be between 0 and 1"));
            }
        }

        if self.response.max_actions_per_minute == 0 {
            errors.push("response.max_actions_per_minute must be positive".to_string());
        }

        let valid_levels = ["DEBUG", "INFO", "WARN", "ERROR"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            errors.push(format!("logging.level must be one of: {valid_levels:?}"));
        }

        (errors.is_empty(), errors)
    }
}

pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Never fails the caller: a missing file gets defaults persisted
    /// back; a file that fails validation logs and falls back to
    /// defaults. Only IO/parse errors unrelated to content propagate.
    pub fn load(&self) -> Result<SentinelConfig, ConfigError> {
        if !self.path.exists() {
            let defaults = SentinelConfig::secure_defaults();
            self.save(&defaults)?;
            return Ok(defaults);
        }

        let raw = std::fs::read_to_string(&self.path)?;
        let parsed: Result<SentinelConfig, _> = serde_json::from_str(&raw);

        match parsed {
            Ok(cfg) => {
                let (ok, errors) = cfg.validate();
                if ok {
                    Ok(cfg)
                } else {
                    tracing::warn!(?errors, "config failed validation, falling back to secure defaults");
                    Ok(SentinelConfig::secure_defaults())
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "config is not valid json, falling back to secure defaults");
                Ok(SentinelConfig::secure_defaults())
            }
        }
    }

    pub fn save(&self, config: &SentinelConfig) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(config)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }

    /// Save and record a `config_access` audit entry via C1.
    pub async fn save_audited(
        &self,
        config: &SentinelConfig,
        audit: &AuditChain,
    ) -> Result<(), ConfigError> {
        self.save(config)?;
        let _ = audit
            .append(json!({"kind": "config_access", "action": "save", "path": self.path}))
            .await;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_writes_and_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("config.json"));
        let cfg = store.load().unwrap();
        assert!(cfg.monitoring.enabled);
        assert!(store.path().exists());
    }

    #[test]
    fn invalid_json_falls_back_to_defaults_without_crashing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not valid json").unwrap();
        let store = ConfigStore::new(path);
        let cfg = store.load().unwrap();
        assert!(cfg.monitoring.enabled);
    }

    #[test]
    fn validate_flags_bad_thresholds() {
        let mut cfg = SentinelConfig::secure_defaults();
        cfg.detection.thresholds.high_risk_threshold = 1.5;
        let (ok, errors) = cfg.validate();
        assert!(!ok);
        assert!(errors.iter().any(|e| e.contains("high_risk_threshold")));
    }
}
