//! C11: emergency protection.
//!
//! Single writer of `EmergencyState`: selects an overall protection
//! level from currently-active detections, locks affected components
//! down once the level warrants it, and tracks recurring detection
//! signatures for persistent-threat remediation. Everything here is
//! audited -- callers pass an `AuditChain` reference through each
//! mutating call rather than this module owning one, since C1 is the
//! single globally-shared sink.

use chrono::{DateTime, Utc};
use sentinel_core::{
    AuditChain, EmergencyLevel, EmergencyState, LockdownRecord, PersistentThreatRecord, Severity, TargetComponent, ThreatDetection,
    UnlockConditions,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EmergencyConfig {
    pub critical_component_compromise: u32,
    pub lockdown_trigger_score: f64,
    pub critical_trigger_score: f64,
    pub high_trigger_score: f64,
    pub elevated_trigger_score: f64,
    pub default_unlock_timeout_minutes: u32,
    pub max_remediation_attempts: u32,
}

impl Default for EmergencyConfig {
    fn default() -> Self {
        Self {
            critical_component_compromise: 2,
            lockdown_trigger_score: 0.95,
            critical_trigger_score: 0.9,
            high_trigger_score: 0.7,
            elevated_trigger_score: 0.4,
            default_unlock_timeout_minutes: 60,
            max_remediation_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemediationStrategy {
    Standard,
    Enhanced,
    Aggressive,
}

impl RemediationStrategy {
    fn escalate(self) -> Self {
        match self {
            RemediationStrategy::Standard => RemediationStrategy::Enhanced,
            RemediationStrategy::Enhanced => RemediationStrategy::Aggressive,
            RemediationStrategy::Aggressive => RemediationStrategy::Aggressive,
        }
    }
}

pub struct EmergencyProtection {
    config: EmergencyConfig,
    state: Mutex<EmergencyState>,
    strategies: Mutex<HashMap<String, RemediationStrategy>>,
}

impl EmergencyProtection {
    pub fn new(config: EmergencyConfig) -> Self {
        Self {
            config,
            state: Mutex::new(EmergencyState::default()),
            strategies: Mutex::new(HashMap::new()),
        }
    }

    fn aggregate_score(detections: &[ThreatDetection]) -> f64 {
        detections.iter().map(|d| d.severity.aggregate_weight()).sum()
    }

    fn select_level(&self, detections: &[ThreatDetection]) -> EmergencyLevel {
        let critical_count = detections.iter().filter(|d| d.severity == Severity::Critical).count() as u32;
        let high_count = detections.iter().filter(|d| d.severity == Severity::High).count() as u32;
        let score = Self::aggregate_score(detections);

        if critical_count >= self.config.critical_component_compromise || score >= self.config.lockdown_trigger_score {
            EmergencyLevel::Lockdown
        } else if critical_count >= 1 || score >= self.config.critical_trigger_score {
            EmergencyLevel::Critical
        } else if high_count >= 2 || score >= self.config.high_trigger_score {
            EmergencyLevel::High
        } else if high_count >= 1 || score >= self.config.elevated_trigger_score {
            EmergencyLevel::Elevated
        } else {
            EmergencyLevel::None
        }
    }

    /// Re-evaluate the protection level from the currently-active
    /// detection set, locking down newly-affected components when the
    /// level crosses into CRITICAL/LOCKDOWN. Returns the level after
    /// evaluation.
    pub async fn evaluate(&self, detections: &[ThreatDetection], audit: &AuditChain) -> EmergencyLevel {
        let level = self.select_level(detections);
        let previous = {
            let mut state = self.state.lock().unwrap();
            let previous = state.level;
            state.level = level;
            previous
        };

        if level != previous {
            let _ = audit
                .append(json!({"kind": "emergency_level_change", "from": format!("{previous:?}"), "to": format!("{level:?}")}))
                .await;
            tracing::warn!(?previous, ?level, "emergency level changed");
        }

        if matches!(level, EmergencyLevel::Critical | EmergencyLevel::Lockdown) {
            let mut components: Vec<TargetComponent> = detections.iter().flat_map(|d| d.affected_components.iter().copied()).collect();
            if level == EmergencyLevel::Critical {
                components.push(TargetComponent::Database);
                components.push(TargetComponent::UserAccount);
            }
            self.lockdown(components, None, audit).await;
        }

        level
    }

    /// Lock down the given components, recording unlock conditions.
    /// `unlock_conditions` defaults to the configured timeout plus
    /// threat-resolved gating when not supplied.
    pub async fn lockdown(
        &self,
        components: Vec<TargetComponent>,
        unlock_conditions: Option<UnlockConditions>,
        audit: &AuditChain,
    ) -> Uuid {
        let lockdown_id = Uuid::new_v4();
        let record = LockdownRecord {
            lockdown_id,
            components: components.into_iter().collect(),
            started_at: Utc::now(),
            unlock_conditions: unlock_conditions.unwrap_or(UnlockConditions {
                timeout_minutes: Some(self.config.default_unlock_timeout_minutes),
                threat_resolved: true,
                manual_unlock: true,
            }),
            unlocked_at: None,
        };

        {
            let mut state = self.state.lock().unwrap();
            state.level = EmergencyLevel::Lockdown.max(state.level);
            state.active_lockdowns.insert(lockdown_id, record.clone());
        }

        let _ = audit
            .append(json!({"kind": "lockdown_started", "lockdown_id": lockdown_id, "components": record.components}))
            .await;
        tracing::error!(%lockdown_id, components = ?record.components, "lockdown activated");
        lockdown_id
    }

    /// Unlock a lockdown record. Succeeds if its unlock conditions are
    /// met (timeout elapsed or threat already marked resolved) or an
    /// `emergency_unlock_code` is supplied that matches `expected_code`.
    pub async fn unlock(
        &self,
        lockdown_id: Uuid,
        threat_resolved: bool,
        emergency_unlock_code: Option<&str>,
        expected_code: &str,
        audit: &AuditChain,
    ) -> Result<(), &'static str> {
        let mut state = self.state.lock().unwrap();
        let record = state.active_lockdowns.get(&lockdown_id).ok_or("unknown lockdown id")?;

        let timeout_elapsed = record
            .unlock_conditions
            .timeout_minutes
            .map(|m| Utc::now() - record.started_at >= chrono::Duration::minutes(m as i64))
            .unwrap_or(false);
        let conditions_met = (record.unlock_conditions.threat_resolved && threat_resolved) || timeout_elapsed;
        let code_valid = emergency_unlock_code.map(|c| c == expected_code).unwrap_or(false);

        if !conditions_met && !(record.unlock_conditions.manual_unlock && code_valid) {
            return Err("unlock conditions not met and no valid emergency code supplied");
        }

        let mut record = state.active_lockdowns.remove(&lockdown_id).ok_or("unknown lockdown id")?;
        record.unlocked_at = Some(Utc::now());
        if state.active_lockdowns.is_empty() {
            state.level = EmergencyLevel::None;
        }
        drop(state);

        let _ = audit.append(json!({"kind": "lockdown_unlocked", "lockdown_id": lockdown_id})).await;
        tracing::info!(%lockdown_id, "lockdown released");
        Ok(())
    }

    /// Track a recurring detection signature. Returns the updated
    /// record and, if `max_remediation_attempts` has been exhausted
    /// without resolution, flags it escalated (auto-remediation
    /// disabled for that signature going forward).
    pub fn track_persistent_threat(&self, threat_key: &str) -> PersistentThreatRecord {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();
        let record = state
            .persistent_threats
            .entry(threat_key.to_string())
            .or_insert_with(|| PersistentThreatRecord {
                threat_key: threat_key.to_string(),
                first_seen: now,
                last_seen: now,
                count: 0,
                remediation_attempts: 0,
                escalated: false,
            });
        record.count += 1;
        record.last_seen = now;
        record.clone()
    }

    /// Record one remediation attempt against a tracked threat and
    /// return the strategy to use for the *next* attempt (escalating
    /// standard -> enhanced -> aggressive).
    pub fn remediation_attempt(&self, threat_key: &str) -> RemediationStrategy {
        let mut strategies = self.strategies.lock().unwrap();
        let current = *strategies.entry(threat_key.to_string()).or_insert(RemediationStrategy::Standard);

        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.persistent_threats.get_mut(threat_key) {
            record.remediation_attempts += 1;
            if record.remediation_attempts >= self.config.max_remediation_attempts {
                record.escalated = true;
                tracing::error!(threat_key, "persistent threat escalated after exhausting remediation attempts");
            }
        }

        let next = current.escalate();
        strategies.insert(threat_key.to_string(), next);
        current
    }

    pub fn snapshot(&self) -> EmergencyState {
        self.state.lock().unwrap().clone()
    }

    pub fn level(&self) -> EmergencyLevel {
        self.state.lock().unwrap().level
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn detection(severity: Severity) -> ThreatDetection {
        ThreatDetection {
            detection_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            threat_type: "sql_injection".to_string(),
            severity,
            affected_components: [TargetComponent::Database].into_iter().collect(),
            indicators: Map::new(),
            confidence: 0.9,
            recommended_actions: Vec::new(),
            evidence_chain: vec![Uuid::new_v4()],
        }
    }

    async fn test_audit() -> (AuditChain, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.ndjson");
        let chain = AuditChain::open(path, sentinel_core::HmacSecret::generate()).await.unwrap();
        (chain, dir)
    }

    #[tokio::test]
    async fn two_critical_detections_trigger_lockdown() {
        let (audit, _dir) = test_audit().await;
        let protection = EmergencyProtection::new(EmergencyConfig::default());
        let detections = vec![detection(Severity::Critical), detection(Severity::Critical)];
        let level = protection.evaluate(&detections, &audit).await;
        assert_eq!(level, EmergencyLevel::Lockdown);
        assert!(!protection.snapshot().active_lockdowns.is_empty());
    }

    #[tokio::test]
    async fn single_high_detection_is_elevated_or_high() {
        let (audit, _dir) = test_audit().await;
        let protection = EmergencyProtection::new(EmergencyConfig::default());
        let detections = vec![detection(Severity::High)];
        let level = protection.evaluate(&detections, &audit).await;
        assert!(matches!(level, EmergencyLevel::Elevated | EmergencyLevel::High));
    }

    #[test]
    fn persistent_threat_escalates_after_max_attempts() {
        let protection = EmergencyProtection::new(EmergencyConfig {
            max_remediation_attempts: 2,
            ..EmergencyConfig::default()
        });
        protection.track_persistent_threat("sql_injection|hash1");
        protection.remediation_attempt("sql_injection|hash1");
        protection.remediation_attempt("sql_injection|hash1");
        let record = protection.snapshot().persistent_threats["sql_injection|hash1"].clone();
        assert!(record.escalated);
    }
}
