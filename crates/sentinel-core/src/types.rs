//! Shared data model for the monitoring pipeline.
//!
//! These types are produced and consumed across crate boundaries
//! (observe -> events -> detect -> respond/alert -> shadow), so they
//! live in `sentinel-core` rather than in any one stage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use uuid::Uuid;

/// A component of the protected database surface that an event, a
/// detection, or a lockdown can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetComponent {
    Database,
    UserAccount,
    PerfSchema,
    AuditLog,
    MonitoringService,
}

/// Severity used both by `ThreatDetection` and, 1:1, by `Alert::priority`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Aggregate score contribution.
    pub fn aggregate_weight(self) -> f64 {
        match self {
            Severity::Low => 0.1,
            Severity::Medium => 0.4,
            Severity::High => 0.7,
            Severity::Critical => 1.0,
        }
    }
}

pub type AlertPriority = Severity;

/// Typed subset of event details the pipeline reasons about directly,
/// with room for detector-specific extras in `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventDetails {
    pub query: Option<String>,
    pub command: Option<String>,
    pub database: Option<String>,
    pub duration: Option<f64>,
    pub rows_sent: Option<u64>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// An observation about the protected database, created by C4 only and
/// immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfrastructureEvent {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub source_ip: String,
    pub principal: String,
    pub target_component: TargetComponent,
    pub details: EventDetails,
    pub risk_score: f64,
    /// HMAC(secret, canonical(self minus this field)). See
    /// `sentinel_core::audit::hmac_hex`.
    pub integrity_hash: String,
}

impl InfrastructureEvent {
    /// Build an event and stamp its `integrity_hash` over the canonical
    /// JSON of every other field. Producers (C4, and any simulation
    /// harness) should always go through this rather than constructing
    /// the struct literal directly.
    pub fn new(
        event_type: impl Into<String>,
        source_ip: impl Into<String>,
        principal: impl Into<String>,
        target_component: TargetComponent,
        details: EventDetails,
        risk_score: f64,
        secret: &crate::secret::HmacSecret,
    ) -> Self {
        let mut event = Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event_type: event_type.into(),
            source_ip: source_ip.into(),
            principal: principal.into(),
            target_component,
            details,
            risk_score,
            integrity_hash: String::new(),
        };
        event.integrity_hash = event.compute_hash(secret);
        event
    }

    fn compute_hash(&self, secret: &crate::secret::HmacSecret) -> String {
        let canonical = serde_json::to_string(&(
            &self.event_id,
            &self.timestamp,
            &self.event_type,
            &self.source_ip,
            &self.principal,
            &self.target_component,
            &self.details,
            self.risk_score,
        ))
        .expect("event fields always serialize");
        crate::audit::hmac_hex(secret, canonical.as_bytes())
    }

    /// Recompute and compare against the stored `integrity_hash`, used
    /// by the shadow monitor's independent cross-check (C13).
    pub fn verify_integrity(&self, secret: &crate::secret::HmacSecret) -> bool {
        self.compute_hash(secret) == self.integrity_hash
    }

    /// A stable fingerprint used by C5 for duplicate suppression:
    /// `event_type|source_ip|principal|target_component`.
    pub fn fingerprint(&self) -> String {
        format!(
            "{}|{}|{}|{:?}",
            self.event_type, self.source_ip, self.principal, self.target_component
        )
    }
}

/// A detector's finding. Created by C6/C7/C8/C9, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatDetection {
    pub detection_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub threat_type: String,
    pub severity: Severity,
    pub affected_components: BTreeSet<TargetComponent>,
    pub indicators: HashMap<String, serde_json::Value>,
    pub confidence: f64,
    pub recommended_actions: Vec<String>,
    /// event_ids that contributed; every id must have previously been
    /// stored in C5's history (invariant checked by the correlator's
    /// callers, not re-verified here).
    pub evidence_chain: Vec<Uuid>,
}

/// Alert lifecycle state machine: NEW -> ACK -> RESOLVED, or
/// NEW -> ESCALATED -> (ACK | RESOLVED). Once RESOLVED no further
/// mutation is permitted except archival.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertStatus {
    New,
    Ack,
    InProgress,
    Resolved,
    Escalated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub priority: AlertPriority,
    pub status: AlertStatus,
    pub source_detection_id: Uuid,
    pub source_event_ids: Vec<Uuid>,
    pub acked_by: Option<String>,
    pub acked_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub escalation_count: u32,
    pub last_escalated_at: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, AlertStatus::Resolved)
    }
}

/// Response action kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Isolate,
    RotateCredentials,
    SwitchBackup,
    Lockdown,
    Unlock,
    Rollback,
}

/// A record of an action attempt. Immutable after completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseAction {
    pub action_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub action_type: ActionType,
    pub target: String,
    pub parameters: HashMap<String, serde_json::Value>,
    pub success: bool,
    pub rollback_token: Option<String>,
    pub error_message: Option<String>,
}

/// Rolling per-(principal, source_ip) behavioral statistics. Mutated
/// only by C6 (single-writer); read by C6's own analysis only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineProfile {
    pub principal: String,
    pub source_ip: String,
    pub typical_hosts: HashSet<String>,
    pub active_hours: HashSet<u8>,
    pub active_days: HashSet<u8>,
    pub connection_frequency_per_hour: f64,
    pub mean_session_duration: f64,
    pub stddev_session_duration: f64,
    pub max_concurrent_sessions: u32,
    pub command_frequency: HashMap<String, u64>,
    pub profile_start: DateTime<Utc>,
    pub profile_end: DateTime<Utc>,
    pub event_count: u64,
}

impl BaselineProfile {
    pub fn new(principal: impl Into<String>, source_ip: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            principal: principal.into(),
            source_ip: source_ip.into(),
            typical_hosts: HashSet::new(),
            active_hours: HashSet::new(),
            active_days: HashSet::new(),
            connection_frequency_per_hour: 0.0,
            mean_session_duration: 0.0,
            stddev_session_duration: 0.0,
            max_concurrent_sessions: 0,
            command_frequency: HashMap::new(),
            profile_start: now,
            profile_end: now,
            event_count: 0,
        }
    }

    /// Maturity invariant: enough longitudinal and categorical
    /// diversity to trust the baseline for low/medium confidence
    /// anomaly emission.
    pub fn is_mature(&self, learning_window: chrono::Duration, min_events: u64) -> bool {
        (self.profile_end - self.profile_start) >= learning_window
            && !self.typical_hosts.is_empty()
            && self.active_hours.len() >= 2
            && !self.command_frequency.is_empty()
            && self.event_count >= min_events
    }
}

/// A correlated run of detections sharing actor and technique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttackSequence {
    pub sequence_id: Uuid,
    pub attack_type: String,
    /// detection_ids that are members of this sequence, ordered by
    /// detection timestamp.
    pub events: Vec<Uuid>,
    pub source_ips: HashSet<String>,
    pub target_components: HashSet<TargetComponent>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Rolling average of member confidences.
    pub confidence: f64,
}

/// Overall protection posture, mutated only by C11.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmergencyLevel {
    #[default]
    None,
    Elevated,
    High,
    Critical,
    Lockdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnlockConditions {
    pub timeout_minutes: Option<u32>,
    pub threat_resolved: bool,
    pub manual_unlock: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockdownRecord {
    pub lockdown_id: Uuid,
    pub components: BTreeSet<TargetComponent>,
    pub started_at: DateTime<Utc>,
    pub unlock_conditions: UnlockConditions,
    pub unlocked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentThreatRecord {
    pub threat_key: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub count: u32,
    pub remediation_attempts: u32,
    pub escalated: bool,
}

impl PersistentThreatRecord {
    pub fn persistence_score(&self) -> f64 {
        (self.count as f64 * 0.2).min(1.0)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmergencyState {
    pub level: EmergencyLevel,
    pub active_lockdowns: HashMap<Uuid, LockdownRecord>,
    pub persistent_threats: HashMap<String, PersistentThreatRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baseline_immature_without_two_active_hours() {
        let now = Utc::now();
        let mut profile = BaselineProfile::new("svc", "10.0.0.1", now - chrono::Duration::hours(100));
        profile.profile_end = now;
        profile.typical_hosts.insert("10.0.0.1".into());
        profile.active_hours.insert(3);
        profile.command_frequency.insert("SELECT".into(), 50);
        profile.event_count = 200;
        assert!(!profile.is_mature(chrono::Duration::hours(72), 100));
    }

    #[test]
    fn baseline_mature_with_full_diversity() {
        let now = Utc::now();
        let mut profile = BaselineProfile::new("svc", "10.0.0.1", now - chrono::Duration::hours(100));
        profile.profile_end = now;
        profile.typical_hosts.insert("10.0.0.1".into());
        profile.active_hours.insert(3);
        profile.active_hours.insert(14);
        profile.command_frequency.insert("SELECT".into(), 50);
        profile.event_count = 150;
        assert!(profile.is_mature(chrono::Duration::hours(72), 100));
    }

    #[test]
    fn severity_aggregate_weights_match_spec() {
        assert_eq!(Severity::Critical.aggregate_weight(), 1.0);
        assert_eq!(Severity::High.aggregate_weight(), 0.7);
        assert_eq!(Severity::Medium.aggregate_weight(), 0.4);
        assert_eq!(Severity::Low.aggregate_weight(), 0.1);
    }
}
