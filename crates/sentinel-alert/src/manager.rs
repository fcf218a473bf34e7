//! C12: alert manager. Maps detections to alerts, suppresses repeats,
//! escalates alerts nobody has acknowledged, and archives resolved
//! alerts for a retention window.

use crate::error::AlertError;
use crate::notifier::{ChannelConfig, Notifier};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sentinel_core::{Alert, AlertStatus, ComponentStatus, SecurityComponent, Severity, StopSignal, TargetComponent, ThreatDetection};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub enum AlertCondition {
    MinConfidence(f64),
    AffectsComponent(TargetComponent),
}

impl AlertCondition {
    fn matches(&self, detection: &ThreatDetection) -> bool {
        match self {
            AlertCondition::MinConfidence(c) => detection.confidence >= *c,
            AlertCondition::AffectsComponent(tc) => detection.affected_components.contains(tc),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotificationRule {
    pub priority_threshold: Severity,
    pub channels: Vec<String>,
    pub recipients: Vec<String>,
    pub conditions: Vec<AlertCondition>,
}

impl NotificationRule {
    fn applies(&self, detection: &ThreatDetection) -> bool {
        detection.severity >= self.priority_threshold && self.conditions.iter().all(|c| c.matches(detection))
    }
}

#[derive(Debug, Clone)]
pub struct EscalationRule {
    pub trigger_after: Duration,
    pub max_escalations: u32,
    pub targets: Vec<String>,
    pub conditions: Vec<AlertCondition>,
}

#[derive(Debug, Clone)]
pub struct AlertManagerConfig {
    pub suppression_window: Duration,
    pub archive_retention: Duration,
    pub notification_rules: Vec<NotificationRule>,
    pub escalation_rules: Vec<EscalationRule>,
    pub sweep_interval: std::time::Duration,
}

impl Default for AlertManagerConfig {
    fn default() -> Self {
        Self {
            suppression_window: Duration::minutes(5),
            archive_retention: Duration::days(30),
            notification_rules: vec![NotificationRule {
                priority_threshold: Severity::Medium,
                channels: vec!["email".to_string()],
                recipients: Vec::new(),
                conditions: Vec::new(),
            }],
            escalation_rules: vec![EscalationRule {
                trigger_after: Duration::minutes(15),
                max_escalations: 3,
                targets: Vec::new(),
                conditions: Vec::new(),
            }],
            sweep_interval: std::time::Duration::from_secs(30),
        }
    }
}

struct ActiveAlert {
    alert: Alert,
    threat_type: String,
    affected_components: BTreeSet<TargetComponent>,
    confidence: f64,
    suppressed_count: u32,
}

pub struct AlertManager {
    config: AlertManagerConfig,
    notifier: Arc<dyn Notifier>,
    active: Mutex<HashMap<Uuid, ActiveAlert>>,
    archive: Mutex<HashMap<Uuid, (Alert, DateTime<Utc>)>>,
    alerts_raised: AtomicU64,
    status: Mutex<ComponentStatus>,
}

impl AlertManager {
    pub fn new(config: AlertManagerConfig, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            config,
            notifier,
            active: Mutex::new(HashMap::new()),
            archive: Mutex::new(HashMap::new()),
            alerts_raised: AtomicU64::new(0),
            status: Mutex::new(ComponentStatus { running: false, started_at: None, cycles: 0, errors: 0, events_emitted: 0 }),
        }
    }

    fn find_suppressor(&self, active: &HashMap<Uuid, ActiveAlert>, detection: &ThreatDetection) -> Option<Uuid> {
        active.iter().find_map(|(id, a)| {
            let same_signature = a.threat_type == detection.threat_type && a.affected_components == detection.affected_components;
            let within_window = detection.timestamp - a.alert.created_at <= self.config.suppression_window;
            (same_signature && within_window).then_some(*id)
        })
    }

    /// Raise an alert for a detection. If an active alert with the same
    /// `(threat_type, affected_components)` was created within the
    /// suppression window, the new one is counted but not re-notified
    /// and the *existing* alert is returned.
    pub async fn raise(&self, detection: &ThreatDetection) -> Alert {
        let suppressor = {
            let mut active = self.active.lock().unwrap();
            let suppressor = self.find_suppressor(&active, detection);
            if let Some(id) = suppressor {
                let entry = active.get_mut(&id).unwrap();
                entry.suppressed_count += 1;
                Some(entry.alert.clone())
            } else {
                None
            }
        };
        if let Some(alert) = suppressor {
            tracing::debug!(alert_id = %alert.alert_id, threat_type = %detection.threat_type, "alert suppressed");
            return alert;
        }

        let alert = Alert {
            alert_id: Uuid::new_v4(),
            created_at: detection.timestamp,
            priority: detection.severity,
            status: AlertStatus::New,
            source_detection_id: detection.detection_id,
            source_event_ids: detection.evidence_chain.clone(),
            acked_by: None,
            acked_at: None,
            resolved_by: None,
            resolved_at: None,
            escalation_count: 0,
            last_escalated_at: None,
        };

        self.active.lock().unwrap().insert(
            alert.alert_id,
            ActiveAlert {
                alert: alert.clone(),
                threat_type: detection.threat_type.clone(),
                affected_components: detection.affected_components.clone(),
                confidence: detection.confidence,
                suppressed_count: 0,
            },
        );
        self.alerts_raised.fetch_add(1, Ordering::Relaxed);

        self.notify_matching_rules(detection, &alert, "new alert").await;
        tracing::warn!(alert_id = %alert.alert_id, priority = ?alert.priority, threat_type = %detection.threat_type, "alert raised");
        alert
    }

    async fn notify_matching_rules(&self, detection: &ThreatDetection, alert: &Alert, reason: &str) {
        for rule in &self.config.notification_rules {
            if !rule.applies(detection) {
                continue;
            }
            let subject = format!("[{:?}] {reason}: {}", alert.priority, detection.threat_type);
            let text = format!(
                "alert_id={}\npriority={:?}\nthreat_type={}\nconfidence={:.2}\ncomponents={:?}",
                alert.alert_id, alert.priority, detection.threat_type, detection.confidence, detection.affected_components
            );
            let html = format!("<pre>{text}</pre>");
            for channel in &rule.channels {
                let outcome = self
                    .notifier
                    .send_alert(&subject, &text, &html, &rule.recipients, &ChannelConfig { channel: channel.clone() })
                    .await;
                if !outcome.is_delivered() {
                    tracing::error!(alert_id = %alert.alert_id, channel, "alert notification failed");
                }
            }
        }
    }

    pub fn ack(&self, alert_id: Uuid, by: &str) -> Result<(), AlertError> {
        let mut active = self.active.lock().unwrap();
        let entry = active.get_mut(&alert_id).ok_or(AlertError::UnknownAlert(alert_id))?;
        if entry.alert.is_terminal() {
            return Err(AlertError::AlreadyTerminal(alert_id));
        }
        entry.alert.status = AlertStatus::Ack;
        entry.alert.acked_by = Some(by.to_string());
        entry.alert.acked_at = Some(Utc::now());
        Ok(())
    }

    pub fn resolve(&self, alert_id: Uuid, by: &str) -> Result<(), AlertError> {
        let mut active = self.active.lock().unwrap();
        let mut entry = active.remove(&alert_id).ok_or(AlertError::UnknownAlert(alert_id))?;
        entry.alert.status = AlertStatus::Resolved;
        entry.alert.resolved_by = Some(by.to_string());
        entry.alert.resolved_at = Some(Utc::now());
        self.archive.lock().unwrap().insert(alert_id, (entry.alert, Utc::now()));
        Ok(())
    }

    /// Escalate every NEW/ACK alert whose age has crossed an escalation
    /// rule's `trigger_after`, resending its notification to the rule's
    /// targets, up to `max_escalations` times per rule.
    pub async fn check_escalations(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let candidates: Vec<(Uuid, Alert, String, BTreeSet<TargetComponent>, f64)> = {
            let active = self.active.lock().unwrap();
            active
                .values()
                .filter(|a| !a.alert.is_terminal())
                .map(|a| (a.alert.alert_id, a.alert.clone(), a.threat_type.clone(), a.affected_components.clone(), a.confidence))
                .collect()
        };

        let mut escalated = Vec::new();
        for (id, alert, threat_type, components, confidence) in candidates {
            for rule in &self.config.escalation_rules {
                if alert.escalation_count >= rule.max_escalations {
                    continue;
                }
                let age = now - alert.created_at;
                if age < rule.trigger_after {
                    continue;
                }
                let synthetic = ThreatDetection {
                    detection_id: alert.source_detection_id,
                    timestamp: alert.created_at,
                    threat_type: threat_type.clone(),
                    severity: alert.priority,
                    affected_components: components.clone(),
                    indicators: HashMap::new(),
                    confidence,
                    recommended_actions: Vec::new(),
                    evidence_chain: alert.source_event_ids.clone(),
                };
                if !rule.conditions.iter().all(|c| c.matches(&synthetic)) {
                    continue;
                }

                let subject = format!("[ESCALATION] {threat_type}");
                let text = format!("alert_id={id}\nescalation #{}\npriority={:?}", alert.escalation_count + 1, alert.priority);
                let html = format!("<pre>{text}</pre>");
                let outcome = self
                    .notifier
                    .send_alert(&subject, &text, &html, &rule.targets, &ChannelConfig { channel: "escalation".to_string() })
                    .await;
                if !outcome.is_delivered() {
                    tracing::error!(alert_id = %id, "escalation notification failed");
                }

                let mut active = self.active.lock().unwrap();
                if let Some(entry) = active.get_mut(&id) {
                    entry.alert.escalation_count += 1;
                    entry.alert.last_escalated_at = Some(now);
                    if entry.alert.escalation_count >= rule.max_escalations {
                        entry.alert.status = AlertStatus::Escalated;
                    }
                }
                escalated.push(id);
            }
        }
        escalated
    }

    /// Drop archived alerts older than the retention window. Returns
    /// how many were dropped.
    pub fn prune_archive(&self, now: DateTime<Utc>) -> usize {
        let mut archive = self.archive.lock().unwrap();
        let before = archive.len();
        archive.retain(|_, (_, resolved_at)| now - *resolved_at <= self.config.archive_retention);
        before - archive.len()
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    pub fn archived_count(&self) -> usize {
        self.archive.lock().unwrap().len()
    }

    pub fn suppressed_count(&self, alert_id: Uuid) -> Option<u32> {
        self.active.lock().unwrap().get(&alert_id).map(|a| a.suppressed_count)
    }
}

#[async_trait]
impl SecurityComponent for AlertManager {
    fn name(&self) -> &str {
        "alert_manager"
    }

    async fn run(&self, stop: StopSignal) {
        {
            let mut status = self.status.lock().unwrap();
            status.running = true;
            status.started_at = Some(std::time::Instant::now());
        }
        tracing::info!("alert manager started");

        while !stop.is_stopped() {
            tokio::select! {
                _ = tokio::time::sleep(self.config.sweep_interval) => {}
            }
            if stop.is_stopped() {
                break;
            }

            let now = Utc::now();
            self.check_escalations(now).await;
            self.prune_archive(now);

            let mut status = self.status.lock().unwrap();
            status.cycles += 1;
        }

        let mut status = self.status.lock().unwrap();
        status.running = false;
        tracing::info!("alert manager stopped");
    }

    fn status(&self) -> ComponentStatus {
        let mut status = self.status.lock().unwrap().clone();
        status.events_emitted = self.alerts_raised.load(Ordering::Relaxed);
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::LoggingNotifier;

    fn detection(threat_type: &str, severity: Severity, age_minutes: i64) -> ThreatDetection {
        ThreatDetection {
            detection_id: Uuid::new_v4(),
            timestamp: Utc::now() - Duration::minutes(age_minutes),
            threat_type: threat_type.to_string(),
            severity,
            affected_components: [TargetComponent::Database].into_iter().collect(),
            indicators: HashMap::new(),
            confidence: 0.9,
            recommended_actions: Vec::new(),
            evidence_chain: vec![Uuid::new_v4()],
        }
    }

    #[tokio::test]
    async fn repeated_detection_within_window_is_suppressed() {
        let manager = AlertManager::new(AlertManagerConfig::default(), Arc::new(LoggingNotifier::default()));
        let first = manager.raise(&detection("sql_injection", Severity::High, 0)).await;
        let second = manager.raise(&detection("sql_injection", Severity::High, 0)).await;
        assert_eq!(first.alert_id, second.alert_id);
        assert_eq!(manager.suppressed_count(first.alert_id), Some(1));
        assert_eq!(manager.active_count(), 1);
    }

    #[tokio::test]
    async fn different_threat_type_is_not_suppressed() {
        let manager = AlertManager::new(AlertManagerConfig::default(), Arc::new(LoggingNotifier::default()));
        manager.raise(&detection("sql_injection", Severity::High, 0)).await;
        manager.raise(&detection("privilege_escalation", Severity::High, 0)).await;
        assert_eq!(manager.active_count(), 2);
    }

    #[tokio::test]
    async fn stale_alert_outside_window_raises_fresh_one() {
        let manager = AlertManager::new(AlertManagerConfig::default(), Arc::new(LoggingNotifier::default()));
        manager.raise(&detection("sql_injection", Severity::High, 10)).await;
        let second = manager.raise(&detection("sql_injection", Severity::High, 0)).await;
        assert_eq!(manager.active_count(), 2);
        assert_eq!(manager.suppressed_count(second.alert_id), Some(0));
    }

    #[tokio::test]
    async fn alert_older_than_trigger_after_escalates() {
        let mut config = AlertManagerConfig::default();
        config.escalation_rules = vec![EscalationRule {
            trigger_after: Duration::minutes(15),
            max_escalations: 2,
            targets: vec!["oncall@example.com".to_string()],
            conditions: Vec::new(),
        }];
        let manager = AlertManager::new(config, Arc::new(LoggingNotifier::default()));
        let alert = manager.raise(&detection("sql_injection", Severity::High, 20)).await;

        let escalated = manager.check_escalations(Utc::now()).await;
        assert_eq!(escalated, vec![alert.alert_id]);

        let escalated_again = manager.check_escalations(Utc::now()).await;
        assert_eq!(escalated_again, vec![alert.alert_id]);

        // third sweep: max_escalations (2) already reached, no more firing.
        let escalated_third = manager.check_escalations(Utc::now()).await;
        assert!(escalated_third.is_empty());
    }

    #[tokio::test]
    async fn resolved_alerts_are_archived_and_pruned_after_retention() {
        let manager = AlertManager::new(AlertManagerConfig::default(), Arc::new(LoggingNotifier::default()));
        let alert = manager.raise(&detection("sql_injection", Severity::High, 0)).await;
        manager.resolve(alert.alert_id, "operator").unwrap();
        assert_eq!(manager.archived_count(), 1);

        let dropped = manager.prune_archive(Utc::now() + Duration::days(31));
        assert_eq!(dropped, 1);
        assert_eq!(manager.archived_count(), 0);
    }
}
