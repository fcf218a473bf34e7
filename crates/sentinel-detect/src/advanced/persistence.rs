//! Persistence-mechanism analyzer.
//!
//! A single trigger or scheduled event is plausible maintenance; two or
//! more distinct persistence mechanisms from the same principal inside
//! the tracking window looks like a foothold being built. Tracks a
//! rolling set of mechanisms per principal and promotes once the
//! configured count is reached.

use chrono::{DateTime, Utc};
use sentinel_core::{InfrastructureEvent, Severity, ThreatDetection};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PersistenceMechanism {
    Trigger,
    ScheduledEvent,
    StoredProcedure,
    BackdoorUser,
    ConfigurationModification,
}

impl PersistenceMechanism {
    fn from_query(query: &str) -> Option<Self> {
        let q = query.to_ascii_lowercase();
        if q.contains("create trigger") {
            Some(Self::Trigger)
        } else if q.contains("create event") {
            Some(Self::ScheduledEvent)
        } else if q.contains("create procedure") || q.contains("create function") {
            Some(Self::StoredProcedure)
        } else if q.contains("create user") && q.contains("identified by") {
            Some(Self::BackdoorUser)
        } else if q.contains("set global") {
            Some(Self::ConfigurationModification)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub tracking_window: chrono::Duration,
    pub min_persistence_indicators: u32,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            tracking_window: chrono::Duration::hours(24),
            min_persistence_indicators: 2,
        }
    }
}

struct PrincipalHistory {
    mechanisms: Vec<(DateTime<Utc>, PersistenceMechanism, Uuid)>,
}

pub struct PersistenceAnalyzer {
    config: PersistenceConfig,
    history: Mutex<HashMap<String, PrincipalHistory>>,
}

impl PersistenceAnalyzer {
    pub fn new(config: PersistenceConfig) -> Self {
        Self {
            config,
            history: Mutex::new(HashMap::new()),
        }
    }

    pub fn analyze(&self, event: &InfrastructureEvent) -> Option<ThreatDetection> {
        let query = event.details.query.as_ref()?;
        let mechanism = PersistenceMechanism::from_query(query)?;

        let mut history = self.history.lock().unwrap();
        let entry = history.entry(event.principal.clone()).or_insert_with(|| PrincipalHistory { mechanisms: Vec::new() });
        entry.mechanisms.retain(|(t, _, _)| event.timestamp - *t <= self.config.tracking_window);
        entry.mechanisms.push((event.timestamp, mechanism, event.event_id));

        let distinct: HashSet<PersistenceMechanism> = entry.mechanisms.iter().map(|(_, m, _)| *m).collect();
        if distinct.len() < self.config.min_persistence_indicators as usize {
            return None;
        }

        let severity = if distinct.contains(&PersistenceMechanism::BackdoorUser)
            || distinct.contains(&PersistenceMechanism::ConfigurationModification)
        {
            Severity::Critical
        } else {
            Severity::High
        };

        let evidence_chain: Vec<Uuid> = entry.mechanisms.iter().map(|(_, _, id)| *id).collect();
        Some(ThreatDetection {
            detection_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            threat_type: "persistence_mechanism_chain".to_string(),
            severity,
            affected_components: [event.target_component].into_iter().collect(),
            indicators: HashMap::from([(
                "mechanisms".to_string(),
                serde_json::json!(distinct.iter().map(|m| format!("{m:?}")).collect::<Vec<_>>()),
            )]),
            confidence: (0.5 + 0.15 * distinct.len() as f64).min(1.0),
            recommended_actions: Vec::new(),
            evidence_chain,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_core::{EventDetails, HmacSecret, TargetComponent};

    fn event(query: &str, principal: &str, secret: &HmacSecret) -> InfrastructureEvent {
        InfrastructureEvent::new(
            "statement_observed",
            "10.0.0.5",
            principal,
            TargetComponent::Database,
            EventDetails {
                query: Some(query.to_string()),
                ..Default::default()
            },
            0.1,
            secret,
        )
    }

    #[test]
    fn single_mechanism_does_not_promote() {
        let secret = HmacSecret::generate();
        let analyzer = PersistenceAnalyzer::new(PersistenceConfig::default());
        let e = event("CREATE TRIGGER t1 BEFORE INSERT ON orders FOR EACH ROW SET NEW.x=1", "app", &secret);
        assert!(analyzer.analyze(&e).is_none());
    }

    #[test]
    fn two_distinct_mechanisms_promote_to_critical_with_backdoor_user() {
        let secret = HmacSecret::generate();
        let analyzer = PersistenceAnalyzer::new(PersistenceConfig::default());
        let e1 = event("CREATE TRIGGER t1 BEFORE INSERT ON orders FOR EACH ROW SET NEW.x=1", "app", &secret);
        let e2 = event("CREATE USER 'svc2'@'%' IDENTIFIED BY 'x'", "app", &secret);
        assert!(analyzer.analyze(&e1).is_none());
        let det = analyzer.analyze(&e2).expect("second mechanism should promote");
        assert_eq!(det.severity, Severity::Critical);
    }
}
