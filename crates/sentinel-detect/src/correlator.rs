//! C9: sequence correlator and adaptive security updates.
//!
//! Groups detections sharing `(source_ip, principal, attack_type)` into
//! an `AttackSequence` once enough member detections land inside the
//! correlation window; a sequence idle past `sequence_timeout` is
//! retired. Also queues low-risk, high-confidence tuning proposals
//! (threshold nudges, pattern additions, window re-sizing) generated
//! elsewhere in the pipeline, auto-applying the ones confident enough
//! and keeping a rollback snapshot for every applied update.

use crate::error::DetectionError;
use chrono::{DateTime, Utc};
use sentinel_core::{AttackSequence, TargetComponent, ThreatDetection};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct CorrelatorConfig {
    pub min_sequence_events: u32,
    pub correlation_window: chrono::Duration,
    pub sequence_timeout: chrono::Duration,
    pub update_queue_capacity: usize,
    pub auto_apply_confidence: f64,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            min_sequence_events: 2,
            correlation_window: chrono::Duration::seconds(300),
            sequence_timeout: chrono::Duration::seconds(3600),
            update_queue_capacity: 256,
            auto_apply_confidence: 0.7,
        }
    }
}

struct SequenceState {
    sequence: AttackSequence,
    last_event_at: DateTime<Utc>,
    member_detections: Vec<Uuid>,
    confidences: Vec<f64>,
}

#[derive(Debug, Clone)]
pub enum UpdateKind {
    AddPattern { name: String, regex: String },
    AdjustThreshold { name: String, delta: f64 },
    OptimizeWindow { name: String, new_seconds: u64 },
}

#[derive(Debug, Clone)]
pub struct SecurityUpdate {
    pub update_id: Uuid,
    pub proposed_at: DateTime<Utc>,
    pub kind: UpdateKind,
    pub confidence: f64,
    pub applied: bool,
    pub rollback_snapshot: String,
}

pub struct Correlator {
    config: CorrelatorConfig,
    sequences: Mutex<HashMap<(String, String, String), SequenceState>>,
    update_queue: Mutex<VecDeque<SecurityUpdate>>,
    applied_updates: Mutex<Vec<SecurityUpdate>>,
}

impl Correlator {
    pub fn new(config: CorrelatorConfig) -> Self {
        Self {
            config,
            sequences: Mutex::new(HashMap::new()),
            update_queue: Mutex::new(VecDeque::new()),
            applied_updates: Mutex::new(Vec::new()),
        }
    }

    /// Feed one detection; returns `Some` only on the tick the sequence
    /// crosses `min_sequence_events`, so callers emit exactly one
    /// `AttackSequence` notification per qualifying group rather than
    /// one per member detection.
    pub fn correlate(
        &self,
        detection: &ThreatDetection,
        source_ip: &str,
        principal: &str,
    ) -> Option<AttackSequence> {
        let key = (source_ip.to_string(), principal.to_string(), detection.threat_type.clone());
        let mut sequences = self.sequences.lock().unwrap();

        self.evict_timed_out(&mut sequences, detection.timestamp);

        let state = sequences.entry(key).or_insert_with(|| SequenceState {
            sequence: AttackSequence {
                sequence_id: Uuid::new_v4(),
                attack_type: detection.threat_type.clone(),
                events: Vec::new(),
                source_ips: HashSet::new(),
                target_components: HashSet::new(),
                start_time: detection.timestamp,
                end_time: detection.timestamp,
                confidence: 0.0,
            },
            last_event_at: detection.timestamp,
            member_detections: Vec::new(),
            confidences: Vec::new(),
        });

        state.member_detections.push(detection.detection_id);
        state.confidences.push(detection.confidence);
        state.sequence.events.push(detection.detection_id);
        state.sequence.source_ips.insert(source_ip.to_string());
        state.sequence.target_components.extend(detection.affected_components.iter().copied());
        state.sequence.end_time = detection.timestamp;
        state.last_event_at = detection.timestamp;
        state.sequence.confidence = state.confidences.iter().sum::<f64>() / state.confidences.len() as f64;

        if state.member_detections.len() as u32 == self.config.min_sequence_events {
            Some(state.sequence.clone())
        } else {
            None
        }
    }

    fn evict_timed_out(
        &self,
        sequences: &mut HashMap<(String, String, String), SequenceState>,
        now: DateTime<Utc>,
    ) {
        sequences.retain(|_, state| now - state.last_event_at <= self.config.sequence_timeout);
    }

    /// Queue a tuning proposal. Applies immediately if confident enough,
    /// recording a rollback snapshot either way; drops (with an error,
    /// the caller logs and discards) once the queue is saturated rather
    /// than blocking the proposer.
    pub fn propose_update(&self, kind: UpdateKind, confidence: f64, current_value: String) -> Result<SecurityUpdate, DetectionError> {
        let mut update = SecurityUpdate {
            update_id: Uuid::new_v4(),
            proposed_at: Utc::now(),
            kind,
            confidence,
            applied: false,
            rollback_snapshot: current_value,
        };

        if confidence >= self.config.auto_apply_confidence {
            update.applied = true;
            self.applied_updates.lock().unwrap().push(update.clone());
            return Ok(update);
        }

        let mut queue = self.update_queue.lock().unwrap();
        if queue.len() >= self.config.update_queue_capacity {
            return Err(DetectionError::UpdateQueueFull);
        }
        queue.push_back(update.clone());
        Ok(update)
    }

    pub fn pending_updates(&self) -> Vec<SecurityUpdate> {
        self.update_queue.lock().unwrap().iter().cloned().collect()
    }

    pub fn applied_updates(&self) -> Vec<SecurityUpdate> {
        self.applied_updates.lock().unwrap().clone()
    }

    /// Apply a previously queued update by id, moving it out of the
    /// pending queue. Errors if the id isn't queued (already applied,
    /// already rolled back, or never proposed).
    pub fn approve_pending(&self, update_id: Uuid) -> Result<SecurityUpdate, DetectionError> {
        let mut queue = self.update_queue.lock().unwrap();
        let idx = queue
            .iter()
            .position(|u| u.update_id == update_id)
            .ok_or(DetectionError::UnknownUpdate(update_id))?;
        let mut update = queue.remove(idx).unwrap();
        update.applied = true;
        self.applied_updates.lock().unwrap().push(update.clone());
        Ok(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_core::Severity;

    fn detection(threat_type: &str, confidence: f64, component: TargetComponent) -> ThreatDetection {
        ThreatDetection {
            detection_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            threat_type: threat_type.to_string(),
            severity: Severity::High,
            affected_components: [component].into_iter().collect(),
            indicators: HashMap::new(),
            confidence,
            recommended_actions: Vec::new(),
            evidence_chain: vec![Uuid::new_v4()],
        }
    }

    #[test]
    fn sequence_emitted_once_threshold_reached() {
        let correlator = Correlator::new(CorrelatorConfig::default());
        let d1 = detection("sql_injection", 0.6, TargetComponent::Database);
        assert!(correlator.correlate(&d1, "203.0.113.5", "app").is_none());
        let d2 = detection("sql_injection", 0.7, TargetComponent::Database);
        let seq = correlator.correlate(&d2, "203.0.113.5", "app");
        assert!(seq.is_some());
        assert_eq!(seq.unwrap().events.len(), 2);
    }

    #[test]
    fn distinct_attack_types_do_not_share_a_sequence() {
        let correlator = Correlator::new(CorrelatorConfig::default());
        let d1 = detection("sql_injection", 0.6, TargetComponent::Database);
        let d2 = detection("reconnaissance", 0.6, TargetComponent::Database);
        correlator.correlate(&d1, "203.0.113.5", "app");
        assert!(correlator.correlate(&d2, "203.0.113.5", "app").is_none());
    }

    #[test]
    fn high_confidence_update_auto_applies() {
        let correlator = Correlator::new(CorrelatorConfig::default());
        let update = correlator
            .propose_update(
                UpdateKind::AdjustThreshold { name: "high_risk_threshold".to_string(), delta: 0.05 },
                0.85,
                "0.8".to_string(),
            )
            .unwrap();
        assert!(update.applied);
        assert_eq!(correlator.applied_updates().len(), 1);
        assert!(correlator.pending_updates().is_empty());
    }

    #[test]
    fn low_confidence_update_queues_for_approval() {
        let correlator = Correlator::new(CorrelatorConfig::default());
        let update = correlator
            .propose_update(
                UpdateKind::AddPattern { name: "new_recon".to_string(), regex: r"(?i)show\s+engines".to_string() },
                0.4,
                "".to_string(),
            )
            .unwrap();
        assert!(!update.applied);
        assert_eq!(correlator.pending_updates().len(), 1);

        let approved = correlator.approve_pending(update.update_id).unwrap();
        assert!(approved.applied);
        assert!(correlator.pending_updates().is_empty());
    }
}
