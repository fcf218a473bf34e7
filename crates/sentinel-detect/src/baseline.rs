//! C6: behavioral baseline detector.
//!
//! Learns one [`BaselineProfile`] per principal (the `source_ip` field
//! on the profile records the most recently seen host; `typical_hosts`
//! is the set of every host this principal has connected from). The
//! profile is consulted for deviations before being updated with the
//! event that was just checked, so a principal's first off-pattern
//! event is the one that gets flagged, not a later one.
//!
//! Single-writer: only this detector ever mutates its profiles.

use chrono::{DateTime, Datelike, Timelike, Utc};
use sentinel_core::{BaselineProfile, InfrastructureEvent, Severity, TargetComponent, ThreatDetection};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct BaselineConfig {
    pub learning_window: chrono::Duration,
    pub min_learning_events: u64,
    pub deviation_threshold_sigma: f64,
    pub connection_frequency_multiplier: f64,
    pub session_duration_multiplier: f64,
    /// Absolute ceiling consulted while a profile is still immature
    /// (default 5) for the excessive-concurrent-sessions structural
    /// check.
    pub absolute_concurrent_ceiling: u32,
    /// Distinct /24-equivalent subnets that must already be
    /// established before an unseen subnet counts as anomalous.
    pub min_established_subnets: usize,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            learning_window: chrono::Duration::hours(72),
            min_learning_events: 100,
            deviation_threshold_sigma: 2.5,
            connection_frequency_multiplier: 4.0,
            session_duration_multiplier: 6.0,
            absolute_concurrent_ceiling: 5,
            min_established_subnets: 2,
        }
    }
}

/// Welford's running mean/variance accumulator, keyed alongside the
/// profile it supplements -- `BaselineProfile` stores only the
/// derived mean/stddev, not the intermediate `M2` this needs.
#[derive(Default, Clone, Copy)]
struct DurationStats {
    n: u64,
    mean: f64,
    m2: f64,
}

impl DurationStats {
    fn observe(&mut self, duration: f64) {
        self.n += 1;
        let delta = duration - self.mean;
        self.mean += delta / self.n as f64;
        let delta2 = duration - self.mean;
        self.m2 += delta * delta2;
    }

    fn stddev(&self) -> f64 {
        if self.n < 2 {
            0.0
        } else {
            (self.m2 / (self.n - 1) as f64).sqrt()
        }
    }
}

fn subnet_prefix(host: &str) -> Option<String> {
    let parts: Vec<&str> = host.split('.').collect();
    if parts.len() == 4 && parts.iter().all(|p| p.parse::<u8>().is_ok()) {
        Some(format!("{}.{}.{}", parts[0], parts[1], parts[2]))
    } else {
        None
    }
}

struct ProfileState {
    profile: BaselineProfile,
    duration_stats: DurationStats,
    /// Timestamps of events in roughly the last hour, used only to
    /// compute a live connection-frequency reading to compare against
    /// the learned `connection_frequency_per_hour`.
    recent_events: std::collections::VecDeque<DateTime<Utc>>,
}

pub struct BaselineDetector {
    config: BaselineConfig,
    profiles: Mutex<HashMap<String, ProfileState>>,
}

impl BaselineDetector {
    pub fn new(config: BaselineConfig) -> Self {
        Self {
            config,
            profiles: Mutex::new(HashMap::new()),
        }
    }

    fn detection(
        threat_type: &str,
        severity: Severity,
        confidence: f64,
        event: &InfrastructureEvent,
        indicators: HashMap<String, serde_json::Value>,
    ) -> ThreatDetection {
        ThreatDetection {
            detection_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            threat_type: threat_type.to_string(),
            severity,
            affected_components: [event.target_component].into_iter().collect(),
            indicators,
            confidence,
            recommended_actions: Vec::new(),
            evidence_chain: vec![event.event_id],
        }
    }

    /// Process one event against the principal's profile, returning
    /// any deviation detections, then updates the profile with this
    /// event's data.
    pub fn process_event(&self, event: &InfrastructureEvent) -> Vec<ThreatDetection> {
        let mut detections = Vec::new();
        let concurrent_sessions = event
            .details
            .extra
            .get("concurrent_sessions")
            .and_then(|v| v.as_u64())
            .unwrap_or(1) as u32;
        let command = event.details.command.clone().unwrap_or_else(|| "UNKNOWN".to_string());
        let hour = event.timestamp.hour() as u8;
        let weekday = event.timestamp.weekday().num_days_from_monday() as u8;

        let mut profiles = self.profiles.lock().unwrap();
        let state = profiles.entry(event.principal.clone()).or_insert_with(|| ProfileState {
            profile: BaselineProfile::new(event.principal.clone(), event.source_ip.clone(), event.timestamp),
            duration_stats: DurationStats::default(),
            recent_events: std::collections::VecDeque::new(),
        });

        let mature = state
            .profile
            .is_mature(self.config.learning_window, self.config.min_learning_events);
        let is_new_host = !state.profile.typical_hosts.contains(&event.source_ip);

        if mature {
            if is_new_host {
                detections.push(Self::detection(
                    "new_host_connection",
                    Severity::Medium,
                    0.6,
                    event,
                    HashMap::from([("host".to_string(), serde_json::json!(event.source_ip))]),
                ));
            }
            if !state.profile.active_hours.contains(&hour) || !state.profile.active_days.contains(&weekday) {
                detections.push(Self::detection(
                    "off_hours_activity",
                    Severity::Low,
                    0.4,
                    event,
                    HashMap::from([("hour".to_string(), serde_json::json!(hour)), ("weekday".to_string(), serde_json::json!(weekday))]),
                ));
            }
            if state.profile.max_concurrent_sessions > 0 && concurrent_sessions > state.profile.max_concurrent_sessions {
                detections.push(Self::detection(
                    "excessive_concurrent_sessions",
                    Severity::High,
                    0.8,
                    event,
                    HashMap::from([("concurrent_sessions".to_string(), serde_json::json!(concurrent_sessions))]),
                ));
            }
            if !state.profile.command_frequency.contains_key(&command) {
                detections.push(Self::detection(
                    "unknown_command",
                    Severity::Medium,
                    0.6,
                    event,
                    HashMap::from([("command".to_string(), serde_json::json!(command))]),
                ));
            }
            state.recent_events.retain(|t| event.timestamp - *t <= chrono::Duration::hours(1));
            if state.profile.connection_frequency_per_hour > 0.0
                && state.recent_events.len() as f64
                    > state.profile.connection_frequency_per_hour * self.config.connection_frequency_multiplier
            {
                detections.push(Self::detection(
                    "connection_frequency_spike",
                    Severity::Medium,
                    0.6,
                    event,
                    HashMap::from([("baseline_per_hour".to_string(), serde_json::json!(state.profile.connection_frequency_per_hour))]),
                ));
            }
            if let Some(duration) = event.details.duration {
                let sigma_bound = state.profile.mean_session_duration
                    + self.config.deviation_threshold_sigma * state.profile.stddev_session_duration;
                let multiplier_bound = state.profile.mean_session_duration * self.config.session_duration_multiplier;
                if state.duration_stats.n >= 2 && duration > sigma_bound.max(multiplier_bound) {
                    detections.push(Self::detection(
                        "session_duration_anomaly",
                        Severity::Medium,
                        0.6,
                        event,
                        HashMap::from([("duration".to_string(), serde_json::json!(duration))]),
                    ));
                }
            }
        } else {
            if concurrent_sessions > self.config.absolute_concurrent_ceiling {
                detections.push(Self::detection(
                    "excessive_concurrent_sessions",
                    Severity::High,
                    0.9,
                    event,
                    HashMap::from([("concurrent_sessions".to_string(), serde_json::json!(concurrent_sessions))]),
                ));
            }

            let established: HashSet<String> =
                state.profile.typical_hosts.iter().filter_map(|h| subnet_prefix(h)).collect();
            if let Some(prefix) = subnet_prefix(&event.source_ip) {
                if is_new_host && !established.contains(&prefix) && established.len() >= self.config.min_established_subnets {
                    detections.push(Self::detection(
                        "new_subnet_connection",
                        Severity::High,
                        0.8,
                        event,
                        HashMap::from([("subnet".to_string(), serde_json::json!(prefix))]),
                    ));
                }
            }
        }

        self.learn(state, event, concurrent_sessions, &command, hour, weekday);
        detections
    }

    fn learn(
        &self,
        state: &mut ProfileState,
        event: &InfrastructureEvent,
        concurrent_sessions: u32,
        command: &str,
        hour: u8,
        weekday: u8,
    ) {
        state.recent_events.push_back(event.timestamp);
        let profile = &mut state.profile;
        profile.source_ip = event.source_ip.clone();
        profile.typical_hosts.insert(event.source_ip.clone());
        profile.active_hours.insert(hour);
        profile.active_days.insert(weekday);
        profile.max_concurrent_sessions = profile.max_concurrent_sessions.max(concurrent_sessions);
        *profile.command_frequency.entry(command.to_string()).or_insert(0) += 1;
        profile.event_count += 1;
        if event.timestamp > profile.profile_end {
            profile.profile_end = event.timestamp;
        }

        if let Some(duration) = event.details.duration {
            state.duration_stats.observe(duration);
            profile.mean_session_duration = state.duration_stats.mean;
            profile.stddev_session_duration = state.duration_stats.stddev();
        }

        let span_hours = (profile.profile_end - profile.profile_start).num_seconds() as f64 / 3600.0;
        profile.connection_frequency_per_hour = if span_hours > 0.0 {
            profile.event_count as f64 / span_hours
        } else {
            profile.event_count as f64
        };
    }

    pub fn profile_snapshot(&self, principal: &str) -> Option<BaselineProfile> {
        self.profiles.lock().unwrap().get(principal).map(|s| s.profile.clone())
    }

    /// Last-seen `profile_end` across every tracked principal, used by
    /// the orchestrator's health check to confirm the detector is
    /// actually consuming events.
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.profiles.lock().unwrap().values().map(|s| s.profile.profile_end).max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_core::{EventDetails, HmacSecret};

    fn event_at(principal: &str, host: &str, command: &str, hour_offset_days: i64, secret: &HmacSecret) -> InfrastructureEvent {
        let mut e = InfrastructureEvent::new(
            "session_observed",
            host,
            principal,
            TargetComponent::Database,
            EventDetails {
                command: Some(command.to_string()),
                ..Default::default()
            },
            0.1,
            secret,
        );
        e.timestamp = Utc::now() - chrono::Duration::days(hour_offset_days);
        e
    }

    #[test]
    fn immature_profile_only_emits_structural_anomalies() {
        let secret = HmacSecret::generate();
        let detector = BaselineDetector::new(BaselineConfig::default());
        // 30 events over half an hour, well short of the 100-event / 72h maturity bar.
        for i in 0..30 {
            let e = event_at("uba_user", "127.0.0.1", "SELECT", 0, &secret);
            let mut e = e;
            e.timestamp = Utc::now() - chrono::Duration::minutes(i);
            let dets = detector.process_event(&e);
            assert!(dets.iter().all(|d| d.severity == Severity::High));
        }
    }

    #[test]
    fn immature_profile_flags_excessive_concurrent_sessions() {
        let secret = HmacSecret::generate();
        let detector = BaselineDetector::new(BaselineConfig::default());
        let mut e = event_at("uba_user", "127.0.0.1", "SELECT", 0, &secret);
        e.details.extra.insert("concurrent_sessions".to_string(), serde_json::json!(6));
        let dets = detector.process_event(&e);
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].threat_type, "excessive_concurrent_sessions");
        assert_eq!(dets[0].severity, Severity::High);
        assert_eq!(dets[0].confidence, 0.9);
    }

    #[test]
    fn mature_profile_flags_new_host() {
        let secret = HmacSecret::generate();
        let detector = BaselineDetector::new(BaselineConfig {
            learning_window: chrono::Duration::hours(1),
            min_learning_events: 5,
            ..BaselineConfig::default()
        });
        for i in 0..10 {
            let mut e = event_at("app", "10.0.0.1", "SELECT", 0, &secret);
            e.timestamp = Utc::now() - chrono::Duration::hours(10 - i);
            detector.process_event(&e);
        }
        let e = event_at("app", "10.0.0.99", "SELECT", 0, &secret);
        let dets = detector.process_event(&e);
        assert!(dets.iter().any(|d| d.threat_type == "new_host_connection"));
    }
}
