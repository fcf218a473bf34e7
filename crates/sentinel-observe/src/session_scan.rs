//! Session-level risk scoring
//!
//! Turns a raw `SessionInfo` snapshot into zero or more
//! `InfrastructureEvent`s: a baseline `session_observed` event per
//! session plus specialized `uba_user_anomaly` and
//! `brute_force_attack` events when the corresponding sub-checks fire.

use crate::source::SessionInfo;
use chrono::{DateTime, Duration, Utc};
use sentinel_core::{EventDetails, HmacSecret, InfrastructureEvent, TargetComponent};
use std::collections::HashMap;

/// Administrative command classes that bump risk on their own.
const ADMIN_COMMANDS: &[&str] = &["Binlog Dump", "Shutdown", "Kill", "Change user"];

/// Database/schema names treated as system schemas for the +0.4 weight.
const SYSTEM_SCHEMAS: &[&str] = &["mysql", "information_schema", "performance_schema", "sys"];

pub struct SessionScanConfig {
    pub authorized_principals: Vec<String>,
    pub local_hosts: Vec<String>,
}

impl Default for SessionScanConfig {
    fn default() -> Self {
        Self {
            authorized_principals: Vec::new(),
            local_hosts: vec!["localhost".into(), "127.0.0.1".into(), "::1".into()],
        }
    }
}

/// Per-principal login/close timestamps kept only long enough to run
/// the brute-force sliding window; not persisted across restarts.
#[derive(Default)]
pub struct BruteForceTracker {
    /// host -> recent (login_time, held_seconds) observations
    recent: HashMap<String, Vec<(DateTime<Utc>, u64)>>,
}

impl BruteForceTracker {
    const WINDOW: Duration = Duration::hours(1);
    const THRESHOLD: usize = 5;
    const IMMEDIATE_CLOSE_SECS: u64 = 2;

    /// Record one session observation and report whether this host just
    /// crossed the brute-force threshold within the rolling window.
    pub fn observe(&mut self, host: &str, seconds: u64, now: DateTime<Utc>) -> bool {
        let entry = self.recent.entry(host.to_string()).or_default();
        entry.retain(|(t, _)| now - *t <= Self::WINDOW);
        if seconds <= Self::IMMEDIATE_CLOSE_SECS {
            entry.push((now, seconds));
        }
        entry.len() >= Self::THRESHOLD
    }
}

fn is_local(host: &str, locals: &[String]) -> bool {
    let bare = host.split(':').next().unwrap_or(host);
    locals.iter().any(|l| l == bare)
}

fn is_system_schema(db: Option<&str>) -> bool {
    db.map(|d| SYSTEM_SCHEMAS.contains(&d)).unwrap_or(false)
}

fn is_admin_command(command: &str) -> bool {
    ADMIN_COMMANDS.iter().any(|c| c.eq_ignore_ascii_case(command))
}

/// Risk score for one session snapshot, clamped to `[0.0, 1.0]`.
pub fn session_risk_score(
    session: &SessionInfo,
    config: &SessionScanConfig,
    concurrent_same_principal: u32,
) -> f64 {
    let mut score = 0.0_f64;

    if !config.authorized_principals.is_empty()
        && !config.authorized_principals.iter().any(|p| p == &session.user)
    {
        score += 0.5;
    }
    if !is_local(&session.host, &config.local_hosts) {
        score += 0.3;
    }
    if is_system_schema(session.db.as_deref()) {
        score += 0.4;
    }
    if is_admin_command(&session.command) {
        score += 0.3;
    }
    if concurrent_same_principal >= 3 {
        score += 0.4;
    }

    score.min(1.0)
}

/// Emits the baseline observation event for a session, plus a
/// `uba_user_anomaly` event when the UBA-specific sub-check trips:
/// remote host, admin command, session held over an hour, or more than
/// two concurrent sessions for the same principal.
pub fn scan_session(
    session: &SessionInfo,
    config: &SessionScanConfig,
    concurrent_same_principal: u32,
    secret: &HmacSecret,
) -> Vec<InfrastructureEvent> {
    let mut out = Vec::new();
    let risk = session_risk_score(session, config, concurrent_same_principal);

    let details = EventDetails {
        command: Some(session.command.clone()),
        database: session.db.clone(),
        duration: Some(session.seconds as f64),
        ..Default::default()
    };
    out.push(InfrastructureEvent::new(
        "session_observed",
        session.host.clone(),
        session.user.clone(),
        TargetComponent::Database,
        details.clone(),
        risk,
        secret,
    ));

    let uba_anomaly = !is_local(&session.host, &config.local_hosts)
        || is_admin_command(&session.command)
        || session.seconds > 3600
        || concurrent_same_principal > 2;

    if uba_anomaly {
        out.push(InfrastructureEvent::new(
            "uba_user_anomaly",
            session.host.clone(),
            session.user.clone(),
            TargetComponent::UserAccount,
            details,
            risk.max(0.6),
            secret,
        ));
    }

    out
}

/// Build a `brute_force_attack` event for a host that just tripped the
/// tracker, at a fixed risk of 0.9.
pub fn brute_force_event(host: &str, principal: &str, secret: &HmacSecret) -> InfrastructureEvent {
    InfrastructureEvent::new(
        "brute_force_attack",
        host.to_string(),
        principal.to_string(),
        TargetComponent::UserAccount,
        EventDetails::default(),
        0.9,
        secret,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(user: &str, host: &str, db: Option<&str>, command: &str, seconds: u64) -> SessionInfo {
        SessionInfo {
            id: "1".into(),
            user: user.into(),
            host: host.into(),
            db: db.map(String::from),
            command: command.into(),
            seconds,
            state: "executing".into(),
            info: None,
        }
    }

    #[test]
    fn local_authorized_query_scores_zero() {
        let config = SessionScanConfig {
            authorized_principals: vec!["app".into()],
            ..Default::default()
        };
        let s = session("app", "localhost", Some("appdb"), "Query", 2);
        assert_eq!(session_risk_score(&s, &config, 1), 0.0);
    }

    #[test]
    fn remote_unauthorized_admin_command_on_system_schema_clamps_to_one() {
        let config = SessionScanConfig::default();
        let s = session("root", "10.0.0.9", Some("mysql"), "Shutdown", 10);
        assert_eq!(session_risk_score(&s, &config, 4), 1.0);
    }

    #[test]
    fn brute_force_tracker_trips_after_five_quick_closes() {
        let mut tracker = BruteForceTracker::default();
        let now = Utc::now();
        let mut tripped = false;
        for i in 0..5 {
            tripped = tracker.observe("10.0.0.9", 1, now + Duration::seconds(i));
        }
        assert!(tripped);
    }

    #[test]
    fn brute_force_tracker_ignores_long_sessions() {
        let mut tracker = BruteForceTracker::default();
        let now = Utc::now();
        for i in 0..10 {
            tracker.observe("10.0.0.9", 120, now + Duration::seconds(i));
        }
        assert!(!tracker.observe("10.0.0.9", 120, now));
    }
}
