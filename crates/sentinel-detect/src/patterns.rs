//! C7: signature-based pattern detector.
//!
//! Runs every incoming event's query text against a fixed catalog of
//! regexes grouped by attack family (injection, privilege escalation,
//! reconnaissance, persistence, exfiltration). A match's base
//! confidence is adjusted by additive context bumps and clamped to
//! 1.0, then compared against a per-family threshold before being
//! turned into a `ThreatDetection`.

use chrono::{Timelike, Utc};
use regex::Regex;
use sentinel_core::{InfrastructureEvent, Severity, TargetComponent, ThreatDetection};
use std::collections::HashMap;
use std::sync::OnceLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttackFamily {
    SqlInjection,
    PrivilegeEscalation,
    Reconnaissance,
    Persistence,
    Exfiltration,
}

impl AttackFamily {
    fn threat_type(self) -> &'static str {
        match self {
            AttackFamily::SqlInjection => "sql_injection",
            AttackFamily::PrivilegeEscalation => "privilege_escalation",
            AttackFamily::Reconnaissance => "reconnaissance",
            AttackFamily::Persistence => "persistence_attempt",
            AttackFamily::Exfiltration => "exfiltration_attempt",
        }
    }

    fn severity(self) -> Severity {
        match self {
            AttackFamily::SqlInjection => Severity::High,
            AttackFamily::PrivilegeEscalation => Severity::Critical,
            AttackFamily::Reconnaissance => Severity::Low,
            AttackFamily::Persistence => Severity::Critical,
            AttackFamily::Exfiltration => Severity::High,
        }
    }

    /// Minimum post-bump confidence required before a match is
    /// promoted to a detection.
    fn threshold(self) -> f64 {
        match self {
            AttackFamily::SqlInjection => 0.5,
            AttackFamily::PrivilegeEscalation => 0.4,
            AttackFamily::Reconnaissance => 0.6,
            AttackFamily::Persistence => 0.4,
            AttackFamily::Exfiltration => 0.5,
        }
    }
}

struct Pattern {
    name: &'static str,
    family: AttackFamily,
    regex: Regex,
    base_confidence: f64,
}

fn patterns() -> &'static Vec<Pattern> {
    static PATTERNS: OnceLock<Vec<Pattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let compile = |name, family, re: &str, base| Pattern {
            name,
            family,
            regex: Regex::new(re).expect("pattern catalog entries are valid regex"),
            base_confidence: base,
        };

        vec![
            // -- SQL injection --
            compile(
                "union_based_injection",
                AttackFamily::SqlInjection,
                r"(?i)\bunion\b(\s+all)?\s+select\b",
                0.9,
            ),
            compile(
                "boolean_based_injection",
                AttackFamily::SqlInjection,
                r"(?i)\bor\b\s+['\x22]?\s*\d+\s*=\s*\d+\s*['\x22]?\s*(--|#|;|$)",
                0.6,
            ),
            compile(
                "time_based_injection",
                AttackFamily::SqlInjection,
                r"(?i)\b(sleep|benchmark|pg_sleep|waitfor\s+delay)\s*\(",
                0.75,
            ),
            compile(
                "stacked_query_injection",
                AttackFamily::SqlInjection,
                r"(?i);\s*(drop|delete|update|insert|alter)\b",
                0.65,
            ),
            // -- privilege escalation --
            compile(
                "user_creation",
                AttackFamily::PrivilegeEscalation,
                r"(?i)\bcreate\s+user\b",
                0.6,
            ),
            compile(
                "grant_all_privileges",
                AttackFamily::PrivilegeEscalation,
                r"(?i)\bgrant\s+all\b.*\bto\b",
                0.7,
            ),
            compile(
                "revoke_audit_role",
                AttackFamily::PrivilegeEscalation,
                r"(?i)\brevoke\b.*\b(audit|monitor|select)\b",
                0.5,
            ),
            compile(
                "set_password_for_other",
                AttackFamily::PrivilegeEscalation,
                r"(?i)\bset\s+password\s+for\b",
                0.5,
            ),
            // -- reconnaissance --
            compile(
                "information_schema_enum",
                AttackFamily::Reconnaissance,
                r"(?i)\binformation_schema\.(tables|columns|schemata|user_privileges)\b",
                0.4,
            ),
            compile(
                "mysql_user_table_access",
                AttackFamily::Reconnaissance,
                r"(?i)\bmysql\.(user|db|tables_priv)\b",
                0.55,
            ),
            compile(
                "version_recon",
                AttackFamily::Reconnaissance,
                r"(?i)\b(select\s+version\(\)|@@version|show\s+variables)\b",
                0.3,
            ),
            compile(
                "process_enumeration",
                AttackFamily::Reconnaissance,
                r"(?i)\bshow\s+(processlist|status|grants)\b",
                0.35,
            ),
            // -- persistence --
            compile(
                "trigger_creation",
                AttackFamily::Persistence,
                r"(?i)\bcreate\s+trigger\b",
                0.5,
            ),
            compile(
                "procedure_creation",
                AttackFamily::Persistence,
                r"(?i)\bcreate\s+(procedure|function)\b",
                0.45,
            ),
            compile(
                "scheduled_event_creation",
                AttackFamily::Persistence,
                r"(?i)\bcreate\s+event\b",
                0.45,
            ),
            compile(
                "backdoor_user_creation",
                AttackFamily::Persistence,
                r"(?i)\bcreate\s+user\b.*\bidentified\s+by\b",
                0.6,
            ),
            // -- exfiltration --
            compile(
                "into_outfile",
                AttackFamily::Exfiltration,
                r"(?i)\binto\s+(outfile|dumpfile)\b",
                0.75,
            ),
            compile(
                "bulk_select_star",
                AttackFamily::Exfiltration,
                r"(?i)\bselect\s+\*\s+from\b",
                0.3,
            ),
            compile(
                "encoded_payload",
                AttackFamily::Exfiltration,
                r"(?i)\b(hex|to_base64|compress)\s*\(",
                0.4,
            ),
        ]
    })
}

#[derive(Debug, Clone)]
pub struct SignatureConfig {
    pub privileged_principals: Vec<String>,
    pub system_schemas: Vec<String>,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            privileged_principals: vec!["root".to_string(), "admin".to_string(), "sentinel_svc".to_string()],
            system_schemas: vec!["mysql".to_string(), "information_schema".to_string(), "performance_schema".to_string()],
        }
    }
}

pub struct SignatureDetector {
    config: SignatureConfig,
}

impl SignatureDetector {
    pub fn new(config: SignatureConfig) -> Self {
        Self { config }
    }

    fn is_local(ip: &str) -> bool {
        ip == "localhost" || ip == "127.0.0.1" || ip == "::1"
    }

    fn is_off_hours(hour: u32) -> bool {
        hour < 6 || hour > 22
    }

    /// Scan one event's query text, returning zero or more detections
    /// (a single query can legitimately trip more than one pattern).
    pub fn scan(&self, event: &InfrastructureEvent) -> Vec<ThreatDetection> {
        let Some(query) = &event.details.query else {
            return Vec::new();
        };

        let mut detections = Vec::new();
        for pattern in patterns() {
            let Some(m) = pattern.regex.find(query) else {
                continue;
            };

            let mut confidence = pattern.base_confidence;
            if self.config.privileged_principals.iter().any(|p| p == &event.principal) {
                confidence += 0.2;
            }
            if let Some(db) = &event.details.database {
                if self.config.system_schemas.iter().any(|s| s == db) {
                    confidence += 0.15;
                }
            }
            if !Self::is_local(&event.source_ip) {
                confidence += 0.1;
            }
            if m.as_str().len() > 20 {
                confidence += 0.05;
            }
            if Self::is_off_hours(event.timestamp.hour()) {
                confidence += 0.1;
            }
            confidence = confidence.min(1.0);

            if confidence < pattern.family.threshold() {
                continue;
            }

            detections.push(ThreatDetection {
                detection_id: Uuid::new_v4(),
                timestamp: Utc::now(),
                threat_type: pattern.family.threat_type().to_string(),
                severity: pattern.family.severity(),
                affected_components: [event.target_component, TargetComponent::Database].into_iter().collect(),
                indicators: HashMap::from([
                    ("pattern".to_string(), serde_json::json!(pattern.name)),
                    ("matched".to_string(), serde_json::json!(m.as_str())),
                ]),
                confidence,
                recommended_actions: Vec::new(),
                evidence_chain: vec![event.event_id],
            });
        }
        detections
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_core::{EventDetails, HmacSecret};

    fn query_event(query: &str, principal: &str, source_ip: &str, secret: &HmacSecret) -> InfrastructureEvent {
        InfrastructureEvent::new(
            "statement_observed",
            source_ip,
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
    fn union_select_from_untrusted_host_crosses_threshold() {
        let secret = HmacSecret::generate();
        let detector = SignatureDetector::new(SignatureConfig::default());
        let event = query_event(
            "SELECT 1 UNION SELECT username, password FROM users",
            "app_user",
            "203.0.113.5",
            &secret,
        );
        let dets = detector.scan(&event);
        assert!(dets.iter().any(|d| d.threat_type == "sql_injection"));
    }

    #[test]
    fn privileged_principal_raises_confidence_over_unprivileged() {
        let secret = HmacSecret::generate();
        let detector = SignatureDetector::new(SignatureConfig::default());
        let low = query_event("SELECT * FROM customers", "app_user", "127.0.0.1", &secret);
        let high = query_event("SELECT * FROM customers", "root", "127.0.0.1", &secret);
        let low_conf = detector.scan(&low).into_iter().find(|d| d.threat_type == "exfiltration_attempt").map(|d| d.confidence);
        let high_conf = detector.scan(&high).into_iter().find(|d| d.threat_type == "exfiltration_attempt").map(|d| d.confidence);
        if let (Some(l), Some(h)) = (low_conf, high_conf) {
            assert!(h > l);
        }
    }

    #[test]
    fn benign_select_does_not_trip_any_pattern() {
        let secret = HmacSecret::generate();
        let detector = SignatureDetector::new(SignatureConfig::default());
        let event = query_event("SELECT id, name FROM products WHERE id = 42", "app_user", "127.0.0.1", &secret);
        assert!(detector.scan(&event).is_empty());
    }

    #[test]
    fn union_select_from_remote_host_meets_high_confidence_floor() {
        let secret = HmacSecret::generate();
        let detector = SignatureDetector::new(SignatureConfig::default());
        let event = query_event(
            "SELECT 1 UNION SELECT username, password FROM users",
            "app_user",
            "10.0.0.5",
            &secret,
        );
        let dets = detector.scan(&event);
        let sqli = dets.iter().find(|d| d.threat_type == "sql_injection").expect("union select should be flagged");
        assert!(sqli.confidence >= 0.9, "confidence was {}", sqli.confidence);
    }

    #[test]
    fn private_range_source_is_not_treated_as_local() {
        assert!(!SignatureDetector::is_local("10.0.0.5"));
        assert!(!SignatureDetector::is_local("192.168.1.1"));
        assert!(SignatureDetector::is_local("127.0.0.1"));
        assert!(SignatureDetector::is_local("localhost"));
    }

    #[test]
    fn backdoor_user_creation_flagged_as_persistence() {
        let secret = HmacSecret::generate();
        let detector = SignatureDetector::new(SignatureConfig::default());
        let event = query_event(
            "CREATE USER 'svc_backup2'@'%' IDENTIFIED BY 'x'",
            "admin",
            "127.0.0.1",
            &secret,
        );
        let dets = detector.scan(&event);
        assert!(dets.iter().any(|d| d.threat_type == "persistence_attempt" && d.severity == Severity::Critical));
    }
}
