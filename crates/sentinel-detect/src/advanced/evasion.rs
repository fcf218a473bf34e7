//! Evasion analyzer.
//!
//! Two signals: literal obfuscation techniques (comment-splitting,
//! char-code concatenation, hex literals standing in for strings), and
//! near-duplicate query variants within a short window -- an attacker
//! probing a WAF or signature filter tends to resend the same query
//! shape with small token-level tweaks rather than a genuinely new
//! query each time.

use chrono::{DateTime, Utc};
use regex::Regex;
use sentinel_core::{InfrastructureEvent, Severity, ThreatDetection};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, OnceLock};
use uuid::Uuid;

fn obfuscation_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)/\*.*?\*/",
            r"(?i)\bchar\s*\(\s*\d+",
            r"0x[0-9a-f]{4,}",
            r"(?i)\bconcat\s*\(",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static pattern is valid"))
        .collect()
    })
}

fn tokenize(query: &str) -> HashSet<String> {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_ascii_lowercase())
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    if union == 0.0 {
        0.0
    } else {
        intersection / union
    }
}

#[derive(Debug, Clone)]
pub struct EvasionConfig {
    pub variant_window: chrono::Duration,
    pub similarity_low: f64,
    pub similarity_high: f64,
}

impl Default for EvasionConfig {
    fn default() -> Self {
        Self {
            variant_window: chrono::Duration::minutes(30),
            similarity_low: 0.7,
            similarity_high: 0.95,
        }
    }
}

struct RecentQuery {
    timestamp: DateTime<Utc>,
    tokens: HashSet<String>,
    event_id: Uuid,
}

pub struct EvasionAnalyzer {
    config: EvasionConfig,
    recent: Mutex<HashMap<String, Vec<RecentQuery>>>,
}

impl EvasionAnalyzer {
    pub fn new(config: EvasionConfig) -> Self {
        Self {
            config,
            recent: Mutex::new(HashMap::new()),
        }
    }

    fn obfuscated(query: &str) -> Vec<&'static str> {
        obfuscation_patterns()
            .iter()
            .filter(|re| re.is_match(query))
            .map(|re| re.as_str())
            .collect()
    }

    pub fn analyze(&self, event: &InfrastructureEvent) -> Option<ThreatDetection> {
        let query = event.details.query.as_ref()?;
        let matched = Self::obfuscated(query);
        let tokens = tokenize(query);

        let mut recent = self.recent.lock().unwrap();
        let history = recent.entry(event.principal.clone()).or_insert_with(Vec::new);
        history.retain(|r| event.timestamp - r.timestamp <= self.config.variant_window);

        let mut variant_hits = Vec::new();
        for prior in history.iter() {
            let sim = jaccard(&prior.tokens, &tokens);
            if sim >= self.config.similarity_low && sim < self.config.similarity_high {
                variant_hits.push((prior.event_id, sim));
            }
        }
        history.push(RecentQuery {
            timestamp: event.timestamp,
            tokens,
            event_id: event.event_id,
        });

        if matched.is_empty() && variant_hits.is_empty() {
            return None;
        }

        let mut indicators = HashMap::new();
        let mut confidence: f64 = 0.0;
        if !matched.is_empty() {
            indicators.insert("obfuscation_patterns".to_string(), serde_json::json!(matched));
            confidence = confidence.max(0.5);
        }
        let mut evidence_chain = vec![event.event_id];
        if !variant_hits.is_empty() {
            let best = variant_hits.iter().cloned().fold(0.0_f64, |acc, (_, s)| acc.max(s));
            indicators.insert("variant_similarity".to_string(), serde_json::json!(best));
            indicators.insert("variant_count".to_string(), serde_json::json!(variant_hits.len()));
            evidence_chain.extend(variant_hits.iter().map(|(id, _)| *id));
            confidence = confidence.max(0.55 + 0.05 * variant_hits.len() as f64).min(1.0);
        }

        Some(ThreatDetection {
            detection_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            threat_type: "signature_evasion".to_string(),
            severity: Severity::Medium,
            affected_components: [event.target_component].into_iter().collect(),
            indicators,
            confidence,
            recommended_actions: Vec::new(),
            evidence_chain,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_core::{EventDetails, HmacSecret, TargetComponent};

    fn event_with(query: &str, secret: &HmacSecret) -> InfrastructureEvent {
        InfrastructureEvent::new(
            "statement_observed",
            "10.0.0.9",
            "probe_user",
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
    fn comment_split_literal_is_flagged() {
        let secret = HmacSecret::generate();
        let analyzer = EvasionAnalyzer::new(EvasionConfig::default());
        let e = event_with("SELECT/**/username,password/**/FROM/**/users", &secret);
        let det = analyzer.analyze(&e).expect("obfuscated query should be flagged");
        assert_eq!(det.threat_type, "signature_evasion");
    }

    #[test]
    fn near_duplicate_variant_within_window_is_flagged() {
        let secret = HmacSecret::generate();
        let analyzer = EvasionAnalyzer::new(EvasionConfig::default());
        let e1 = event_with("SELECT id, name, email FROM users WHERE id = 1", &secret);
        let e2 = event_with("SELECT id, name, email FROM users WHERE id = 2", &secret);
        assert!(analyzer.analyze(&e1).is_none());
        let det = analyzer.analyze(&e2);
        assert!(det.is_some());
    }

    #[test]
    fn identical_repeated_query_is_not_a_variant() {
        let secret = HmacSecret::generate();
        let analyzer = EvasionAnalyzer::new(EvasionConfig::default());
        let e1 = event_with("SELECT id FROM users WHERE id = 1", &secret);
        let e2 = event_with("SELECT id FROM users WHERE id = 1", &secret);
        analyzer.analyze(&e1);
        assert!(analyzer.analyze(&e2).is_none());
    }
}
