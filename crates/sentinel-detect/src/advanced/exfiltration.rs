//! Exfiltration analyzer.
//!
//! Pattern matches (bulk `SELECT *`, `INTO OUTFILE`, hex/base64/compress
//! wrapping) flag a statement's shape; the statistical checks below
//! flag a principal's *behavior* even when no single statement looks
//! unusual on its own -- an outsized query next to that principal's own
//! history, or a run of queries spaced suspiciously regularly (a script
//! pulling rows on a timer rather than a human typing).

use chrono::{DateTime, Utc};
use regex::Regex;
use sentinel_core::{InfrastructureEvent, Severity, ThreatDetection};
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use uuid::Uuid;

fn shape_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)\bselect\s+\*\s+from\b",
            r"(?i)\binto\s+(outfile|dumpfile)\b",
            r"(?i)\b(hex|to_base64|compress)\s*\(",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static pattern is valid"))
        .collect()
    })
}

#[derive(Debug, Clone)]
pub struct ExfiltrationConfig {
    pub window: chrono::Duration,
    pub min_samples_for_stats: usize,
    pub size_sigma_threshold: f64,
    pub regularity_ratio_threshold: f64,
    pub regularity_tolerance: f64,
}

impl Default for ExfiltrationConfig {
    fn default() -> Self {
        Self {
            window: chrono::Duration::minutes(30),
            min_samples_for_stats: 5,
            size_sigma_threshold: 2.5,
            regularity_ratio_threshold: 0.8,
            regularity_tolerance: 0.1,
        }
    }
}

struct PrincipalSamples {
    timestamps: Vec<DateTime<Utc>>,
    sizes: Vec<f64>,
}

pub struct ExfiltrationAnalyzer {
    config: ExfiltrationConfig,
    samples: Mutex<HashMap<String, PrincipalSamples>>,
}

impl ExfiltrationAnalyzer {
    pub fn new(config: ExfiltrationConfig) -> Self {
        Self {
            config,
            samples: Mutex::new(HashMap::new()),
        }
    }

    fn shape_match(query: &str) -> Option<&'static str> {
        shape_patterns().iter().find(|re| re.is_match(query)).map(|re| re.as_str())
    }

    fn mean_stddev(values: &[f64]) -> (f64, f64) {
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        (mean, var.sqrt())
    }

    /// Coefficient of variation of inter-arrival gaps: low variation
    /// relative to the mean gap means a script running on a timer.
    fn regularity(timestamps: &[DateTime<Utc>], tolerance: f64) -> f64 {
        if timestamps.len() < 3 {
            return 0.0;
        }
        let gaps: Vec<f64> = timestamps.windows(2).map(|w| (w[1] - w[0]).num_milliseconds() as f64).collect();
        let (mean, stddev) = Self::mean_stddev(&gaps);
        if mean <= 0.0 {
            return 0.0;
        }
        let within = gaps.iter().filter(|g| ((*g - mean) / mean).abs() <= tolerance).count();
        let _ = stddev;
        within as f64 / gaps.len() as f64
    }

    pub fn analyze(&self, event: &InfrastructureEvent) -> Option<ThreatDetection> {
        let query = event.details.query.as_ref()?;
        let shape = Self::shape_match(query);
        let size = event.details.rows_sent.map(|r| r as f64).unwrap_or(0.0);

        let mut samples = self.samples.lock().unwrap();
        let entry = samples.entry(event.principal.clone()).or_insert_with(|| PrincipalSamples {
            timestamps: Vec::new(),
            sizes: Vec::new(),
        });
        entry.timestamps.retain(|t| event.timestamp - *t <= self.config.window);
        entry.sizes.truncate(entry.timestamps.len());
        entry.timestamps.push(event.timestamp);
        entry.sizes.push(size);

        let mut indicators = HashMap::new();
        let mut confidence: f64 = 0.0;

        if let Some(pattern) = shape {
            indicators.insert("matched_pattern".to_string(), serde_json::json!(pattern));
            confidence = confidence.max(0.6);
        }

        if entry.sizes.len() >= self.config.min_samples_for_stats {
            let (mean, stddev) = Self::mean_stddev(&entry.sizes);
            if stddev > 0.0 && size > mean + self.config.size_sigma_threshold * stddev {
                indicators.insert("size_outlier".to_string(), serde_json::json!(true));
                confidence = confidence.max(0.65);
            }

            let regularity = Self::regularity(&entry.timestamps, self.config.regularity_tolerance);
            if regularity >= self.config.regularity_ratio_threshold {
                indicators.insert("regular_interval_ratio".to_string(), serde_json::json!(regularity));
                confidence = confidence.max(0.6);
            }
        }

        if confidence == 0.0 {
            return None;
        }

        Some(ThreatDetection {
            detection_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            threat_type: "exfiltration_attempt".to_string(),
            severity: Severity::High,
            affected_components: [event.target_component].into_iter().collect(),
            indicators,
            confidence,
            recommended_actions: Vec::new(),
            evidence_chain: vec![event.event_id],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_core::{EventDetails, HmacSecret, TargetComponent};

    fn event_with(query: &str, rows_sent: u64, secret: &HmacSecret) -> InfrastructureEvent {
        InfrastructureEvent::new(
            "statement_observed",
            "10.0.0.7",
            "app",
            TargetComponent::Database,
            EventDetails {
                query: Some(query.to_string()),
                rows_sent: Some(rows_sent),
                ..Default::default()
            },
            0.1,
            secret,
        )
    }

    #[test]
    fn into_outfile_flagged_on_first_sighting() {
        let secret = HmacSecret::generate();
        let analyzer = ExfiltrationAnalyzer::new(ExfiltrationConfig::default());
        let e = event_with("SELECT * FROM customers INTO OUTFILE '/tmp/x.csv'", 1000, &secret);
        let det = analyzer.analyze(&e).expect("shaped query should be flagged");
        assert_eq!(det.threat_type, "exfiltration_attempt");
    }

    #[test]
    fn ordinary_small_query_is_not_flagged() {
        let secret = HmacSecret::generate();
        let analyzer = ExfiltrationAnalyzer::new(ExfiltrationConfig::default());
        let e = event_with("SELECT id FROM orders WHERE id = 5", 1, &secret);
        assert!(analyzer.analyze(&e).is_none());
    }

    #[test]
    fn outsized_query_flagged_against_own_history() {
        let secret = HmacSecret::generate();
        let analyzer = ExfiltrationAnalyzer::new(ExfiltrationConfig::default());
        for _ in 0..6 {
            let e = event_with("SELECT id FROM orders WHERE id = 5", 5, &secret);
            analyzer.analyze(&e);
        }
        let spike = event_with("SELECT id FROM orders WHERE region = 'x'", 50_000, &secret);
        let det = analyzer.analyze(&spike).expect("outsized query vs own baseline should be flagged");
        assert!(det.indicators.contains_key("size_outlier"));
    }
}
