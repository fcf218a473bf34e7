//! Lightweight suspicious-query pre-filter
//!
//! This is a coarse keyword/shape filter over the live statement list,
//! distinct from (and much smaller than) C7's full signature catalog
//! in `sentinel-detect` -- this module only decides whether a
//! statement is *worth* handing downstream as a `suspicious_query`
//! event, it never classifies the technique.

use crate::source::StatementInfo;
use regex::Regex;
use sentinel_core::{EventDetails, HmacSecret, InfrastructureEvent, TargetComponent};
use std::sync::OnceLock;

fn patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)\bunion\s+select\b",
            r"(?i)\binto\s+outfile\b",
            r"(?i)\bload_file\s*\(",
            r"(?i)\bdrop\s+(table|database|schema)\b",
            r"(?i)\bgrant\s+all\b",
            r"(?i)\bbenchmark\s*\(",
            r"(?i)\bsleep\s*\(",
            r"(?i)information_schema\.(tables|columns|user_privileges)",
            r"(?i)\bxp_cmdshell\b",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static pattern is valid"))
        .collect()
    })
}

/// A statement's `rows_examined / rows_sent` ratio this far above 1
/// (with a floor on `examined` to ignore trivial queries) marks a
/// possible bulk-extraction scan.
const EXFIL_RATIO_THRESHOLD: f64 = 50.0;
const EXFIL_MIN_EXAMINED: u64 = 1000;

fn matched_pattern(sql: &str) -> Option<&'static str> {
    patterns()
        .iter()
        .find(|re| re.is_match(sql))
        .map(|re| re.as_str())
}

fn exfiltration_shaped(stmt: &StatementInfo) -> bool {
    stmt.examined >= EXFIL_MIN_EXAMINED
        && stmt.sent > 0
        && (stmt.examined as f64 / stmt.sent as f64) >= EXFIL_RATIO_THRESHOLD
}

/// Scan one statement and, if it is worth surfacing, build a
/// `suspicious_query` event carrying the matched pattern (or the
/// exfiltration-shape marker) in `details.extra`.
pub fn scan_statement(
    stmt: &StatementInfo,
    principal: &str,
    source_ip: &str,
    secret: &HmacSecret,
) -> Option<InfrastructureEvent> {
    let pattern = matched_pattern(&stmt.sql);
    let shaped = exfiltration_shaped(stmt);
    if pattern.is_none() && !shaped {
        return None;
    }

    let mut details = EventDetails {
        query: Some(stmt.sql.clone()),
        database: stmt.db.clone(),
        ..Default::default()
    };
    if let Some(p) = pattern {
        details
            .extra
            .insert("matched_pattern".to_string(), serde_json::json!(p));
    }
    if shaped {
        details
            .extra
            .insert("exfiltration_shaped".to_string(), serde_json::json!(true));
    }

    let risk = if pattern.is_some() && shaped {
        0.9
    } else if pattern.is_some() {
        0.7
    } else {
        0.6
    };

    Some(InfrastructureEvent::new(
        "suspicious_query",
        source_ip.to_string(),
        principal.to_string(),
        TargetComponent::Database,
        details,
        risk,
        secret,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn stmt(sql: &str, examined: u64, sent: u64) -> StatementInfo {
        StatementInfo {
            thread: "42".into(),
            sql: sql.into(),
            db: Some("appdb".into()),
            started: Utc::now(),
            examined,
            sent,
        }
    }

    #[test]
    fn union_select_is_flagged() {
        let s = stmt("SELECT 1 UNION SELECT user, password FROM mysql.user", 10, 1);
        assert!(matched_pattern(&s.sql).is_some());
    }

    #[test]
    fn ordinary_select_is_not_flagged() {
        let s = stmt("SELECT name FROM customers WHERE id = 5", 1, 1);
        assert!(matched_pattern(&s.sql).is_none());
        assert!(!exfiltration_shaped(&s));
    }

    #[test]
    fn large_examined_to_sent_ratio_is_exfiltration_shaped() {
        let s = stmt("SELECT * FROM customers", 100_000, 10);
        assert!(exfiltration_shaped(&s));
    }
}
