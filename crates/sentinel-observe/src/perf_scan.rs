//! `performance_schema` table I/O polling
//!
//! Tables are assigned a fixed sensitivity weight and a sudden spike in
//! reads/writes against a sensitive table is surfaced as a
//! `perf_schema_access` event for C6/C9 to correlate against.

use crate::source::TableIoStat;
use sentinel_core::{EventDetails, HmacSecret, InfrastructureEvent, TargetComponent};

/// Per-table sensitivity weight for accounts/credentials/audit-adjacent
/// tables.
fn sensitivity_weight(table: &str) -> f64 {
    let lower = table.to_ascii_lowercase();
    if lower.contains("user") || lower.contains("credential") || lower.contains("password") {
        0.9
    } else if lower.contains("audit") || lower.contains("log") {
        0.7
    } else if lower.contains("session") || lower.contains("token") {
        0.6
    } else {
        0.2
    }
}

/// A table's activity this far above its own prior baseline counts as
/// a spike relative to a sudden deviation from normal table access.
const SPIKE_MULTIPLIER: u64 = 5;

/// Compare this poll's stats against the previous poll's for the same
/// table, emitting a `perf_schema_access` event for any sensitive table
/// whose activity spiked.
pub fn scan_table_io(
    current: &[TableIoStat],
    previous: &[TableIoStat],
    schema: &str,
    secret: &HmacSecret,
) -> Vec<InfrastructureEvent> {
    let mut out = Vec::new();

    for stat in current {
        let weight = sensitivity_weight(&stat.table);
        if weight < 0.5 {
            continue;
        }
        let prior = previous.iter().find(|p| p.table == stat.table);
        let spiked = match prior {
            Some(p) => {
                stat.reads > p.reads.saturating_mul(SPIKE_MULTIPLIER).max(1)
                    || stat.writes > p.writes.saturating_mul(SPIKE_MULTIPLIER).max(1)
            }
            None => stat.reads + stat.writes > 0,
        };
        if !spiked {
            continue;
        }

        let mut details = EventDetails {
            database: Some(schema.to_string()),
            ..Default::default()
        };
        details.extra.insert("table".to_string(), serde_json::json!(stat.table));
        details.extra.insert("reads".to_string(), serde_json::json!(stat.reads));
        details.extra.insert("writes".to_string(), serde_json::json!(stat.writes));

        out.push(InfrastructureEvent::new(
            "perf_schema_access",
            "internal".to_string(),
            "monitoring_service".to_string(),
            TargetComponent::PerfSchema,
            details,
            weight,
            secret,
        ));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insensitive_table_never_flagged() {
        let current = vec![TableIoStat { table: "orders".into(), reads: 10_000, writes: 5_000 }];
        let events = scan_table_io(&current, &[], "appdb", &test_secret());
        assert!(events.is_empty());
    }

    #[test]
    fn sensitive_table_spike_is_flagged() {
        let previous = vec![TableIoStat { table: "user_credentials".into(), reads: 10, writes: 0 }];
        let current = vec![TableIoStat { table: "user_credentials".into(), reads: 500, writes: 0 }];
        let events = scan_table_io(&current, &previous, "mysql", &test_secret());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "perf_schema_access");
    }

    fn test_secret() -> HmacSecret {
        HmacSecret::generate()
    }
}
