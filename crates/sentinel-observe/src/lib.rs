//! C4: database observation source.
//!
//! Polls a [`DbObservationSource`] on three independent cadences
//! (sessions, recent statements, perf-schema I/O) and turns what it
//! sees into `InfrastructureEvent`s, pushed to C5 over an unbounded
//! channel (the bounded queue sizing applies to the cross-stage queues
//! owned by `sentineld`, not to this internal fan-in).

pub mod perf_scan;
pub mod query_scan;
pub mod session_scan;
pub mod source;

pub use perf_scan::scan_table_io;
pub use query_scan::scan_statement;
pub use session_scan::{scan_session, BruteForceTracker, SessionScanConfig};
pub use source::{DbObservationSource, FixtureSource, ObservationError, SessionInfo, StatementInfo, TableIoStat};

use async_trait::async_trait;
use chrono::Utc;
use sentinel_core::{ComponentStatus, HmacSecret, InfrastructureEvent, SecurityComponent, StopSignal};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration as StdDuration;
use tokio::sync::mpsc;

pub struct ObserverConfig {
    pub session_poll: StdDuration,
    pub statement_poll: StdDuration,
    pub perf_poll: StdDuration,
    pub schema: String,
    pub session_scan: SessionScanConfig,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            session_poll: StdDuration::from_secs(5),
            statement_poll: StdDuration::from_secs(5),
            perf_poll: StdDuration::from_secs(30),
            schema: "appdb".to_string(),
            session_scan: SessionScanConfig::default(),
        }
    }
}

/// Drives one [`DbObservationSource`] and emits `InfrastructureEvent`s
/// on `out`. Implements [`SecurityComponent`] so `sentineld` can spawn
/// and supervise it like any other pipeline stage.
pub struct Observer<S: DbObservationSource> {
    source: S,
    config: ObserverConfig,
    secret: HmacSecret,
    out: mpsc::UnboundedSender<InfrastructureEvent>,
    status: Mutex<ComponentStatus>,
}

impl<S: DbObservationSource> Observer<S> {
    pub fn new(
        source: S,
        config: ObserverConfig,
        secret: HmacSecret,
        out: mpsc::UnboundedSender<InfrastructureEvent>,
    ) -> Self {
        Self {
            source,
            config,
            secret,
            out,
            status: Mutex::new(ComponentStatus::default()),
        }
    }

    fn emit(&self, events: Vec<InfrastructureEvent>) {
        let mut status = self.status.lock().unwrap();
        for event in events {
            status.events_emitted += 1;
            if self.out.send(event).is_err() {
                tracing::warn!("observer: downstream event bus is gone, dropping event");
            }
        }
    }

    async fn poll_sessions(&self, brute: &mut BruteForceTracker) {
        match self.source.list_sessions().await {
            Ok(sessions) => {
                let mut per_principal: HashMap<&str, u32> = HashMap::new();
                for s in &sessions {
                    *per_principal.entry(s.user.as_str()).or_insert(0) += 1;
                }
                let now = Utc::now();
                for session in &sessions {
                    let concurrent = per_principal.get(session.user.as_str()).copied().unwrap_or(1);
                    let mut events = scan_session(session, &self.config.session_scan, concurrent, &self.secret);
                    if brute.observe(&session.host, session.seconds, now) {
                        events.push(session_scan::brute_force_event(&session.host, &session.user, &self.secret));
                    }
                    self.emit(events);
                }
            }
            Err(e) => {
                self.status.lock().unwrap().errors += 1;
                tracing::warn!(error = %e, "session observation failed");
            }
        }
    }

    async fn poll_statements(&self, since: chrono::DateTime<Utc>) {
        match self.source.recent_statements(since, 200).await {
            Ok(statements) => {
                let events: Vec<_> = statements
                    .iter()
                    .filter_map(|stmt| scan_statement(stmt, "unknown", "unknown", &self.secret))
                    .collect();
                self.emit(events);
            }
            Err(e) => {
                self.status.lock().unwrap().errors += 1;
                tracing::warn!(error = %e, "statement observation failed");
            }
        }
    }

    async fn poll_perf(&self, previous: &mut Vec<source::TableIoStat>) {
        match self.source.table_io_stats(&self.config.schema).await {
            Ok(current) => {
                let events = scan_table_io(&current, previous, &self.config.schema, &self.secret);
                self.emit(events);
                *previous = current;
            }
            Err(e) => {
                self.status.lock().unwrap().errors += 1;
                tracing::warn!(error = %e, "perf-schema observation failed");
            }
        }
    }
}

#[async_trait]
impl<S: DbObservationSource> SecurityComponent for Observer<S> {
    fn name(&self) -> &str {
        "sentinel-observe"
    }

    async fn run(&self, stop: StopSignal) {
        {
            let mut status = self.status.lock().unwrap();
            status.running = true;
            status.started_at = Some(std::time::Instant::now());
        }
        tracing::info!(component = self.name(), "started");

        let mut brute = BruteForceTracker::default();
        let mut previous_io = Vec::new();
        let mut last_session_poll = tokio::time::Instant::now();
        let mut last_statement_poll = tokio::time::Instant::now();
        let mut last_perf_poll = tokio::time::Instant::now();
        let mut statement_cursor = Utc::now();

        loop {
            if stop.is_stopped() {
                break;
            }

            let now = tokio::time::Instant::now();
            if now.duration_since(last_session_poll) >= self.config.session_poll {
                self.poll_sessions(&mut brute).await;
                last_session_poll = now;
                self.status.lock().unwrap().cycles += 1;
            }
            if stop.is_stopped() {
                break;
            }
            if now.duration_since(last_statement_poll) >= self.config.statement_poll {
                let cursor = statement_cursor;
                statement_cursor = Utc::now();
                self.poll_statements(cursor).await;
                last_statement_poll = now;
            }
            if stop.is_stopped() {
                break;
            }
            if now.duration_since(last_perf_poll) >= self.config.perf_poll {
                self.poll_perf(&mut previous_io).await;
                last_perf_poll = now;
            }

            tokio::time::sleep(StdDuration::from_millis(250)).await;
        }

        self.status.lock().unwrap().running = false;
        tracing::info!(component = self.name(), "stopped");
    }

    fn status(&self) -> ComponentStatus {
        self.status.lock().unwrap().clone()
    }
}
