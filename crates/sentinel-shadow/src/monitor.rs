//! C13: shadow monitor. Runs alongside the primary pipeline with its
//! own audit chain, own config, and its own idea of primary health --
//! tampering with the primary's audit log or config doesn't blind this
//! one. Detects primary compromise from a short rolling window of
//! health-check outcomes and switches to backup alerting once it does.

use async_trait::async_trait;
use sentinel_core::{AuditChain, ComponentStatus, SecurityComponent, Severity, StopSignal, TargetComponent, ThreatDetection};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration as StdDuration, Instant};
use uuid::Uuid;

/// Narrow capability consumed by the shadow monitor: can the primary
/// monitoring pipeline still answer a liveness probe. Kept separate
/// from `sentinel-observe`'s `DbObservationSource` on purpose -- the
/// shadow monitor must not depend on anything the primary owns.
#[async_trait]
pub trait PrimaryHealthProbe: Send + Sync {
    async fn is_healthy(&self) -> bool;
}

/// Outbound channel the shadow monitor switches to once it decides the
/// primary's own alerting can no longer be trusted.
#[async_trait]
pub trait BackupAlertChannel: Send + Sync {
    async fn send(&self, subject: &str, body: &str);
}

pub struct LoggingBackupChannel;

#[async_trait]
impl BackupAlertChannel for LoggingBackupChannel {
    async fn send(&self, subject: &str, body: &str) {
        tracing::error!(subject, body, "shadow monitor backup alert");
    }
}

#[derive(Debug, Clone, Copy)]
struct HealthOutcome {
    healthy: bool,
    response_time: StdDuration,
}

#[derive(Debug, Clone)]
pub struct ShadowMonitorConfig {
    pub heartbeat_interval: StdDuration,
    pub primary_health_check_interval: StdDuration,
    pub window: usize,
    pub failure_fraction_threshold: f64,
    pub slow_response_threshold: StdDuration,
}

impl Default for ShadowMonitorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: StdDuration::from_secs(60),
            primary_health_check_interval: StdDuration::from_secs(30),
            window: 5,
            failure_fraction_threshold: 0.8,
            slow_response_threshold: StdDuration::from_secs(5),
        }
    }
}

pub struct ShadowMonitor<P: PrimaryHealthProbe> {
    config: ShadowMonitorConfig,
    probe: P,
    audit: AuditChain,
    backup_channel: Box<dyn BackupAlertChannel>,
    outcomes: Mutex<VecDeque<HealthOutcome>>,
    backup_active: AtomicBool,
    heartbeats: AtomicU64,
    status: Mutex<ComponentStatus>,
}

impl<P: PrimaryHealthProbe> ShadowMonitor<P> {
    pub fn new(config: ShadowMonitorConfig, probe: P, audit: AuditChain, backup_channel: Box<dyn BackupAlertChannel>) -> Self {
        Self {
            config,
            probe,
            audit,
            backup_channel,
            outcomes: Mutex::new(VecDeque::with_capacity(8)),
            backup_active: AtomicBool::new(false),
            heartbeats: AtomicU64::new(0),
            status: Mutex::new(ComponentStatus::default()),
        }
    }

    fn detection(&self, threat_type: &str, severity: Severity, confidence: f64) -> ThreatDetection {
        let mut indicators = HashMap::new();
        indicators.insert("window".to_string(), json!(self.config.window));
        ThreatDetection {
            detection_id: Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            threat_type: threat_type.to_string(),
            severity,
            affected_components: [TargetComponent::MonitoringService].into_iter().collect(),
            indicators,
            confidence,
            recommended_actions: vec!["investigate_primary_monitoring_service".to_string()],
            evidence_chain: Vec::new(),
        }
    }

    /// Poll the primary's health once, record the outcome, and return a
    /// detection if the rolling window now indicates compromise.
    pub async fn check_primary(&self) -> Option<ThreatDetection> {
        let start = Instant::now();
        let healthy = self.probe.is_healthy().await;
        let response_time = start.elapsed();

        let mut outcomes = self.outcomes.lock().unwrap();
        outcomes.push_back(HealthOutcome { healthy, response_time });
        while outcomes.len() > self.config.window {
            outcomes.pop_front();
        }

        let window_len = outcomes.len();
        let failures = outcomes.iter().filter(|o| !o.healthy).count();
        let failure_fraction = failures as f64 / window_len as f64;
        let avg_response = outcomes.iter().map(|o| o.response_time.as_secs_f64()).sum::<f64>() / window_len as f64;
        drop(outcomes);

        let _ = self
            .audit
            .append(json!({"kind": "primary_health_check", "healthy": healthy, "response_time_ms": response_time.as_millis()}))
            .await;

        if window_len >= self.config.window && failure_fraction >= self.config.failure_fraction_threshold {
            self.activate_backup("primary health checks failing").await;
            return Some(self.detection("primary_monitor_compromise", Severity::High, 0.8));
        }

        if window_len >= self.config.window && avg_response >= self.config.slow_response_threshold.as_secs_f64() {
            return Some(self.detection("primary_monitor_degraded", Severity::Medium, 0.6));
        }

        None
    }

    async fn activate_backup(&self, reason: &str) {
        if self.backup_active.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.audit.append(json!({"kind": "backup_alerting_activated", "reason": reason})).await;
        self.backup_channel.send("shadow monitor: switching to backup alerting", reason).await;
        tracing::error!(reason, "shadow monitor activated backup alerting");
    }

    pub fn backup_active(&self) -> bool {
        self.backup_active.load(Ordering::SeqCst)
    }

    async fn heartbeat(&self) {
        self.heartbeats.fetch_add(1, Ordering::Relaxed);
        let _ = self.audit.append(json!({"kind": "shadow_heartbeat"})).await;
    }
}

#[async_trait]
impl<P: PrimaryHealthProbe + Send + Sync> SecurityComponent for ShadowMonitor<P> {
    fn name(&self) -> &str {
        "shadow_monitor"
    }

    async fn run(&self, stop: StopSignal) {
        {
            let mut status = self.status.lock().unwrap();
            status.running = true;
            status.started_at = Some(Instant::now());
        }
        tracing::info!("shadow monitor started");

        let mut last_heartbeat = Instant::now() - self.config.heartbeat_interval;
        let mut last_health_check = Instant::now() - self.config.primary_health_check_interval;

        while !stop.is_stopped() {
            let now = Instant::now();
            if now.duration_since(last_heartbeat) >= self.config.heartbeat_interval {
                self.heartbeat().await;
                last_heartbeat = now;
            }
            if stop.is_stopped() {
                break;
            }
            if now.duration_since(last_health_check) >= self.config.primary_health_check_interval {
                if self.check_primary().await.is_some() {
                    self.status.lock().unwrap().events_emitted += 1;
                }
                last_health_check = now;
                self.status.lock().unwrap().cycles += 1;
            }

            tokio::time::sleep(StdDuration::from_millis(250)).await;
        }

        self.status.lock().unwrap().running = false;
        tracing::info!("shadow monitor stopped");
    }

    fn status(&self) -> ComponentStatus {
        self.status.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_core::HmacSecret;
    use std::sync::atomic::AtomicUsize;

    struct ScriptedProbe {
        outcomes: Mutex<VecDeque<(bool, StdDuration)>>,
    }

    #[async_trait]
    impl PrimaryHealthProbe for ScriptedProbe {
        async fn is_healthy(&self) -> bool {
            let mut outcomes = self.outcomes.lock().unwrap();
            let (healthy, delay) = outcomes.pop_front().unwrap_or((true, StdDuration::ZERO));
            std::thread::sleep(delay.min(StdDuration::from_millis(5)));
            healthy
        }
    }

    struct CountingBackupChannel(AtomicUsize);

    #[async_trait]
    impl BackupAlertChannel for CountingBackupChannel {
        async fn send(&self, _subject: &str, _body: &str) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn test_audit() -> (AuditChain, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let chain = AuditChain::open(dir.path().join("shadow.ndjson"), HmacSecret::generate()).await.unwrap();
        (chain, dir)
    }

    #[tokio::test]
    async fn four_of_five_failures_trips_high_detection_and_backup_channel() {
        let (audit, _dir) = test_audit().await;
        let probe = ScriptedProbe {
            outcomes: Mutex::new(VecDeque::from(vec![
                (false, StdDuration::ZERO),
                (false, StdDuration::ZERO),
                (false, StdDuration::ZERO),
                (false, StdDuration::ZERO),
                (true, StdDuration::ZERO),
            ])),
        };
        let monitor = ShadowMonitor::new(ShadowMonitorConfig::default(), probe, audit, Box::new(LoggingBackupChannel));

        let mut last = None;
        for _ in 0..5 {
            last = monitor.check_primary().await;
        }
        assert!(last.is_some());
        let detection = last.unwrap();
        assert_eq!(detection.threat_type, "primary_monitor_compromise");
        assert_eq!(detection.severity, Severity::High);
        assert!(monitor.backup_active());
    }

    #[tokio::test]
    async fn all_healthy_never_trips_a_detection() {
        let (audit, _dir) = test_audit().await;
        let probe = ScriptedProbe { outcomes: Mutex::new(VecDeque::from(vec![(true, StdDuration::ZERO); 5])) };
        let monitor = ShadowMonitor::new(ShadowMonitorConfig::default(), probe, audit, Box::new(LoggingBackupChannel));

        let mut any = false;
        for _ in 0..5 {
            any |= monitor.check_primary().await.is_some();
        }
        assert!(!any);
        assert!(!monitor.backup_active());
    }
}
