//! C14: orchestrator loop. Owns the three cross-stage pipelines
//! (events -> threats -> responses), runs health checks on every
//! registered component on a fixed cadence, tracks flow metrics, and
//! escalates to emergency protection when the threat landscape
//! warrants it. A component failure is logged and reflected in
//! `SupervisorSnapshot`; nothing in here is allowed to panic the
//! process -- only `main`'s startup validation can do that.

use chrono::{Duration as ChronoDuration, Utc};
use sentinel_alert::AlertManager;
use sentinel_core::{AuditChain, ComponentStatus, EmergencyLevel, SecurityComponent, ThreatDetection};
use sentinel_detect::DetectionPipeline;
use sentinel_events::EventBus;
use sentinel_respond::EmergencyProtection;
use sentinel_respond::ResponseOrchestrator;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration as StdDuration, Instant};
use tokio::sync::{broadcast, mpsc};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub threat_queue_capacity: usize,
    pub response_queue_capacity: usize,
    pub health_check_interval: StdDuration,
    pub emergency_eval_interval: StdDuration,
    pub detection_window: ChronoDuration,
    pub latency_samples: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            threat_queue_capacity: 1_000,
            response_queue_capacity: 500,
            health_check_interval: StdDuration::from_secs(10),
            emergency_eval_interval: StdDuration::from_secs(5),
            detection_window: ChronoDuration::minutes(5),
            latency_samples: 256,
        }
    }
}

#[derive(Default)]
struct FlowMetrics {
    events_processed: AtomicU64,
    threats_processed: AtomicU64,
    responses_processed: AtomicU64,
    event_latencies_ms: Mutex<VecDeque<f64>>,
}

impl FlowMetrics {
    fn record_event(&self, latency_ms: f64, cap: usize) {
        self.events_processed.fetch_add(1, Ordering::Relaxed);
        let mut samples = self.event_latencies_ms.lock().unwrap();
        samples.push_back(latency_ms);
        while samples.len() > cap {
            samples.pop_front();
        }
    }

    fn p50_latency_ms(&self) -> f64 {
        let mut samples: Vec<f64> = self.event_latencies_ms.lock().unwrap().iter().copied().collect();
        if samples.is_empty() {
            return 0.0;
        }
        samples.sort_by(|a, b| a.partial_cmp(b).unwrap());
        samples[samples.len() / 2]
    }
}

#[derive(Debug, Clone)]
pub struct ComponentHealth {
    pub name: String,
    pub status: ComponentStatus,
}

#[derive(Debug, Clone)]
pub struct SupervisorSnapshot {
    pub events_per_second: f64,
    pub p50_latency_ms: f64,
    pub threats_processed: u64,
    pub responses_processed: u64,
    pub emergency_level: EmergencyLevel,
    pub components: Vec<ComponentHealth>,
    pub uptime: StdDuration,
}

pub struct Supervisor {
    config: SupervisorConfig,
    pipeline: DetectionPipeline,
    alerts: Arc<AlertManager>,
    responder: Arc<ResponseOrchestrator>,
    emergency: Arc<EmergencyProtection>,
    audit: Arc<AuditChain>,
    components: Vec<(String, Arc<dyn SecurityComponent>)>,
    metrics: FlowMetrics,
    recent_detections: Mutex<VecDeque<(chrono::DateTime<Utc>, ThreatDetection)>>,
    started_at: Instant,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        pipeline: DetectionPipeline,
        alerts: Arc<AlertManager>,
        responder: Arc<ResponseOrchestrator>,
        emergency: Arc<EmergencyProtection>,
        audit: Arc<AuditChain>,
    ) -> Self {
        Self {
            config,
            pipeline,
            alerts,
            responder,
            emergency,
            audit,
            components: Vec::new(),
            metrics: FlowMetrics::default(),
            recent_detections: Mutex::new(VecDeque::new()),
            started_at: Instant::now(),
        }
    }

    /// Register a component for health checks. `sentineld`'s `main`
    /// calls this once per spawned pipeline stage before `run`.
    pub fn register(&mut self, name: impl Into<String>, component: Arc<dyn SecurityComponent>) {
        self.components.push((name.into(), component));
    }

    /// Drive the supervisor loop: consumes events off `event_bus`'s
    /// live fan-out, runs them through detection, and fans detections
    /// out to alerting/response via bounded, order-preserving queues.
    /// Runs until `event_bus`'s broadcast channel closes.
    pub async fn run(self: Arc<Self>, event_bus: Arc<EventBus>) {
        let events = event_bus.subscribe();
        let (threat_tx, threat_rx) = mpsc::channel::<ThreatDetection>(self.config.threat_queue_capacity);
        let (response_tx, response_rx) = mpsc::channel::<sentinel_core::ResponseAction>(self.config.response_queue_capacity);

        let ingest_handle = tokio::spawn(Arc::clone(&self).ingest_loop(events, threat_tx));
        let threat_handle = tokio::spawn(Arc::clone(&self).drain_threats(threat_rx, response_tx));
        let response_handle = tokio::spawn(Arc::clone(&self).drain_responses(response_rx));
        let health_handle = tokio::spawn(Arc::clone(&self).health_check_loop());
        let emergency_handle = tokio::spawn(Arc::clone(&self).emergency_eval_loop());

        let _ = tokio::join!(ingest_handle, threat_handle, response_handle, health_handle, emergency_handle);
    }

    async fn ingest_loop(self: Arc<Self>, mut events: broadcast::Receiver<sentinel_core::InfrastructureEvent>, threat_tx: mpsc::Sender<ThreatDetection>) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let start = Instant::now();
                    let (detections, sequences) = self.pipeline.process(&event);
                    for seq in sequences {
                        tracing::warn!(sequence_id = %seq.sequence_id, "attack sequence correlated");
                        let _ = self.audit.append(json!({"kind": "attack_sequence", "sequence_id": seq.sequence_id})).await;
                    }
                    for detection in detections {
                        if threat_tx.send(detection).await.is_err() {
                            tracing::error!("threat queue closed, dropping detection");
                        }
                    }
                    self.metrics.record_event(start.elapsed().as_secs_f64() * 1000.0, self.config.latency_samples);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "supervisor lagged behind the event bus, resuming at live tail");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("event bus closed, stopping ingest loop");
                    break;
                }
            }
        }
    }

    async fn drain_threats(self: Arc<Self>, mut threat_rx: mpsc::Receiver<ThreatDetection>, response_tx: mpsc::Sender<sentinel_core::ResponseAction>) {
        while let Some(detection) = threat_rx.recv().await {
            self.metrics.threats_processed.fetch_add(1, Ordering::Relaxed);
            self.record_detection(detection.clone());

            self.alerts.raise(&detection).await;
            let actions = self.responder.respond(&detection).await;
            for action in actions {
                if response_tx.send(action).await.is_err() {
                    tracing::error!("response queue closed, dropping response action");
                }
            }
        }
    }

    async fn drain_responses(self: Arc<Self>, mut response_rx: mpsc::Receiver<sentinel_core::ResponseAction>) {
        while let Some(action) = response_rx.recv().await {
            self.metrics.responses_processed.fetch_add(1, Ordering::Relaxed);
            let _ = self
                .audit
                .append(json!({"kind": "response_action", "action_id": action.action_id, "action_type": format!("{:?}", action.action_type), "success": action.success}))
                .await;
        }
    }

    fn record_detection(&self, detection: ThreatDetection) {
        let mut recent = self.recent_detections.lock().unwrap();
        let now = Utc::now();
        recent.push_back((now, detection));
        let window = self.config.detection_window;
        while matches!(recent.front(), Some((t, _)) if now - *t > window) {
            recent.pop_front();
        }
    }

    async fn emergency_eval_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.emergency_eval_interval);
        loop {
            ticker.tick().await;
            let detections: Vec<ThreatDetection> = self.recent_detections.lock().unwrap().iter().map(|(_, d)| d.clone()).collect();
            if detections.is_empty() {
                continue;
            }
            self.emergency.evaluate(&detections, &self.audit).await;
        }
    }

    async fn health_check_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.health_check_interval);
        loop {
            ticker.tick().await;
            for (name, component) in &self.components {
                let status = component.status();
                if status.errors > 0 {
                    tracing::warn!(component = name.as_str(), errors = status.errors, "component reporting errors");
                }
                if !status.running {
                    tracing::error!(component = name.as_str(), "component is not running");
                }
            }
        }
    }

    pub fn snapshot(&self) -> SupervisorSnapshot {
        let uptime = self.started_at.elapsed();
        let events_processed = self.metrics.events_processed.load(Ordering::Relaxed);
        let events_per_second = if uptime.as_secs_f64() > 0.0 { events_processed as f64 / uptime.as_secs_f64() } else { 0.0 };

        SupervisorSnapshot {
            events_per_second,
            p50_latency_ms: self.metrics.p50_latency_ms(),
            threats_processed: self.metrics.threats_processed.load(Ordering::Relaxed),
            responses_processed: self.metrics.responses_processed.load(Ordering::Relaxed),
            emergency_level: self.emergency.level(),
            components: self.components.iter().map(|(name, c)| ComponentHealth { name: name.clone(), status: c.status() }).collect(),
            uptime,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_core::HmacSecret;
    use sentinel_detect::DetectionPipelineConfig;
    use sentinel_respond::{EmergencyConfig, ResponseOrchestrator};
    use std::sync::Arc;
    use tokio::sync::mpsc as tmpsc;

    async fn test_audit() -> (Arc<AuditChain>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let chain = AuditChain::open(dir.path().join("audit.ndjson"), HmacSecret::generate()).await.unwrap();
        (Arc::new(chain), dir)
    }

    #[tokio::test]
    async fn union_select_event_flows_through_to_threats_processed() {
        let (audit, _dir) = test_audit().await;
        let secret = HmacSecret::generate();
        let (event_tx, event_rx) = tmpsc::unbounded_channel();
        let bus = Arc::new(EventBus::new(event_rx, secret.clone(), Default::default()));
        let bus_clone = Arc::clone(&bus);
        tokio::spawn(async move { bus_clone.run(sentinel_core::StopSignal::new()).await });

        let alerts = Arc::new(AlertManager::new(Default::default(), Arc::new(sentinel_alert::LoggingNotifier::default())));
        let responder = Arc::new(ResponseOrchestrator::new(
            sentinel_core::ResponseConfig {
                auto_response_enabled: true,
                max_actions_per_minute: 100,
                credential_rotation_enabled: true,
                session_termination_enabled: true,
                component_isolation_enabled: true,
                backup_activation_enabled: false,
                credential_rollback_deadline_minutes: 30,
                backup_endpoint: None,
            },
            Arc::new(sentinel_respond::LoggingExecutor),
        ));
        let emergency = Arc::new(EmergencyProtection::new(EmergencyConfig::default()));

        let supervisor = Arc::new(Supervisor::new(SupervisorConfig::default(), DetectionPipeline::new(DetectionPipelineConfig::default()), alerts, responder, emergency, Arc::clone(&audit)));

        let run_handle = {
            let supervisor = Arc::clone(&supervisor);
            let bus = Arc::clone(&bus);
            tokio::spawn(async move { supervisor.run(bus).await })
        };

        let event = sentinel_core::InfrastructureEvent::new(
            "statement_observed",
            "203.0.113.5",
            "app_user",
            sentinel_core::TargetComponent::Database,
            sentinel_core::EventDetails { query: Some("SELECT 1 UNION SELECT user, password FROM mysql.user".to_string()), ..Default::default() },
            0.5,
            &secret,
        );
        event_tx.send(event).unwrap();

        tokio::time::sleep(StdDuration::from_millis(200)).await;
        let snapshot = supervisor.snapshot();
        assert!(snapshot.threats_processed >= 1);

        run_handle.abort();
    }
}
