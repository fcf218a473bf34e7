//! C5: event normalizer and bus
//!
//! Owns the one ring buffer of `InfrastructureEvent` history
//! ("Ownership"); C6/C7/C8 never write to it, only
//! read through [`EventBus::get_events`] or subscribe to the live
//! `broadcast` fan-out.

use crate::error::EventsError;
use chrono::{DateTime, Duration, Utc};
use sentinel_core::{ComponentStatus, HmacSecret, InfrastructureEvent, SecurityComponent, StopSignal};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex as StdMutex;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};

#[derive(Debug, Clone)]
pub struct EventBusConfig {
    pub ring_capacity: usize,
    pub retention: Duration,
    pub dedup_window: Duration,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 50_000,
            retention: Duration::hours(48),
            dedup_window: Duration::seconds(5),
        }
    }
}

struct Ring {
    events: VecDeque<InfrastructureEvent>,
}

/// C5. Construct once, share behind an `Arc`; `ingest` is the only
/// mutating entry point besides the eviction sweep `run` performs.
pub struct EventBus {
    config: EventBusConfig,
    secret: HmacSecret,
    ring: RwLock<Ring>,
    recent_fingerprints: StdMutex<HashMap<String, DateTime<Utc>>>,
    tx: broadcast::Sender<InfrastructureEvent>,
    input: Mutex<Option<mpsc::UnboundedReceiver<InfrastructureEvent>>>,
    status: StdMutex<ComponentStatus>,
}

impl EventBus {
    pub fn new(
        input: mpsc::UnboundedReceiver<InfrastructureEvent>,
        secret: HmacSecret,
        config: EventBusConfig,
    ) -> Self {
        let (tx, _rx) = broadcast::channel(4096);
        Self {
            config,
            secret,
            ring: RwLock::new(Ring { events: VecDeque::new() }),
            recent_fingerprints: StdMutex::new(HashMap::new()),
            tx,
            input: Mutex::new(Some(input)),
            status: StdMutex::new(ComponentStatus::default()),
        }
    }

    /// A fresh receiver onto the live fan-out. Delivery is best-effort:
    /// a subscriber that falls behind the `broadcast` channel's
    /// capacity sees `Lagged` and should re-synchronize via
    /// `get_events`.
    pub fn subscribe(&self) -> broadcast::Receiver<InfrastructureEvent> {
        self.tx.subscribe()
    }

    /// Range read over the retained history, inclusive of `start` and
    /// exclusive of `end`. Used by detectors to backfill after a
    /// `Lagged` notification and by C13's independent health poll.
    pub async fn get_events(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<InfrastructureEvent> {
        let ring = self.ring.read().await;
        ring.events
            .iter()
            .filter(|e| e.timestamp >= start && e.timestamp < end)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        // best-effort snapshot; callers doing exact accounting should
        // use `get_events` instead.
        self.status.lock().unwrap().cycles as usize
    }

    /// Accept one raw event from C4. Verifies its integrity hash,
    /// applies fingerprint dedup, stores it in the ring, and forwards
    /// it to subscribers unless it was suppressed as a duplicate.
    /// Returns `true` if the event was forwarded.
    pub async fn ingest(&self, event: InfrastructureEvent) -> bool {
        if !event.verify_integrity(&self.secret) {
            tracing::error!(event_id = %event.event_id, "event failed integrity verification, dropping");
            self.status.lock().unwrap().errors += 1;
            return false;
        }

        let fingerprint = event.fingerprint();
        let now = Utc::now();
        let is_duplicate = {
            let mut recent = self.recent_fingerprints.lock().unwrap();
            recent.retain(|_, seen_at| now - *seen_at <= self.config.dedup_window);
            let duplicate = recent
                .get(&fingerprint)
                .map(|seen_at| now - *seen_at <= self.config.dedup_window)
                .unwrap_or(false);
            recent.insert(fingerprint.clone(), now);
            duplicate
        };

        if is_duplicate {
            tracing::debug!(%fingerprint, "duplicate event suppressed from forwarding");
            return false;
        }

        {
            let mut ring = self.ring.write().await;
            ring.events.push_back(event.clone());
            while ring.events.len() > self.config.ring_capacity {
                ring.events.pop_front();
            }
        }

        self.status.lock().unwrap().events_emitted += 1;
        // A send error just means no subscribers are currently
        // listening; the event is still retained in the ring.
        let _ = self.tx.send(event);
        true
    }

    async fn evict_expired(&self) {
        let cutoff = Utc::now() - self.config.retention;
        let mut ring = self.ring.write().await;
        while matches!(ring.events.front(), Some(e) if e.timestamp < cutoff) {
            ring.events.pop_front();
        }
    }
}

#[async_trait::async_trait]
impl SecurityComponent for EventBus {
    fn name(&self) -> &str {
        "sentinel-events"
    }

    async fn run(&self, stop: StopSignal) {
        self.status.lock().unwrap().running = true;
        tracing::info!(component = self.name(), "started");

        let mut receiver = self
            .input
            .lock()
            .await
            .take()
            .expect("EventBus::run called more than once");
        let mut eviction_tick = tokio::time::interval(std::time::Duration::from_secs(60));

        loop {
            if stop.is_stopped() {
                break;
            }
            tokio::select! {
                maybe_event = receiver.recv() => {
                    match maybe_event {
                        Some(event) => {
                            self.ingest(event).await;
                            self.status.lock().unwrap().cycles += 1;
                        }
                        None => {
                            tracing::warn!("event bus input channel closed, stopping");
                            break;
                        }
                    }
                }
                _ = eviction_tick.tick() => {
                    self.evict_expired().await;
                }
            }
        }

        self.status.lock().unwrap().running = false;
        tracing::info!(component = self.name(), "stopped");
    }

    fn status(&self) -> ComponentStatus {
        self.status.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_core::{EventDetails, TargetComponent};

    fn event(secret: &HmacSecret, event_type: &str, ip: &str) -> InfrastructureEvent {
        InfrastructureEvent::new(
            event_type,
            ip,
            "app",
            TargetComponent::Database,
            EventDetails::default(),
            0.1,
            secret,
        )
    }

    #[tokio::test]
    async fn ingest_stores_and_forwards_first_event() {
        let secret = HmacSecret::generate();
        let (_tx, rx) = mpsc::unbounded_channel();
        let bus = EventBus::new(rx, secret.clone(), EventBusConfig::default());
        let mut sub = bus.subscribe();

        let forwarded = bus.ingest(event(&secret, "session_observed", "10.0.0.1")).await;
        assert!(forwarded);
        assert!(sub.try_recv().is_ok());
    }

    #[tokio::test]
    async fn duplicate_fingerprint_within_window_is_suppressed() {
        let secret = HmacSecret::generate();
        let (_tx, rx) = mpsc::unbounded_channel();
        let bus = EventBus::new(rx, secret.clone(), EventBusConfig::default());

        let e1 = event(&secret, "session_observed", "10.0.0.1");
        let e2 = event(&secret, "session_observed", "10.0.0.1");
        assert!(bus.ingest(e1).await);
        assert!(!bus.ingest(e2).await);
    }

    #[tokio::test]
    async fn tampered_event_fails_integrity_check_and_is_dropped() {
        let secret = HmacSecret::generate();
        let (_tx, rx) = mpsc::unbounded_channel();
        let bus = EventBus::new(rx, secret.clone(), EventBusConfig::default());

        let mut bad = event(&secret, "session_observed", "10.0.0.1");
        bad.risk_score = 0.99;
        assert!(!bus.ingest(bad).await);
    }

    #[tokio::test]
    async fn get_events_filters_by_range() {
        let secret = HmacSecret::generate();
        let (_tx, rx) = mpsc::unbounded_channel();
        let bus = EventBus::new(rx, secret.clone(), EventBusConfig::default());
        bus.ingest(event(&secret, "session_observed", "10.0.0.1")).await;

        let all = bus.get_events(Utc::now() - Duration::minutes(1), Utc::now() + Duration::minutes(1)).await;
        assert_eq!(all.len(), 1);

        let none = bus.get_events(Utc::now() + Duration::hours(1), Utc::now() + Duration::hours(2)).await;
        assert!(none.is_empty());
    }
}
