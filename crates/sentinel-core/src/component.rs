//! The capability a long-lived pipeline stage implements, so that any
//! stage can be wired by capability rather than by concrete type.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// A shared, cooperative stop signal. Every long-running loop checks
/// this at the top of each iteration and after each blocking call
/// ("Cancellation is cooperative").
#[derive(Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct ComponentStatus {
    pub running: bool,
    pub started_at: Option<Instant>,
    pub cycles: u64,
    pub errors: u32,
    pub events_emitted: u64,
}

impl Default for ComponentStatus {
    fn default() -> Self {
        Self {
            running: false,
            started_at: None,
            cycles: 0,
            errors: 0,
            events_emitted: 0,
        }
    }
}

/// Capability trait every pipeline stage (C4 through C13) implements.
/// The orchestrator (C14) addresses components through this trait, by
/// a stable handle, rather than holding concrete cross-references that
/// would cycle back through the registry.
#[async_trait]
pub trait SecurityComponent: Send + Sync {
    fn name(&self) -> &str;

    /// Run until `stop` is signalled or a fatal internal error occurs.
    async fn run(&self, stop: StopSignal);

    fn status(&self) -> ComponentStatus;
}
