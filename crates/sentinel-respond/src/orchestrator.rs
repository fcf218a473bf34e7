//! C10: response orchestrator.
//!
//! Turns a `ThreatDetection` into a `ResponseAction` per the severity
//! plan matrix below, executes it through a pluggable `ActionExecutor`,
//! and rate-limits execution system-wide. Actions that arrive while the
//! limiter is saturated are queued rather than dropped -- losing a
//! planned response is worse than delaying it -- and drained in arrival
//! order by `run`/`drain_deferred`.

use crate::error::ResponseError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::RngCore;
use sentinel_core::{
    ActionType, ComponentStatus, ResponseConfig, SecurityComponent, Severity, StopSignal, TargetComponent, ThreatDetection,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    None,
    NetworkLevel,
    ServiceLevel,
    Complete,
}

#[derive(Debug, Clone, Copy)]
pub struct ResponsePlan {
    pub isolation: IsolationLevel,
    pub rotate_credentials: bool,
    pub switch_backup: bool,
}

/// Outbound side of a response action. The protected infrastructure is
/// never touched directly by the orchestrator -- every side effect goes
/// through this trait so the orchestrator's logic is testable without a
/// live database or network fabric.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn isolate(&self, target: &str, level: IsolationLevel) -> Result<String, ResponseError>;
    async fn rotate_credentials(&self, account: &str, new_secret: &str) -> Result<(), ResponseError>;
    async fn switch_backup(&self, endpoint: &str) -> Result<String, ResponseError>;
    async fn rollback_isolation(&self, rollback_token: &str) -> Result<(), ResponseError>;
    async fn restore_credentials(&self, account: &str, old_secret: &str) -> Result<(), ResponseError>;
    async fn switch_to_primary(&self) -> Result<(), ResponseError>;
}

/// Default executor that performs no infrastructure side effects and
/// only logs -- used for standalone operation and in tests.
pub struct LoggingExecutor;

#[async_trait]
impl ActionExecutor for LoggingExecutor {
    async fn isolate(&self, target: &str, level: IsolationLevel) -> Result<String, ResponseError> {
        tracing::info!(target, ?level, "isolating component (logging executor, no-op)");
        Ok(format!("isolate-{}", Uuid::new_v4()))
    }

    async fn rotate_credentials(&self, account: &str, _new_secret: &str) -> Result<(), ResponseError> {
        tracing::info!(account, "rotating credentials (logging executor, no-op)");
        Ok(())
    }

    async fn switch_backup(&self, endpoint: &str) -> Result<String, ResponseError> {
        tracing::info!(endpoint, "switching to backup (logging executor, no-op)");
        Ok(format!("backup-{}", Uuid::new_v4()))
    }

    async fn rollback_isolation(&self, rollback_token: &str) -> Result<(), ResponseError> {
        tracing::info!(rollback_token, "rolling back isolation (logging executor, no-op)");
        Ok(())
    }

    async fn restore_credentials(&self, account: &str, _old_secret: &str) -> Result<(), ResponseError> {
        tracing::info!(account, "restoring credentials (logging executor, no-op)");
        Ok(())
    }

    async fn switch_to_primary(&self) -> Result<(), ResponseError> {
        tracing::info!("switching back to primary endpoint (logging executor, no-op)");
        Ok(())
    }
}

fn plan_for(severity: Severity, detection: &ThreatDetection, backup_endpoint_configured: bool) -> ResponsePlan {
    let user_account_affected = detection.affected_components.contains(&TargetComponent::UserAccount);
    let credential_indicators = detection.indicators.keys().any(|k| k.contains("credential") || k.contains("password"));

    match severity {
        Severity::Low => ResponsePlan {
            isolation: IsolationLevel::None,
            rotate_credentials: false,
            switch_backup: false,
        },
        Severity::Medium => ResponsePlan {
            isolation: IsolationLevel::NetworkLevel,
            rotate_credentials: false,
            switch_backup: false,
        },
        Severity::High => ResponsePlan {
            isolation: IsolationLevel::ServiceLevel,
            rotate_credentials: user_account_affected || credential_indicators,
            switch_backup: backup_endpoint_configured,
        },
        Severity::Critical => ResponsePlan {
            isolation: IsolationLevel::Complete,
            rotate_credentials: true,
            switch_backup: backup_endpoint_configured,
        },
    }
}

fn validate_target(target: &str) -> Result<TargetComponent, ResponseError> {
    match target {
        "database" => Ok(TargetComponent::Database),
        "user_account" => Ok(TargetComponent::UserAccount),
        "perf_schema" => Ok(TargetComponent::PerfSchema),
        "audit_log" => Ok(TargetComponent::AuditLog),
        "monitoring_service" => Ok(TargetComponent::MonitoringService),
        other => Err(ResponseError::InvalidAction {
            action: "isolate".to_string(),
            reason: format!("unknown target component {other}"),
        }),
    }
}

struct RateLimiter {
    max_per_minute: u32,
    recent: Mutex<VecDeque<DateTime<Utc>>>,
}

impl RateLimiter {
    fn new(max_per_minute: u32) -> Self {
        Self {
            max_per_minute,
            recent: Mutex::new(VecDeque::new()),
        }
    }

    fn try_acquire(&self) -> bool {
        let now = Utc::now();
        let mut recent = self.recent.lock().unwrap();
        while let Some(front) = recent.front() {
            if now - *front > chrono::Duration::seconds(60) {
                recent.pop_front();
            } else {
                break;
            }
        }
        if recent.len() as u32 >= self.max_per_minute {
            false
        } else {
            recent.push_back(now);
            true
        }
    }
}

#[derive(Clone)]
struct RollbackEntry {
    action_type: ActionType,
    target: String,
    isolation_token: Option<String>,
    old_credential: Option<String>,
    deadline: DateTime<Utc>,
}

/// A rollback slot is kept (never removed) once its action is
/// executed, so a repeat `rollback_action` call can distinguish
/// "already rolled back" from "never existed".
enum RollbackSlot {
    Pending(RollbackEntry),
    RolledBack,
}

pub struct ResponseOrchestrator {
    config: ResponseConfig,
    executor: std::sync::Arc<dyn ActionExecutor>,
    rate_limiter: RateLimiter,
    deferred: Mutex<VecDeque<(ThreatDetection, String)>>,
    rollbacks: Mutex<HashMap<Uuid, RollbackSlot>>,
    actions_processed: AtomicU64,
    status: Mutex<ComponentStatus>,
}

impl ResponseOrchestrator {
    pub fn new(config: ResponseConfig, executor: std::sync::Arc<dyn ActionExecutor>) -> Self {
        let rate_limiter = RateLimiter::new(config.max_actions_per_minute);
        Self {
            config,
            executor,
            rate_limiter,
            deferred: Mutex::new(VecDeque::new()),
            rollbacks: Mutex::new(HashMap::new()),
            actions_processed: AtomicU64::new(0),
            status: Mutex::new(ComponentStatus::default()),
        }
    }

    fn target_name(detection: &ThreatDetection) -> String {
        detection
            .affected_components
            .iter()
            .next()
            .map(|c| match c {
                TargetComponent::Database => "database",
                TargetComponent::UserAccount => "user_account",
                TargetComponent::PerfSchema => "perf_schema",
                TargetComponent::AuditLog => "audit_log",
                TargetComponent::MonitoringService => "monitoring_service",
            })
            .unwrap_or("database")
            .to_string()
    }

    /// Plan and, if the rate limiter allows, immediately execute a
    /// response for `detection`. If the limiter is saturated, the
    /// detection is queued and a placeholder action is returned so the
    /// caller (and C9's correlator) still sees a same-tick response.
    pub async fn respond(&self, detection: &ThreatDetection) -> Vec<sentinel_core::ResponseAction> {
        if !self.config.auto_response_enabled {
            return Vec::new();
        }

        let target = Self::target_name(detection);
        if validate_target(&target).is_err() {
            return Vec::new();
        }

        if self.rate_limiter.try_acquire() {
            self.execute_plan(detection, &target).await
        } else {
            tracing::warn!(target, "response rate limit reached, deferring");
            self.deferred.lock().unwrap().push_back((detection.clone(), target));
            Vec::new()
        }
    }

    /// Drain queued detections while the limiter allows, preserving
    /// arrival order. Call on a fixed cadence from the component loop.
    pub async fn drain_deferred(&self) {
        loop {
            if !self.rate_limiter.try_acquire() {
                return;
            }
            let next = self.deferred.lock().unwrap().pop_front();
            match next {
                Some((detection, target)) => {
                    self.execute_plan(&detection, &target).await;
                }
                None => return,
            }
        }
    }

    async fn execute_plan(&self, detection: &ThreatDetection, target: &str) -> Vec<sentinel_core::ResponseAction> {
        let plan = plan_for(detection.severity, detection, self.config.backup_endpoint.is_some());
        let mut actions = Vec::new();

        if plan.isolation != IsolationLevel::None && self.config.session_termination_enabled {
            actions.push(self.do_isolate(target, plan.isolation).await);
        }
        if plan.rotate_credentials && self.config.credential_rotation_enabled {
            actions.push(self.do_rotate_credentials(target).await);
        }
        if plan.switch_backup && self.config.backup_activation_enabled {
            if let Some(endpoint) = self.config.backup_endpoint.clone() {
                actions.push(self.do_switch_backup(&endpoint).await);
            }
        }

        self.actions_processed.fetch_add(actions.len() as u64, Ordering::Relaxed);
        actions
    }

    async fn do_isolate(&self, target: &str, level: IsolationLevel) -> sentinel_core::ResponseAction {
        let action_id = Uuid::new_v4();
        match self.executor.isolate(target, level).await {
            Ok(token) => {
                self.rollbacks.lock().unwrap().insert(
                    action_id,
                    RollbackSlot::Pending(RollbackEntry {
                        action_type: ActionType::Isolate,
                        target: target.to_string(),
                        isolation_token: Some(token.clone()),
                        old_credential: None,
                        deadline: Utc::now() + chrono::Duration::hours(24),
                    }),
                );
                sentinel_core::ResponseAction {
                    action_id,
                    started_at: Utc::now(),
                    action_type: ActionType::Isolate,
                    target: target.to_string(),
                    parameters: HashMap::from([("level".to_string(), serde_json::json!(format!("{level:?}")))]),
                    success: true,
                    rollback_token: Some(token),
                    error_message: None,
                }
            }
            Err(e) => {
                tracing::error!(error = %e, target, "isolation failed");
                sentinel_core::ResponseAction {
                    action_id,
                    started_at: Utc::now(),
                    action_type: ActionType::Isolate,
                    target: target.to_string(),
                    parameters: HashMap::new(),
                    success: false,
                    rollback_token: None,
                    error_message: Some(e.to_string()),
                }
            }
        }
    }

    async fn do_rotate_credentials(&self, target: &str) -> sentinel_core::ResponseAction {
        let action_id = Uuid::new_v4();
        let mut bytes = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut bytes);
        let new_secret = hex::encode(bytes);
        let old_secret = format!("previous-secret-placeholder-{action_id}");

        match self.executor.rotate_credentials(target, &new_secret).await {
            Ok(()) => {
                let token = format!("cred-{action_id}");
                self.rollbacks.lock().unwrap().insert(
                    action_id,
                    RollbackSlot::Pending(RollbackEntry {
                        action_type: ActionType::RotateCredentials,
                        target: target.to_string(),
                        isolation_token: None,
                        old_credential: Some(old_secret),
                        deadline: Utc::now() + chrono::Duration::minutes(self.config.credential_rollback_deadline_minutes as i64),
                    }),
                );
                sentinel_core::ResponseAction {
                    action_id,
                    started_at: Utc::now(),
                    action_type: ActionType::RotateCredentials,
                    target: target.to_string(),
                    parameters: HashMap::new(),
                    success: true,
                    rollback_token: Some(token),
                    error_message: None,
                }
            }
            Err(e) => {
                tracing::error!(error = %e, target, "credential rotation failed");
                sentinel_core::ResponseAction {
                    action_id,
                    started_at: Utc::now(),
                    action_type: ActionType::RotateCredentials,
                    target: target.to_string(),
                    parameters: HashMap::new(),
                    success: false,
                    rollback_token: None,
                    error_message: Some(e.to_string()),
                }
            }
        }
    }

    async fn do_switch_backup(&self, endpoint: &str) -> sentinel_core::ResponseAction {
        let action_id = Uuid::new_v4();
        match self.executor.switch_backup(endpoint).await {
            Ok(token) => sentinel_core::ResponseAction {
                action_id,
                started_at: Utc::now(),
                action_type: ActionType::SwitchBackup,
                target: endpoint.to_string(),
                parameters: HashMap::new(),
                success: true,
                rollback_token: Some(token),
                error_message: None,
            },
            Err(e) => sentinel_core::ResponseAction {
                action_id,
                started_at: Utc::now(),
                action_type: ActionType::SwitchBackup,
                target: endpoint.to_string(),
                parameters: HashMap::new(),
                success: false,
                rollback_token: None,
                error_message: Some(e.to_string()),
            },
        }
    }

    /// Reverse a previously executed action: un-isolate, restore the
    /// old credential if still within its deadline, or switch back to
    /// the primary endpoint.
    pub async fn rollback_action(&self, action_id: Uuid) -> Result<(), ResponseError> {
        let entry = {
            let rollbacks = self.rollbacks.lock().unwrap();
            match rollbacks.get(&action_id) {
                None => return Err(ResponseError::UnknownAction(action_id)),
                Some(RollbackSlot::RolledBack) => return Err(ResponseError::AlreadyRolledBack(action_id)),
                Some(RollbackSlot::Pending(entry)) => entry.clone(),
            }
        };

        if Utc::now() > entry.deadline {
            return Err(ResponseError::RollbackExpired(action_id));
        }

        let result = match entry.action_type {
            ActionType::Isolate => {
                let token = entry.isolation_token.ok_or_else(|| ResponseError::ExecutorFailed("missing isolation token".to_string()))?;
                self.executor.rollback_isolation(&token).await
            }
            ActionType::RotateCredentials => {
                let old = entry.old_credential.ok_or_else(|| ResponseError::ExecutorFailed("missing old credential".to_string()))?;
                self.executor.restore_credentials(&entry.target, &old).await
            }
            ActionType::SwitchBackup => self.executor.switch_to_primary().await,
            other => Err(ResponseError::InvalidAction {
                action: format!("{other:?}"),
                reason: "not a rollback-capable action type".to_string(),
            }),
        };

        if result.is_ok() {
            self.rollbacks.lock().unwrap().insert(action_id, RollbackSlot::RolledBack);
        }
        result
    }

    pub fn actions_processed(&self) -> u64 {
        self.actions_processed.load(Ordering::Relaxed)
    }

    pub fn pending_deferred(&self) -> usize {
        self.deferred.lock().unwrap().len()
    }
}

#[async_trait]
impl SecurityComponent for ResponseOrchestrator {
    fn name(&self) -> &str {
        "response-orchestrator"
    }

    async fn run(&self, stop: StopSignal) {
        self.status.lock().unwrap().running = true;
        tracing::info!(component = self.name(), "started");

        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(500));
        loop {
            if stop.is_stopped() {
                break;
            }
            ticker.tick().await;
            if stop.is_stopped() {
                break;
            }
            self.drain_deferred().await;
            self.status.lock().unwrap().cycles += 1;
        }

        self.status.lock().unwrap().running = false;
        tracing::info!(component = self.name(), "stopped");
    }

    fn status(&self) -> ComponentStatus {
        let mut s = self.status.lock().unwrap().clone();
        s.events_emitted = self.actions_processed.load(Ordering::Relaxed);
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn detection(severity: Severity, component: TargetComponent) -> ThreatDetection {
        ThreatDetection {
            detection_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            threat_type: "sql_injection".to_string(),
            severity,
            affected_components: [component].into_iter().collect(),
            indicators: Map::new(),
            confidence: 0.9,
            recommended_actions: Vec::new(),
            evidence_chain: vec![Uuid::new_v4()],
        }
    }

    fn config() -> ResponseConfig {
        ResponseConfig {
            auto_response_enabled: true,
            max_actions_per_minute: 10,
            credential_rotation_enabled: true,
            session_termination_enabled: true,
            component_isolation_enabled: true,
            backup_activation_enabled: true,
            credential_rollback_deadline_minutes: 30,
            backup_endpoint: Some("backup.example.internal:3306".to_string()),
        }
    }

    #[tokio::test]
    async fn critical_detection_isolates_rotates_and_switches_backup() {
        let orchestrator = ResponseOrchestrator::new(config(), std::sync::Arc::new(LoggingExecutor));
        let d = detection(Severity::Critical, TargetComponent::UserAccount);
        let actions = orchestrator.respond(&d).await;
        assert!(actions.iter().any(|a| a.action_type == ActionType::Isolate));
        assert!(actions.iter().any(|a| a.action_type == ActionType::RotateCredentials));
        assert!(actions.iter().any(|a| a.action_type == ActionType::SwitchBackup));
    }

    #[tokio::test]
    async fn low_detection_takes_no_action() {
        let orchestrator = ResponseOrchestrator::new(config(), std::sync::Arc::new(LoggingExecutor));
        let d = detection(Severity::Low, TargetComponent::Database);
        let actions = orchestrator.respond(&d).await;
        assert!(actions.is_empty());
    }

    #[tokio::test]
    async fn rollback_reverses_isolation_within_deadline() {
        let orchestrator = ResponseOrchestrator::new(config(), std::sync::Arc::new(LoggingExecutor));
        let d = detection(Severity::High, TargetComponent::Database);
        let actions = orchestrator.respond(&d).await;
        let isolate_action = actions.iter().find(|a| a.action_type == ActionType::Isolate).unwrap();
        let result = orchestrator.rollback_action(isolate_action.action_id).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn repeat_rollback_reports_already_rolled_back_not_unknown() {
        let orchestrator = ResponseOrchestrator::new(config(), std::sync::Arc::new(LoggingExecutor));
        let d = detection(Severity::High, TargetComponent::Database);
        let actions = orchestrator.respond(&d).await;
        let isolate_action = actions.iter().find(|a| a.action_type == ActionType::Isolate).unwrap();

        assert!(orchestrator.rollback_action(isolate_action.action_id).await.is_ok());
        let second = orchestrator.rollback_action(isolate_action.action_id).await;
        assert!(matches!(second, Err(ResponseError::AlreadyRolledBack(_))));
    }

    #[tokio::test]
    async fn critical_detection_rotates_credentials_even_when_database_sorts_first() {
        let orchestrator = ResponseOrchestrator::new(config(), std::sync::Arc::new(LoggingExecutor));
        let d = detection(Severity::Critical, TargetComponent::Database);
        assert_eq!(d.affected_components.iter().next(), Some(&TargetComponent::Database));
        let actions = orchestrator.respond(&d).await;
        assert!(actions.iter().any(|a| a.action_type == ActionType::RotateCredentials));
    }

    #[test]
    fn rate_limiter_defers_past_the_per_minute_cap() {
        let limiter = RateLimiter::new(2);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }
}
