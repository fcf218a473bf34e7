use sentinel_core::{ResponseConfig, Severity, TargetComponent, ThreatDetection};
use sentinel_respond::{LoggingExecutor, ResponseOrchestrator};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

fn detection() -> ThreatDetection {
    ThreatDetection {
        detection_id: Uuid::new_v4(),
        timestamp: chrono::Utc::now(),
        threat_type: "sql_injection".to_string(),
        severity: Severity::Medium,
        affected_components: [TargetComponent::Database].into_iter().collect(),
        indicators: HashMap::new(),
        confidence: 0.6,
        recommended_actions: Vec::new(),
        evidence_chain: vec![Uuid::new_v4()],
    }
}

fn config(max_per_minute: u32) -> ResponseConfig {
    ResponseConfig {
        auto_response_enabled: true,
        max_actions_per_minute: max_per_minute,
        credential_rotation_enabled: true,
        session_termination_enabled: true,
        component_isolation_enabled: true,
        backup_activation_enabled: true,
        credential_rollback_deadline_minutes: 30,
        backup_endpoint: None,
    }
}

#[tokio::test]
async fn overflow_actions_are_deferred_not_dropped() {
    let orchestrator = ResponseOrchestrator::new(config(2), Arc::new(LoggingExecutor));

    let first = orchestrator.respond(&detection()).await;
    let second = orchestrator.respond(&detection()).await;
    assert!(!first.is_empty());
    assert!(!second.is_empty());

    // Third MEDIUM detection issues a network-level isolation action,
    // which consumes the limiter just like the first two -- so this
    // one should be deferred rather than dropped.
    let third = orchestrator.respond(&detection()).await;
    assert!(third.is_empty());
    assert_eq!(orchestrator.pending_deferred(), 1);

    orchestrator.drain_deferred().await;
    assert_eq!(orchestrator.pending_deferred(), 0);
}

#[tokio::test]
async fn disabled_auto_response_takes_no_action_and_never_queues() {
    let mut cfg = config(10);
    cfg.auto_response_enabled = false;
    let orchestrator = ResponseOrchestrator::new(cfg, Arc::new(LoggingExecutor));

    let actions = orchestrator.respond(&detection()).await;
    assert!(actions.is_empty());
    assert_eq!(orchestrator.pending_deferred(), 0);
}
