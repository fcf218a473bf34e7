use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("unknown alert {0}")]
    UnknownAlert(Uuid),
    #[error("alert {0} is already resolved")]
    AlreadyTerminal(Uuid),
    #[error("notification delivery failed: {0}")]
    DeliveryFailed(String),
}
