use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResponseError {
    #[error("invalid action parameters for {action}: {reason}")]
    InvalidAction { action: String, reason: String },

    #[error("unknown action id {0}")]
    UnknownAction(uuid::Uuid),

    #[error("action {0} was already rolled back")]
    AlreadyRolledBack(uuid::Uuid),

    #[error("rollback deadline for action {0} has already passed")]
    RollbackExpired(uuid::Uuid),

    #[error("executor failed: {0}")]
    ExecutorFailed(String),
}
