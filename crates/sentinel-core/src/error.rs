use thiserror::Error;

/// Errors from the tamper-evident audit chain (C1). Audit errors
/// propagate to the caller rather than being swallowed -- the caller
/// must not believe a write succeeded when it didn't.
#[derive(Error, Debug)]
pub enum AuditError {
    #[error("audit log io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("audit log serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("audit chain verification failed at byte offset {offset}: {reason}")]
    ChainBroken { offset: u64, reason: String },

    #[error("audit writer timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Errors from the config store (C2). Configuration errors are fatal
/// at startup but recoverable at reload -- callers that hit
/// `ConfigError` during a reload should fall back to
/// `SentinelConfig::secure_defaults()`.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config is not valid json: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("config validation failed: {0:?}")]
    Invalid(Vec<String>),
}
