use thiserror::Error;

/// Detection errors are logged and drop only the offending event for
/// the detector that raised them -- the pipeline never stops over a
/// single bad observation.
#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("invalid pattern catalog entry {name}: {reason}")]
    InvalidPattern { name: String, reason: String },

    #[error("correlator update queue is full, dropping update")]
    UpdateQueueFull,

    #[error("unknown security update id {0}")]
    UnknownUpdate(uuid::Uuid),
}
