use thiserror::Error;

#[derive(Error, Debug)]
pub enum EventsError {
    #[error("event bus receiver lagged, {0} events dropped from this subscriber's view")]
    Lagged(u64),
    #[error("event bus has no active subscribers")]
    NoSubscribers,
}
