//! C5: event normalizer and bus -- ring-buffered history, fingerprint
//! dedup, and subscriber fan-out sitting between C4 and the detectors.

pub mod bus;
pub mod error;

pub use bus::{EventBus, EventBusConfig};
pub use error::EventsError;
