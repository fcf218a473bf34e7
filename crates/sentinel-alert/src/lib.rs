//! Alert lifecycle: C12 maps detections to `Alert`s, suppresses
//! repeats of the same signature, escalates alerts that age past their
//! trigger window, and archives resolved alerts for a retention period.
//! Delivery is pluggable behind the `Notifier` trait; SMTP is the
//! default.

pub mod error;
pub mod manager;
pub mod notifier;

pub use error::AlertError;
pub use manager::{AlertCondition, AlertManager, AlertManagerConfig, EscalationRule, NotificationRule};
pub use notifier::{ChannelConfig, DeliveryOutcome, LoggingNotifier, Notifier, SmtpNotifier};
