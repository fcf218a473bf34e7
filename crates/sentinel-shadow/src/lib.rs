//! File/log integrity validation (C3) and the independent shadow
//! monitor (C13) that watches the primary pipeline's own health.

pub mod error;
pub mod integrity;
pub mod monitor;

pub use error::ShadowError;
pub use integrity::{sha256_hex, IntegrityValidator};
pub use monitor::{BackupAlertChannel, LoggingBackupChannel, PrimaryHealthProbe, ShadowMonitor, ShadowMonitorConfig};
