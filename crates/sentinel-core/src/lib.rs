//! Shared foundation for the DB Sentinel monitoring pipeline.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       SENTINEL-CORE                             │
//! │                                                                   │
//! │   ┌──────────────┐   ┌──────────────┐   ┌──────────────────┐    │
//! │   │  AuditChain  │   │ ConfigStore  │   │   HmacSecret     │    │
//! │   │     (C1)     │   │     (C2)     │   │                  │    │
//! │   └──────────────┘   └──────────────┘   └──────────────────┘    │
//! │                                                                   │
//! │   shared data model: InfrastructureEvent, ThreatDetection,       │
//! │   Alert, ResponseAction, BaselineProfile, AttackSequence,        │
//! │   EmergencyState                                                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod audit;
pub mod component;
pub mod config;
pub mod error;
pub mod secret;
pub mod types;

pub use audit::{hmac_hex, AuditChain, AuditRecord, SinceCursor};
pub use component::{ComponentStatus, SecurityComponent, StopSignal};
pub use config::{
    ConfigStore, DatabaseConfig, DetectionConfig, DetectionThresholds, IntegrityConfig, LoggingConfig, MonitoringConfig,
    ResponseConfig, SentinelConfig, ShadowConfig,
};
pub use error::{AuditError, ConfigError};
pub use secret::HmacSecret;
pub use types::*;
