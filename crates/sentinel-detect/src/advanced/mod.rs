//! C8: advanced threat analyzers layered above C6/C7 -- persistence,
//! exfiltration, and signature-evasion. Each is independent and stateful
//! per-principal; a caller runs all three over the same event.

mod evasion;
mod exfiltration;
mod persistence;

pub use evasion::{EvasionAnalyzer, EvasionConfig};
pub use exfiltration::{ExfiltrationAnalyzer, ExfiltrationConfig};
pub use persistence::{PersistenceAnalyzer, PersistenceConfig};

use sentinel_core::{InfrastructureEvent, ThreatDetection};

pub struct AdvancedConfig {
    pub persistence: PersistenceConfig,
    pub exfiltration: ExfiltrationConfig,
    pub evasion: EvasionConfig,
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        Self {
            persistence: PersistenceConfig::default(),
            exfiltration: ExfiltrationConfig::default(),
            evasion: EvasionConfig::default(),
        }
    }
}

pub struct AdvancedThreatDetector {
    persistence: PersistenceAnalyzer,
    exfiltration: ExfiltrationAnalyzer,
    evasion: EvasionAnalyzer,
}

impl AdvancedThreatDetector {
    pub fn new(config: AdvancedConfig) -> Self {
        Self {
            persistence: PersistenceAnalyzer::new(config.persistence),
            exfiltration: ExfiltrationAnalyzer::new(config.exfiltration),
            evasion: EvasionAnalyzer::new(config.evasion),
        }
    }

    pub fn analyze(&self, event: &InfrastructureEvent) -> Vec<ThreatDetection> {
        [
            self.persistence.analyze(event),
            self.exfiltration.analyze(event),
            self.evasion.analyze(event),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}
