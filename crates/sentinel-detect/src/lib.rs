//! Detection pipeline: C6 behavioral baseline, C7 signature patterns,
//! C8 advanced analyzers, C9 sequence correlation and adaptive updates.
//!
//! Each stage is independently usable; `DetectionPipeline` wires all
//! four in the order an event arrives: baseline, then signatures, then
//! the advanced analyzers, feeding every resulting `ThreatDetection`
//! into the correlator.

pub mod advanced;
pub mod baseline;
pub mod correlator;
pub mod error;
pub mod patterns;

pub use advanced::{AdvancedConfig, AdvancedThreatDetector};
pub use baseline::{BaselineConfig, BaselineDetector};
pub use correlator::{Correlator, CorrelatorConfig, SecurityUpdate, UpdateKind};
pub use error::DetectionError;
pub use patterns::{SignatureConfig, SignatureDetector};

use sentinel_core::{AttackSequence, InfrastructureEvent, ThreatDetection};

pub struct DetectionPipelineConfig {
    pub baseline: BaselineConfig,
    pub signature: SignatureConfig,
    pub advanced: AdvancedConfig,
    pub correlator: CorrelatorConfig,
}

impl Default for DetectionPipelineConfig {
    fn default() -> Self {
        Self {
            baseline: BaselineConfig::default(),
            signature: SignatureConfig::default(),
            advanced: AdvancedConfig::default(),
            correlator: CorrelatorConfig::default(),
        }
    }
}

pub struct DetectionPipeline {
    baseline: BaselineDetector,
    signature: SignatureDetector,
    advanced: AdvancedThreatDetector,
    correlator: Correlator,
}

impl DetectionPipeline {
    pub fn new(config: DetectionPipelineConfig) -> Self {
        Self {
            baseline: BaselineDetector::new(config.baseline),
            signature: SignatureDetector::new(config.signature),
            advanced: AdvancedThreatDetector::new(config.advanced),
            correlator: Correlator::new(config.correlator),
        }
    }

    /// Run one event through every detector, returning its detections
    /// and any attack sequence that just crossed the correlation
    /// threshold as a result.
    pub fn process(&self, event: &InfrastructureEvent) -> (Vec<ThreatDetection>, Vec<AttackSequence>) {
        let mut detections = self.baseline.process_event(event);
        detections.extend(self.signature.scan(event));
        detections.extend(self.advanced.analyze(event));

        let mut sequences = Vec::new();
        for detection in &detections {
            if let Some(seq) = self.correlator.correlate(detection, &event.source_ip, &event.principal) {
                sequences.push(seq);
            }
        }
        (detections, sequences)
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    pub fn baseline(&self) -> &BaselineDetector {
        &self.baseline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_core::{EventDetails, HmacSecret, TargetComponent};

    #[test]
    fn union_select_flows_through_full_pipeline() {
        let secret = HmacSecret::generate();
        let pipeline = DetectionPipeline::new(DetectionPipelineConfig::default());
        let event = InfrastructureEvent::new(
            "statement_observed",
            "203.0.113.5",
            "app_user",
            TargetComponent::Database,
            EventDetails {
                query: Some("SELECT 1 UNION SELECT user, password FROM mysql.user".to_string()),
                ..Default::default()
            },
            0.5,
            &secret,
        );
        let (detections, _sequences) = pipeline.process(&event);
        assert!(detections.iter().any(|d| d.threat_type == "sql_injection"));
    }
}
