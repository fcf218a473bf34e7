//! C3: integrity validator. Baselines a configurable set of watched
//! files (config, audit log, ...) by SHA-256, re-hashes them on a
//! timer, and flags a detection the moment a hash drifts from its
//! baseline. `auto_restore` additionally copies the last verified
//! config backup back into place on mismatch.

use crate::error::ShadowError;
use chrono::{DateTime, Utc};
use sentinel_core::{EventDetails, Severity, TargetComponent, ThreatDetection};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[derive(Debug, Clone)]
struct WatchedFile {
    baseline: Option<String>,
    last_checked: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct VerifiedBackup {
    path: PathBuf,
    checksum: String,
    created_at: DateTime<Utc>,
}

pub struct IntegrityValidator {
    /// The file treated as "the config" for `auto_restore` purposes --
    /// the first entry of `watched_paths` by convention.
    config_path: PathBuf,
    auto_restore: bool,
    files: Mutex<HashMap<PathBuf, WatchedFile>>,
    last_backup: Mutex<Option<VerifiedBackup>>,
}

impl IntegrityValidator {
    pub fn new(watched_paths: Vec<PathBuf>, auto_restore: bool) -> Self {
        let config_path = watched_paths.first().cloned().unwrap_or_default();
        let files = watched_paths.into_iter().map(|p| (p, WatchedFile { baseline: None, last_checked: None })).collect();
        Self { config_path, auto_restore, files: Mutex::new(files), last_backup: Mutex::new(None) }
    }

    /// Hash every watched path and record it as the baseline. Files
    /// that don't exist yet are skipped -- they'll get a baseline on
    /// the first `verify_once` after they appear.
    pub fn establish_baselines(&self) {
        let paths: Vec<PathBuf> = self.files.lock().unwrap().keys().cloned().collect();
        for path in paths {
            if let Ok(bytes) = std::fs::read(&path) {
                let hash = sha256_hex(&bytes);
                let mut files = self.files.lock().unwrap();
                if let Some(entry) = files.get_mut(&path) {
                    entry.baseline = Some(hash);
                    entry.last_checked = Some(Utc::now());
                }
            }
        }
    }

    fn detection_for(path: &Path) -> ThreatDetection {
        let mut indicators = HashMap::new();
        indicators.insert("path".to_string(), serde_json::json!(path.display().to_string()));
        ThreatDetection {
            detection_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            threat_type: "integrity_violation".to_string(),
            severity: Severity::High,
            affected_components: [TargetComponent::AuditLog].into_iter().collect(),
            indicators,
            confidence: 1.0,
            recommended_actions: vec!["restore_from_backup".to_string()],
            evidence_chain: Vec::new(),
        }
    }

    /// Re-hash every watched file against its baseline, returning a
    /// detection for each one that drifted. When `auto_restore` is on
    /// and the drifted file is the designated config file, restores
    /// the last verified backup before returning.
    pub fn verify_once(&self) -> Vec<ThreatDetection> {
        let paths: Vec<PathBuf> = self.files.lock().unwrap().keys().cloned().collect();
        let mut detections = Vec::new();

        for path in paths {
            let current = match std::fs::read(&path) {
                Ok(bytes) => sha256_hex(&bytes),
                Err(_) => continue,
            };

            let mut files = self.files.lock().unwrap();
            let entry = files.get_mut(&path).expect("path came from this map's own keys");
            entry.last_checked = Some(Utc::now());

            match &entry.baseline {
                None => entry.baseline = Some(current),
                Some(baseline) if *baseline == current => {}
                Some(_) => {
                    drop(files);
                    tracing::error!(path = %path.display(), "integrity check failed: baseline mismatch");
                    detections.push(Self::detection_for(&path));
                    if self.auto_restore && path == self.config_path {
                        match self.restore_config() {
                            Ok(()) => tracing::warn!(path = %path.display(), "config auto-restored from last verified backup"),
                            Err(e) => tracing::error!(path = %path.display(), error = %e, "auto-restore failed"),
                        }
                    }
                }
            }
        }

        detections
    }

    /// Snapshot the config next to itself with a timestamped filename,
    /// record its checksum, and mark it verified by reading it back
    /// and re-hashing. Returns the backup path.
    pub fn create_config_backup(&self) -> Result<PathBuf, ShadowError> {
        let bytes = std::fs::read(&self.config_path).map_err(|e| ShadowError::Read { path: self.config_path.clone(), source: e })?;
        let source_hash = sha256_hex(&bytes);

        let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
        let file_name = self.config_path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_else(|| "config".to_string());
        let backup_path = self.config_path.with_file_name(format!("{file_name}.{stamp}.bak"));

        std::fs::write(&backup_path, &bytes).map_err(|e| ShadowError::Write { path: backup_path.clone(), source: e })?;

        let readback = std::fs::read(&backup_path).map_err(|e| ShadowError::Read { path: backup_path.clone(), source: e })?;
        if sha256_hex(&readback) != source_hash {
            return Err(ShadowError::BackupVerificationFailed);
        }

        *self.last_backup.lock().unwrap() = Some(VerifiedBackup { path: backup_path.clone(), checksum: source_hash, created_at: Utc::now() });
        Ok(backup_path)
    }

    fn restore_config(&self) -> Result<(), ShadowError> {
        let backup = self.last_backup.lock().unwrap().clone().ok_or_else(|| ShadowError::NoVerifiedBackup(self.config_path.clone()))?;
        let bytes = std::fs::read(&backup.path).map_err(|e| ShadowError::Read { path: backup.path.clone(), source: e })?;
        if sha256_hex(&bytes) != backup.checksum {
            return Err(ShadowError::BackupVerificationFailed);
        }
        std::fs::write(&self.config_path, &bytes).map_err(|e| ShadowError::Write { path: self.config_path.clone(), source: e })?;

        let mut files = self.files.lock().unwrap();
        if let Some(entry) = files.get_mut(&self.config_path) {
            entry.baseline = Some(backup.checksum);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn unmodified_file_never_trips_a_detection() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_file(&dir, "config.json", "{\"a\":1}");
        let validator = IntegrityValidator::new(vec![config], false);
        validator.establish_baselines();
        assert!(validator.verify_once().is_empty());
    }

    #[test]
    fn tampered_file_trips_an_integrity_violation() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_file(&dir, "config.json", "{\"a\":1}");
        let validator = IntegrityValidator::new(vec![config.clone()], false);
        validator.establish_baselines();

        std::fs::write(&config, "{\"a\":999}").unwrap();
        let detections = validator.verify_once();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].threat_type, "integrity_violation");
    }

    #[test]
    fn auto_restore_reverts_a_tampered_config_to_the_last_backup() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_file(&dir, "config.json", "{\"a\":1}");
        let validator = IntegrityValidator::new(vec![config.clone()], true);
        validator.establish_baselines();
        validator.create_config_backup().unwrap();

        std::fs::write(&config, "{\"a\":999}").unwrap();
        let detections = validator.verify_once();
        assert_eq!(detections.len(), 1);

        let restored = std::fs::read_to_string(&config).unwrap();
        assert_eq!(restored, "{\"a\":1}");
    }

    #[test]
    fn create_config_backup_is_verified_by_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_file(&dir, "config.json", "{\"a\":1}");
        let validator = IntegrityValidator::new(vec![config], false);
        let backup_path = validator.create_config_backup().unwrap();
        assert!(backup_path.exists());
        assert!(validator.last_backup.lock().unwrap().is_some());
    }
}
