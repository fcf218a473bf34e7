//! Process-local HMAC secret used to chain audit records and seal
//! event `integrity_hash` values.
//!
//! Loaded from `SELF_MONITORING_SECRET` if present; otherwise generated
//! once with a CSPRNG and persisted to a side file created with mode
//! 0600 so a second process (or process restart) reuses the same key.
//! This is the only ambient secret in the system.

use rand::RngCore;
use std::io::Write;
use std::path::{Path, PathBuf};

const ENV_VAR: &str = "SELF_MONITORING_SECRET";
const SECRET_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct HmacSecret(Vec<u8>);

impl HmacSecret {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Load from environment, falling back to a generated side-file
    /// next to `fallback_path`.
    pub fn load_or_generate(fallback_path: impl AsRef<Path>) -> std::io::Result<Self> {
        if let Ok(value) = std::env::var(ENV_VAR) {
            if !value.is_empty() {
                tracing::info!("loaded HMAC secret from {}", ENV_VAR);
                return Ok(Self(value.into_bytes()));
            }
        }

        let path = fallback_path.as_ref();
        if path.exists() {
            let bytes = std::fs::read(path)?;
            if !bytes.is_empty() {
                tracing::info!(path = %path.display(), "loaded HMAC secret from side file");
                return Ok(Self(bytes));
            }
        }

        let secret = Self::generate();
        secret.persist(path)?;
        tracing::warn!(
            path = %path.display(),
            "{} not set; generated a new HMAC secret and persisted it with mode 0600",
            ENV_VAR
        );
        Ok(secret)
    }

    /// Generate a fresh random secret without touching the environment
    /// or disk. Used by tests across crates that need a throwaway key.
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; SECRET_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    fn persist(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(path)?;
            file.write_all(hex::encode(&self.0).as_bytes())?;
        }

        #[cfg(not(unix))]
        {
            let mut file = std::fs::File::create(path)?;
            file.write_all(hex::encode(&self.0).as_bytes())?;
        }

        Ok(())
    }
}

pub fn default_secret_path() -> PathBuf {
    dirs_next_home().join(".sentinel").join("hmac.secret")
}

fn dirs_next_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_and_persists_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret");
        std::env::remove_var(ENV_VAR);

        let s1 = HmacSecret::load_or_generate(&path).unwrap();
        let s2 = HmacSecret::load_or_generate(&path).unwrap();
        assert_eq!(s1.as_bytes(), s2.as_bytes());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
