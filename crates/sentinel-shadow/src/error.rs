use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ShadowError {
    #[error("failed to read watched file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write backup {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no verified backup available to restore {0:?}")]
    NoVerifiedBackup(PathBuf),
    #[error("backup read-back did not match source checksum")]
    BackupVerificationFailed,
}
