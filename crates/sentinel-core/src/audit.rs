//! C1: Tamper-evident log.
//!
//! Append-only, HMAC-chained, newline-delimited JSON on disk.
//!
//! All appenders serialize behind one `tokio::sync::Mutex` so that two
//! components racing to audit at the same instant never fork the
//! chain.

use crate::error::AuditError;
use crate::secret::HmacSecret;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AuditHeader {
    log_type: String,
    version: u32,
    created_at: DateTime<Utc>,
    integrity_algorithm: String,
    format: String,
}

/// The body of a record, i.e. everything that is hashed. Field order is
/// fixed by this struct definition, which is what makes
/// `serde_json::to_string` of it a canonical encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AuditRecordBody {
    entry_id: Uuid,
    timestamp: DateTime<Utc>,
    payload: serde_json::Value,
    prev_hash: String,
}

/// A full record as persisted: body plus the HMAC that commits to it
/// and to the previous record's HMAC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    #[serde(flatten)]
    body: AuditRecordBody,
    hmac: String,
}

impl AuditRecord {
    pub fn entry_id(&self) -> Uuid {
        self.body.entry_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.body.timestamp
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.body.payload
    }

    pub fn hmac(&self) -> &str {
        &self.hmac
    }

    fn compute_hmac(secret: &HmacSecret, body: &AuditRecordBody) -> Result<String, AuditError> {
        let canonical = serde_json::to_string(body)?;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(canonical.as_bytes());
        mac.update(body.prev_hash.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn verify(&self, secret: &HmacSecret) -> Result<bool, AuditError> {
        let expected = Self::compute_hmac(secret, &self.body)?;
        Ok(expected == self.hmac)
    }
}

/// HMAC-SHA256 over `bytes`, hex-encoded. Shared by `AuditRecord` and by
/// `InfrastructureEvent::integrity_hash` (computed by C4/C5 over the
/// event's canonical JSON with `integrity_hash` itself left empty).
pub fn hmac_hex(secret: &HmacSecret, bytes: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(bytes);
    hex::encode(mac.finalize().into_bytes())
}

struct WriterState {
    last_hash: String,
}

/// C1 contract: `append`, `verify_chain`, `read_since`.
pub struct AuditChain {
    path: PathBuf,
    secret: HmacSecret,
    state: tokio::sync::Mutex<WriterState>,
}

pub enum SinceCursor {
    EntryId(Uuid),
    Time(DateTime<Utc>),
}

impl AuditChain {
    /// Open (or create) the chain at `path`. If the file doesn't
    /// exist, writes the NDJSON header line first.
    pub async fn open(path: impl Into<PathBuf>, secret: HmacSecret) -> Result<Self, AuditError> {
        let path = path.into();
        let last_hash = if path.exists() {
            Self::recover_last_hash(&path).await?
        } else {
            Self::write_header(&path).await?;
            GENESIS_HASH.to_string()
        };

        Ok(Self {
            path,
            secret,
            state: tokio::sync::Mutex::new(WriterState { last_hash }),
        })
    }

    async fn write_header(path: &Path) -> Result<(), AuditError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let header = AuditHeader {
            log_type: "sentinel_audit_log".to_string(),
            version: 1,
            created_at: Utc::now(),
            integrity_algorithm: "HMAC-SHA256".to_string(),
            format: "ndjson".to_string(),
        };
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        let line = serde_json::to_string(&header)?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }

    async fn recover_last_hash(path: &Path) -> Result<String, AuditError> {
        let file = tokio::fs::File::open(path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut last = GENESIS_HASH.to_string();
        let mut first = true;
        while let Some(line) = lines.next_line().await? {
            if first {
                // header line, not a record
                first = false;
                continue;
            }
            if line.trim().is_empty() {
                continue;
            }
            let record: AuditRecord = serde_json::from_str(&line)?;
            last = record.hmac;
        }
        Ok(last)
    }

    /// Append `payload` as a new record. Flushed before returning, so a
    /// successful return is a durability guarantee to the caller.
    pub async fn append(&self, payload: serde_json::Value) -> Result<Uuid, AuditError> {
        let mut state = self.state.lock().await;

        let entry_id = Uuid::new_v4();
        let body = AuditRecordBody {
            entry_id,
            timestamp: Utc::now(),
            payload,
            prev_hash: state.last_hash.clone(),
        };
        let hmac = AuditRecord::compute_hmac(&self.secret, &body)?;
        let record = AuditRecord { body, hmac: hmac.clone() };

        let line = serde_json::to_string(&record)?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;

        state.last_hash = hmac;
        tracing::debug!(entry_id = %entry_id, "audit record appended");
        Ok(entry_id)
    }

    /// Verify the chain end to end. Returns `(true, None)` if every
    /// record's HMAC checks out and links to its predecessor; otherwise
    /// `(false, Some(byte_offset))` pointing at the first bad record.
    pub async fn verify_chain(&self) -> Result<(bool, Option<u64>), AuditError> {
        let file = tokio::fs::File::open(&self.path).await?;
        let mut lines = BufReader::new(file).lines();

        let mut prev_hash = GENESIS_HASH.to_string();
        let mut offset: u64 = 0;
        let mut first = true;

        while let Some(line) = lines.next_line().await? {
            let line_len = line.len() as u64 + 1; // + newline
            if first {
                first = false;
                offset += line_len;
                continue;
            }
            if line.trim().is_empty() {
                offset += line_len;
                continue;
            }

            let record: AuditRecord = match serde_json::from_str(&line) {
                Ok(r) => r,
                Err(_) => return Ok((false, Some(offset))),
            };

            if record.body.prev_hash != prev_hash {
                return Ok((false, Some(offset)));
            }
            match record.verify(&self.secret) {
                Ok(true) => {}
                _ => return Ok((false, Some(offset))),
            }

            prev_hash = record.hmac.clone();
            offset += line_len;
        }

        Ok((true, None))
    }

    /// Stream records from `cursor` onward. Not a true async stream --
    /// the audit log is scanned end to end and the matching suffix
    /// collected -- which is adequate at the append rates this system
    /// sees (one record per component event, not per protected-database
    /// row).
    pub async fn read_since(&self, cursor: SinceCursor) -> Result<Vec<AuditRecord>, AuditError> {
        let file = tokio::fs::File::open(&self.path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut out = Vec::new();
        let mut seen_cursor = false;
        let mut first = true;

        while let Some(line) = lines.next_line().await? {
            if first {
                first = false;
                continue;
            }
            if line.trim().is_empty() {
                continue;
            }
            let record: AuditRecord = serde_json::from_str(&line)?;

            if seen_cursor {
                out.push(record);
                continue;
            }

            match &cursor {
                SinceCursor::EntryId(id) => {
                    if record.body.entry_id == *id {
                        seen_cursor = true;
                    }
                }
                SinceCursor::Time(t) => {
                    if record.body.timestamp >= *t {
                        seen_cursor = true;
                        out.push(record);
                    }
                }
            }
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn chain(dir: &tempfile::TempDir) -> AuditChain {
        let secret = HmacSecret::load_or_generate(dir.path().join("secret")).unwrap();
        AuditChain::open(dir.path().join("audit.log"), secret)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn verifies_clean_chain() {
        let dir = tempfile::tempdir().unwrap();
        let chain = chain(&dir).await;
        chain.append(json!({"event": "one"})).await.unwrap();
        chain.append(json!({"event": "two"})).await.unwrap();
        chain.append(json!({"event": "three"})).await.unwrap();

        let (ok, bad) = chain.verify_chain().await.unwrap();
        assert!(ok);
        assert!(bad.is_none());
    }

    #[tokio::test]
    async fn detects_flipped_character() {
        let dir = tempfile::tempdir().unwrap();
        let chain = chain(&dir).await;
        chain.append(json!({"event": "one"})).await.unwrap();
        chain.append(json!({"event": "two"})).await.unwrap();
        chain.append(json!({"event": "three"})).await.unwrap();

        let path = dir.path().join("audit.log");
        let mut contents = tokio::fs::read_to_string(&path).await.unwrap();
        // flip one character inside the third record's payload
        let idx = contents.rfind("two").unwrap();
        contents.replace_range(idx..idx + 1, "X");
        tokio::fs::write(&path, contents).await.unwrap();

        let (ok, bad) = chain.verify_chain().await.unwrap();
        assert!(!ok);
        assert!(bad.is_some());
    }

    #[tokio::test]
    async fn read_since_entry_id_returns_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let chain = chain(&dir).await;
        let _first = chain.append(json!({"event": "one"})).await.unwrap();
        let second = chain.append(json!({"event": "two"})).await.unwrap();
        chain.append(json!({"event": "three"})).await.unwrap();

        let tail = chain.read_since(SinceCursor::EntryId(second)).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].payload()["event"], "three");
    }
}
