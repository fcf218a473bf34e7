//! Database plane (inbound observations only)
//!
//! The protected database is accessed as a normal client with dedicated
//! credentials; no privileged access beyond what these reads require.
//! The database's own schema and query engine are explicitly out of
//! scope  -- this module only defines the narrow
//! capability surface C4 consumes. A real implementation plugs in a
//! driver-backed `DbObservationSource`; this crate ships only the
//! trait and a test double.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub user: String,
    pub host: String,
    pub db: Option<String>,
    pub command: String,
    pub seconds: u64,
    pub state: String,
    pub info: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StatementInfo {
    pub thread: String,
    pub sql: String,
    pub db: Option<String>,
    pub started: DateTime<Utc>,
    pub examined: u64,
    pub sent: u64,
}

#[derive(Debug, Clone)]
pub struct TableIoStat {
    pub table: String,
    pub reads: u64,
    pub writes: u64,
}

#[derive(Error, Debug)]
pub enum ObservationError {
    #[error("database observation timed out")]
    Timeout,
    #[error("database observation unavailable: {0}")]
    Unavailable(String),
}

/// Inbound-only capability set consumed by C4. `recent_statements` and
/// `table_io_stats` are best-effort and may be unimplemented by a given
/// database backend -- returning `Ok(vec![])` is the correct "not
/// available" response, not an error.
#[async_trait]
pub trait DbObservationSource: Send + Sync {
    async fn list_sessions(&self) -> Result<Vec<SessionInfo>, ObservationError>;

    async fn recent_statements(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StatementInfo>, ObservationError>;

    async fn table_io_stats(&self, schema: &str) -> Result<Vec<TableIoStat>, ObservationError>;
}

/// In-memory double used by tests and by the CLI's `--simulate` mode.
/// Feeding it is the job of the (out of scope) simulation harness;
/// this is just the seam it plugs into.
#[derive(Default)]
pub struct FixtureSource {
    pub sessions: std::sync::Mutex<Vec<SessionInfo>>,
    pub statements: std::sync::Mutex<Vec<StatementInfo>>,
    pub table_io: std::sync::Mutex<Vec<TableIoStat>>,
}

#[async_trait]
impl DbObservationSource for FixtureSource {
    async fn list_sessions(&self) -> Result<Vec<SessionInfo>, ObservationError> {
        Ok(self.sessions.lock().unwrap().clone())
    }

    async fn recent_statements(
        &self,
        _since: DateTime<Utc>,
        _limit: usize,
    ) -> Result<Vec<StatementInfo>, ObservationError> {
        Ok(self.statements.lock().unwrap().clone())
    }

    async fn table_io_stats(&self, _schema: &str) -> Result<Vec<TableIoStat>, ObservationError> {
        Ok(self.table_io.lock().unwrap().clone())
    }
}
