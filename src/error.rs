//! Error types for the pipeline and its read paths

use thiserror::Error;

/// Upstream extraction failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Network failure, non-success status or timeout. The only retryable kind.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Schema violation: {0}")]
    SchemaViolation(String),

    #[error("Empty result: {0}")]
    EmptyResult(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Transport(format!("request timed out: {}", err))
        } else if err.is_decode() {
            Self::SchemaViolation(format!("undecodable response body: {}", err))
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Persistence failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Connection refused, auth failure, closed pool. Triggers failover.
    #[error("Store connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Store timeout: {0}")]
    Timeout(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Corrupt row: {0}")]
    Decode(String),
}

impl StoreError {
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Self::ConnectionFailed(_))
    }

    /// The store could not hand out a connection at all.
    ///
    /// A pool whose server went away keeps retrying the refused connect until
    /// `acquire_timeout` and then reports `PoolTimedOut`, so that counts too.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::ConnectionFailed(_) | Self::Timeout(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => {
                // SQLSTATE class 28 is invalid authorization, 3D000 an unknown database
                let code = db.code().map(|c| c.to_string()).unwrap_or_default();
                if db.is_unique_violation() || db.is_check_violation() || db.is_foreign_key_violation() {
                    Self::ConstraintViolation(db.message().to_string())
                } else if code.starts_with("28") || code == "3D000" {
                    Self::ConnectionFailed(db.message().to_string())
                } else {
                    Self::Query(db.message().to_string())
                }
            }
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::Configuration(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::ConnectionFailed(err.to_string()),
            sqlx::Error::PoolTimedOut => Self::Timeout(err.to_string()),
            sqlx::Error::RowNotFound
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_) => Self::Decode(err.to_string()),
            _ => Self::Query(err.to_string()),
        }
    }
}

/// Outcome-level failure of one orchestrator run
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunError {
    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Store failed: {0}")]
    Store(#[from] StoreError),

    #[error("A pipeline run is already in progress")]
    Busy,

    #[error("Run exceeded its {deadline_secs}s deadline")]
    Timeout { deadline_secs: u64 },

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),
}

/// Read-path failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnalyticsError {
    /// No successful run has ever persisted data
    #[error("No data yet: no pipeline run has persisted market records")]
    NoData,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Bootstrap failures surfaced by the binary
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Run error: {0}")]
    Run(#[from] RunError),

    #[error("Analytics error: {0}")]
    Analytics(#[from] AnalyticsError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;
pub type FetchResult<T> = std::result::Result<T, FetchError>;
pub type StoreResult<T> = std::result::Result<T, StoreError>;
pub type RunResult<T> = std::result::Result<T, RunError>;
pub type AnalyticsResult<T> = std::result::Result<T, AnalyticsError>;
