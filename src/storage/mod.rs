//! Data storage and persistence
//!
//! One [`MarketStore`] contract with a PostgreSQL primary, an embedded SQLite
//! fallback and a [`FailoverStore`] that routes between them.

pub mod cache;
pub mod failover;
pub mod postgres;
pub mod sqlite;

#[cfg(test)]
mod tests;

pub use cache::{CacheStats, ResultCache};
pub use failover::FailoverStore;
pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

use crate::config::StorageConfig;
use crate::error::StoreResult;
use crate::types::{MarketRecord, RawSnapshot};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Which engine is serving a store call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    Sqlite,
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Postgres => f.write_str("postgres"),
            Self::Sqlite => f.write_str("sqlite"),
        }
    }
}

/// Listing entry for an archived provider response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub fetched_at: DateTime<Utc>,
    pub source: String,
    pub item_count: usize,
}

/// Durable market record storage.
///
/// Records are keyed by `(asset_id, extracted_at)`; writing an existing key
/// overwrites it. Raw snapshots are append-only.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketStore: Send + Sync {
    fn backend(&self) -> StoreBackend;

    /// Upsert a batch in one transaction; all rows become visible or none do
    async fn upsert_batch(&self, records: &[MarketRecord]) -> StoreResult<usize>;

    /// Newest record per asset. An empty slice selects every asset.
    async fn read_latest(&self, asset_ids: &[String]) -> StoreResult<Vec<MarketRecord>>;

    /// Every record of the newest extraction, ranked first then by asset id.
    ///
    /// Assets missing from that extraction are not returned, however recent
    /// their own last record is.
    async fn read_latest_snapshot(&self) -> StoreResult<Vec<MarketRecord>>;

    /// Records of one asset since `since`, ascending by extraction time
    async fn read_window(&self, asset_id: &str, since: DateTime<Utc>) -> StoreResult<Vec<MarketRecord>>;

    /// Archive a provider response. Returns false when one already exists for the timestamp.
    async fn archive_snapshot(&self, snapshot: &RawSnapshot) -> StoreResult<bool>;

    /// Most recent archived snapshots, newest first
    async fn recent_snapshots(&self, limit: usize) -> StoreResult<Vec<SnapshotInfo>>;

    async fn snapshot_at(&self, fetched_at: DateTime<Utc>) -> StoreResult<Option<RawSnapshot>>;

    /// Total persisted market records
    async fn record_count(&self) -> StoreResult<u64>;
}

/// Open the configured store.
///
/// With a reachable primary the result is a failover pair; an unset or
/// unreachable primary leaves the embedded store serving alone.
pub async fn open_store(config: &StorageConfig) -> StoreResult<Arc<dyn MarketStore>> {
    let fallback = Arc::new(SqliteStore::connect(config.fallback_path(), config.max_connections).await?);

    let Some(url) = config.primary_url.as_deref() else {
        info!("No primary store configured, using embedded store at {}", config.fallback_path().display());
        return Ok(fallback);
    };

    match PostgresStore::connect(url, config.max_connections, config.connect_timeout()).await {
        Ok(primary) => {
            info!("Primary store connected, embedded store on standby");
            Ok(Arc::new(FailoverStore::new(Arc::new(primary), fallback)))
        }
        Err(e) => {
            warn!("Primary store unreachable ({}), falling back to embedded store", e);
            Ok(fallback)
        }
    }
}
