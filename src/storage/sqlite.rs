//! Embedded SQLite store
//!
//! Decimals are stored as TEXT and timestamps as fixed-width RFC3339 strings,
//! so string comparison orders rows by time.

use super::{MarketStore, SnapshotInfo, StoreBackend};
use crate::error::{StoreError, StoreResult};
use crate::types::{timestamp_key, MarketRecord, RawSnapshot};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;

/// SQLite-backed [`MarketStore`]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect to a SQLite database file (creates it if missing)
    pub async fn connect<P: AsRef<Path>>(path: P, max_connections: u32) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::ConnectionFailed(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Private in-memory database. A single pinned connection keeps it alive.
    pub async fn in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS market_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                asset_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                name TEXT NOT NULL,
                price TEXT NOT NULL,
                market_cap TEXT NOT NULL,
                volume_24h TEXT NOT NULL,
                change_pct_24h TEXT NOT NULL,
                market_cap_rank INTEGER,
                volatility_score TEXT NOT NULL,
                extracted_at TEXT NOT NULL,
                loaded_at TEXT NOT NULL,
                UNIQUE(asset_id, extracted_at)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for ddl in [
            "CREATE INDEX IF NOT EXISTS idx_records_asset ON market_records(asset_id)",
            "CREATE INDEX IF NOT EXISTS idx_records_extracted ON market_records(extracted_at DESC)",
            "CREATE INDEX IF NOT EXISTS idx_records_asset_time ON market_records(asset_id, extracted_at DESC)",
        ] {
            sqlx::query(ddl).execute(&self.pool).await?;
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS raw_snapshots (
                fetched_at TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                item_count INTEGER NOT NULL,
                payload TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl MarketStore for SqliteStore {
    fn backend(&self) -> StoreBackend {
        StoreBackend::Sqlite
    }

    async fn upsert_batch(&self, records: &[MarketRecord]) -> StoreResult<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let loaded_at = timestamp_key(&Utc::now());
        let mut tx = self.pool.begin().await?;

        for record in records {
            sqlx::query(
                r#"
                INSERT INTO market_records (
                    asset_id, symbol, name, price, market_cap, volume_24h,
                    change_pct_24h, market_cap_rank, volatility_score, extracted_at, loaded_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(asset_id, extracted_at) DO UPDATE SET
                    symbol = excluded.symbol,
                    name = excluded.name,
                    price = excluded.price,
                    market_cap = excluded.market_cap,
                    volume_24h = excluded.volume_24h,
                    change_pct_24h = excluded.change_pct_24h,
                    market_cap_rank = excluded.market_cap_rank,
                    volatility_score = excluded.volatility_score,
                    loaded_at = excluded.loaded_at
                "#,
            )
            .bind(&record.asset_id)
            .bind(&record.symbol)
            .bind(&record.name)
            .bind(record.price.to_string())
            .bind(record.market_cap.to_string())
            .bind(record.volume_24h.to_string())
            .bind(record.change_pct_24h.to_string())
            .bind(record.market_cap_rank.map(i64::from))
            .bind(record.volatility_score.to_string())
            .bind(timestamp_key(&record.extracted_at))
            .bind(&loaded_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(records.len())
    }

    async fn read_latest(&self, asset_ids: &[String]) -> StoreResult<Vec<MarketRecord>> {
        let rows = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT m.asset_id, m.symbol, m.name, m.price, m.market_cap, m.volume_24h,
                   m.change_pct_24h, m.market_cap_rank, m.volatility_score, m.extracted_at
            FROM market_records m
            JOIN (
                SELECT asset_id, MAX(extracted_at) AS latest
                FROM market_records
                GROUP BY asset_id
            ) l ON m.asset_id = l.asset_id AND m.extracted_at = l.latest
            ORDER BY m.market_cap_rank IS NULL, m.market_cap_rank, m.asset_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let wanted: HashSet<&str> = asset_ids.iter().map(String::as_str).collect();
        rows.into_iter()
            .filter(|row| wanted.is_empty() || wanted.contains(row.asset_id.as_str()))
            .map(MarketRecord::try_from)
            .collect()
    }

    async fn read_latest_snapshot(&self) -> StoreResult<Vec<MarketRecord>> {
        let rows = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT asset_id, symbol, name, price, market_cap, volume_24h,
                   change_pct_24h, market_cap_rank, volatility_score, extracted_at
            FROM market_records
            WHERE extracted_at = (SELECT MAX(extracted_at) FROM market_records)
            ORDER BY market_cap_rank IS NULL, market_cap_rank, asset_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(MarketRecord::try_from).collect()
    }

    async fn read_window(&self, asset_id: &str, since: DateTime<Utc>) -> StoreResult<Vec<MarketRecord>> {
        let rows = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT asset_id, symbol, name, price, market_cap, volume_24h,
                   change_pct_24h, market_cap_rank, volatility_score, extracted_at
            FROM market_records
            WHERE asset_id = ? AND extracted_at >= ?
            ORDER BY extracted_at ASC
            "#,
        )
        .bind(asset_id)
        .bind(timestamp_key(&since))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(MarketRecord::try_from).collect()
    }

    async fn archive_snapshot(&self, snapshot: &RawSnapshot) -> StoreResult<bool> {
        let payload = serde_json::to_string(&snapshot.payload)
            .map_err(|e| StoreError::Query(format!("unserializable payload: {}", e)))?;

        let result = sqlx::query(
            r#"
            INSERT INTO raw_snapshots (fetched_at, source, item_count, payload)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(fetched_at) DO NOTHING
            "#,
        )
        .bind(timestamp_key(&snapshot.fetched_at))
        .bind(&snapshot.source)
        .bind(snapshot.item_count() as i64)
        .bind(payload)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn recent_snapshots(&self, limit: usize) -> StoreResult<Vec<SnapshotInfo>> {
        let rows = sqlx::query_as::<_, SnapshotInfoRow>(
            r#"
            SELECT fetched_at, source, item_count
            FROM raw_snapshots
            ORDER BY fetched_at DESC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(SnapshotInfo {
                    fetched_at: parse_timestamp(&row.fetched_at)?,
                    source: row.source,
                    item_count: usize::try_from(row.item_count).unwrap_or(0),
                })
            })
            .collect()
    }

    async fn snapshot_at(&self, fetched_at: DateTime<Utc>) -> StoreResult<Option<RawSnapshot>> {
        let row = sqlx::query_as::<_, SnapshotRow>(
            "SELECT fetched_at, source, payload FROM raw_snapshots WHERE fetched_at = ?",
        )
        .bind(timestamp_key(&fetched_at))
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(RawSnapshot {
                fetched_at: parse_timestamp(&row.fetched_at)?,
                source: row.source,
                payload: serde_json::from_str(&row.payload)
                    .map_err(|e| StoreError::Decode(format!("snapshot payload: {}", e)))?,
            })
        })
        .transpose()
    }

    async fn record_count(&self) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM market_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RecordRow {
    asset_id: String,
    symbol: String,
    name: String,
    price: String,
    market_cap: String,
    volume_24h: String,
    change_pct_24h: String,
    market_cap_rank: Option<i64>,
    volatility_score: String,
    extracted_at: String,
}

impl TryFrom<RecordRow> for MarketRecord {
    type Error = StoreError;

    fn try_from(row: RecordRow) -> std::result::Result<Self, Self::Error> {
        Ok(MarketRecord {
            price: parse_decimal("price", &row.price)?,
            market_cap: parse_decimal("market_cap", &row.market_cap)?,
            volume_24h: parse_decimal("volume_24h", &row.volume_24h)?,
            change_pct_24h: parse_decimal("change_pct_24h", &row.change_pct_24h)?,
            volatility_score: parse_decimal("volatility_score", &row.volatility_score)?,
            market_cap_rank: row.market_cap_rank.and_then(|r| u32::try_from(r).ok()),
            extracted_at: parse_timestamp(&row.extracted_at)?,
            asset_id: row.asset_id,
            symbol: row.symbol,
            name: row.name,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SnapshotInfoRow {
    fetched_at: String,
    source: String,
    item_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct SnapshotRow {
    fetched_at: String,
    source: String,
    payload: String,
}

fn parse_decimal(column: &str, raw: &str) -> StoreResult<Decimal> {
    Decimal::from_str(raw).map_err(|e| StoreError::Decode(format!("{} = {:?}: {}", column, raw, e)))
}

fn parse_timestamp(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::Decode(format!("timestamp {:?}: {}", raw, e)))
}
