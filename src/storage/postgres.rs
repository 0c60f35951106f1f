//! PostgreSQL primary store

use super::{MarketStore, SnapshotInfo, StoreBackend};
use crate::error::StoreResult;
use crate::types::{MarketRecord, RawSnapshot};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

/// PostgreSQL-backed [`MarketStore`]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect eagerly so an unreachable server is reported here
    pub async fn connect(url: &str, max_connections: u32, connect_timeout: Duration) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(connect_timeout)
            .connect(url)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Pool that dials on first use; no migrations are run
    #[cfg(test)]
    pub(crate) fn connect_lazy(url: &str, acquire_timeout: Duration) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(acquire_timeout)
            .connect_lazy(url)?;
        Ok(Self { pool })
    }

    async fn run_migrations(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS market_records (
                id BIGSERIAL PRIMARY KEY,
                asset_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                name TEXT NOT NULL,
                price NUMERIC NOT NULL,
                market_cap NUMERIC NOT NULL,
                volume_24h NUMERIC NOT NULL,
                change_pct_24h NUMERIC NOT NULL,
                market_cap_rank INTEGER,
                volatility_score NUMERIC NOT NULL,
                extracted_at TIMESTAMPTZ NOT NULL,
                loaded_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (asset_id, extracted_at)
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
                fetched_at TIMESTAMPTZ PRIMARY KEY,
                source TEXT NOT NULL,
                item_count INTEGER NOT NULL,
                payload JSONB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl MarketStore for PostgresStore {
    fn backend(&self) -> StoreBackend {
        StoreBackend::Postgres
    }

    async fn upsert_batch(&self, records: &[MarketRecord]) -> StoreResult<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;

        for record in records {
            sqlx::query(
                r#"
                INSERT INTO market_records (
                    asset_id, symbol, name, price, market_cap, volume_24h,
                    change_pct_24h, market_cap_rank, volatility_score, extracted_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (asset_id, extracted_at) DO UPDATE SET
                    symbol = EXCLUDED.symbol,
                    name = EXCLUDED.name,
                    price = EXCLUDED.price,
                    market_cap = EXCLUDED.market_cap,
                    volume_24h = EXCLUDED.volume_24h,
                    change_pct_24h = EXCLUDED.change_pct_24h,
                    market_cap_rank = EXCLUDED.market_cap_rank,
                    volatility_score = EXCLUDED.volatility_score,
                    loaded_at = NOW()
                "#,
            )
            .bind(&record.asset_id)
            .bind(&record.symbol)
            .bind(&record.name)
            .bind(record.price)
            .bind(record.market_cap)
            .bind(record.volume_24h)
            .bind(record.change_pct_24h)
            .bind(record.market_cap_rank.and_then(|r| i32::try_from(r).ok()))
            .bind(record.volatility_score)
            .bind(record.extracted_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(records.len())
    }

    async fn read_latest(&self, asset_ids: &[String]) -> StoreResult<Vec<MarketRecord>> {
        let rows = sqlx::query_as::<_, PgRecordRow>(
            r#"
            SELECT DISTINCT ON (asset_id)
                   asset_id, symbol, name, price, market_cap, volume_24h,
                   change_pct_24h, market_cap_rank, volatility_score, extracted_at
            FROM market_records
            WHERE cardinality($1::text[]) = 0 OR asset_id = ANY($1)
            ORDER BY asset_id, extracted_at DESC
            "#,
        )
        .bind(asset_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut records: Vec<MarketRecord> = rows.into_iter().map(MarketRecord::from).collect();
        records.sort_by(|a, b| {
            (a.market_cap_rank.is_none(), a.market_cap_rank, &a.asset_id)
                .cmp(&(b.market_cap_rank.is_none(), b.market_cap_rank, &b.asset_id))
        });
        Ok(records)
    }

    async fn read_latest_snapshot(&self) -> StoreResult<Vec<MarketRecord>> {
        let rows = sqlx::query_as::<_, PgRecordRow>(
            r#"
            SELECT asset_id, symbol, name, price, market_cap, volume_24h,
                   change_pct_24h, market_cap_rank, volatility_score, extracted_at
            FROM market_records
            WHERE extracted_at = (SELECT MAX(extracted_at) FROM market_records)
            ORDER BY market_cap_rank ASC NULLS LAST, asset_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(MarketRecord::from).collect())
    }

    async fn read_window(&self, asset_id: &str, since: DateTime<Utc>) -> StoreResult<Vec<MarketRecord>> {
        let rows = sqlx::query_as::<_, PgRecordRow>(
            r#"
            SELECT asset_id, symbol, name, price, market_cap, volume_24h,
                   change_pct_24h, market_cap_rank, volatility_score, extracted_at
            FROM market_records
            WHERE asset_id = $1 AND extracted_at >= $2
            ORDER BY extracted_at ASC
            "#,
        )
        .bind(asset_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(MarketRecord::from).collect())
    }

    async fn archive_snapshot(&self, snapshot: &RawSnapshot) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO raw_snapshots (fetched_at, source, item_count, payload)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (fetched_at) DO NOTHING
            "#,
        )
        .bind(snapshot.fetched_at)
        .bind(&snapshot.source)
        .bind(i32::try_from(snapshot.item_count()).unwrap_or(i32::MAX))
        .bind(&snapshot.payload)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn recent_snapshots(&self, limit: usize) -> StoreResult<Vec<SnapshotInfo>> {
        let rows: Vec<(DateTime<Utc>, String, i32)> = sqlx::query_as(
            r#"
            SELECT fetched_at, source, item_count
            FROM raw_snapshots
            ORDER BY fetched_at DESC
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(fetched_at, source, item_count)| SnapshotInfo {
                fetched_at,
                source,
                item_count: usize::try_from(item_count).unwrap_or(0),
            })
            .collect())
    }

    async fn snapshot_at(&self, fetched_at: DateTime<Utc>) -> StoreResult<Option<RawSnapshot>> {
        let row: Option<(DateTime<Utc>, String, serde_json::Value)> = sqlx::query_as(
            "SELECT fetched_at, source, payload FROM raw_snapshots WHERE fetched_at = $1",
        )
        .bind(fetched_at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(fetched_at, source, payload)| RawSnapshot {
            fetched_at,
            source,
            payload,
        }))
    }

    async fn record_count(&self) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM market_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PgRecordRow {
    asset_id: String,
    symbol: String,
    name: String,
    price: Decimal,
    market_cap: Decimal,
    volume_24h: Decimal,
    change_pct_24h: Decimal,
    market_cap_rank: Option<i32>,
    volatility_score: Decimal,
    extracted_at: DateTime<Utc>,
}

impl From<PgRecordRow> for MarketRecord {
    fn from(row: PgRecordRow) -> Self {
        MarketRecord {
            asset_id: row.asset_id,
            symbol: row.symbol,
            name: row.name,
            price: row.price,
            market_cap: row.market_cap,
            volume_24h: row.volume_24h,
            change_pct_24h: row.change_pct_24h,
            market_cap_rank: row.market_cap_rank.and_then(|r| u32::try_from(r).ok()),
            volatility_score: row.volatility_score,
            extracted_at: row.extracted_at,
        }
    }
}
