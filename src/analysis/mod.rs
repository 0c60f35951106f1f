//! Market analytics read layer
//!
//! Every read goes through a short-TTL [`ResultCache`], so repeated requests
//! within the TTL never touch the store. Reads are independent of pipeline
//! runs: a failed run never makes a read fail.

pub mod anomaly;
#[cfg(test)]
mod tests;

pub use anomaly::{AnomalyDetector, AnomalyDirection, AnomalyFlag};

use crate::config::AnalyticsConfig;
use crate::error::{AnalyticsError, AnalyticsResult, RunResult};
use crate::pipeline::{Orchestrator, PipelineRunResult};
use crate::storage::{CacheStats, MarketStore, ResultCache};
use crate::types::{timestamp_key, MarketRecord, MetricField};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const LATEST_KEY: &str = "latest";
const KPI_KEY: &str = "kpi_summary";

/// Dashboard headline figures for the latest snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiSummary {
    pub asset_count: usize,
    pub total_market_cap: Decimal,
    pub avg_market_cap: Decimal,
    pub avg_price_top10: Decimal,
    /// `(symbol, change_pct_24h)`
    pub highest_gainer: Option<(String, Decimal)>,
    /// `(symbol, volatility_score)`
    pub most_volatile: Option<(String, Decimal)>,
    /// Newest extraction time in the snapshot
    pub as_of: DateTime<Utc>,
    pub computed_at: DateTime<Utc>,
}

/// Hit/miss counters per cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyticsCacheStats {
    pub records: CacheStats,
    pub anomalies: CacheStats,
    pub kpis: CacheStats,
}

/// Read contract over persisted market data
pub struct MarketAnalytics {
    store: Arc<dyn MarketStore>,
    orchestrator: Arc<Orchestrator>,
    detector: AnomalyDetector,
    default_threshold: Decimal,
    ttl: Duration,
    records: ResultCache<Vec<MarketRecord>>,
    anomalies: ResultCache<Vec<AnomalyFlag>>,
    kpis: ResultCache<KpiSummary>,
}

impl MarketAnalytics {
    /// Reads come from the orchestrator's store; `trigger_run` delegates to it
    pub fn new(orchestrator: Arc<Orchestrator>, config: &AnalyticsConfig) -> Self {
        Self {
            store: orchestrator.store(),
            orchestrator,
            detector: AnomalyDetector::new(config.anomaly_field),
            default_threshold: config.anomaly_threshold,
            ttl: config.cache_ttl(),
            records: ResultCache::new(),
            anomalies: ResultCache::new(),
            kpis: ResultCache::new(),
        }
    }

    /// The newest extraction's cross-section, ordered by market cap rank
    pub async fn latest_snapshot(&self) -> AnalyticsResult<Vec<MarketRecord>> {
        self.records
            .try_get_or_compute(LATEST_KEY, self.ttl, || async {
                let records = self.store.read_latest_snapshot().await?;
                if records.is_empty() {
                    return Err(AnalyticsError::NoData);
                }
                Ok(records)
            })
            .await
    }

    /// Latest records ranked descending by `field`
    pub async fn top_by(&self, field: MetricField, limit: usize) -> AnalyticsResult<Vec<MarketRecord>> {
        let mut records = self.latest_snapshot().await?;
        records.sort_by(|a, b| field.value(b).cmp(&field.value(a)).then_with(|| a.asset_id.cmp(&b.asset_id)));
        records.truncate(limit);
        Ok(records)
    }

    /// Records of one asset since `since`, oldest first.
    ///
    /// `since` is floored to a multiple of the cache TTL, so the window may
    /// start up to one TTL earlier than requested.
    pub async fn history(&self, asset_id: &str, since: DateTime<Utc>) -> AnalyticsResult<Vec<MarketRecord>> {
        let since = floor_to(since, self.ttl);
        let key = format!("history:{}:{}", asset_id, timestamp_key(&since));
        self.records
            .try_get_or_compute(&key, self.ttl, || async {
                let records = self.store.read_window(asset_id, since).await?;
                if records.is_empty() && self.store.record_count().await? == 0 {
                    return Err(AnalyticsError::NoData);
                }
                Ok(records)
            })
            .await
    }

    /// Anomalous assets in the latest snapshot, strongest first.
    ///
    /// `threshold` defaults to the configured one.
    pub async fn anomalies(&self, threshold: Option<Decimal>) -> AnalyticsResult<Vec<AnomalyFlag>> {
        let threshold = threshold.unwrap_or(self.default_threshold);
        let key = format!("anomalies:{}:{}", self.detector.field(), threshold.normalize());
        self.anomalies
            .try_get_or_compute(&key, self.ttl, || async {
                let records = self.latest_snapshot().await?;
                let mut flagged: Vec<AnomalyFlag> = self
                    .detector
                    .detect(&records, threshold)
                    .into_iter()
                    .filter(|f| f.is_anomalous)
                    .collect();
                flagged.sort_by(|a, b| b.z_score.abs().cmp(&a.z_score.abs()));
                info!(
                    "Anomaly scan: {} flagged over {} assets (threshold={}, field={})",
                    flagged.len(),
                    records.len(),
                    threshold,
                    self.detector.field()
                );
                Ok(flagged)
            })
            .await
    }

    /// Headline figures for the latest snapshot
    pub async fn kpi_summary(&self) -> AnalyticsResult<KpiSummary> {
        self.kpis
            .try_get_or_compute(KPI_KEY, self.ttl, || async {
                let records = self.latest_snapshot().await?;
                compute_kpis(&records).ok_or(AnalyticsError::NoData)
            })
            .await
    }

    /// Request an immediate pipeline run
    pub async fn trigger_run(&self) -> RunResult<PipelineRunResult> {
        self.orchestrator.trigger_run().await
    }

    pub fn cache_stats(&self) -> AnalyticsCacheStats {
        AnalyticsCacheStats {
            records: self.records.stats(),
            anomalies: self.anomalies.stats(),
            kpis: self.kpis.stats(),
        }
    }

    /// Drop expired cache entries
    pub fn purge_expired(&self) -> usize {
        self.records.purge_expired() + self.anomalies.purge_expired() + self.kpis.purge_expired()
    }

    /// Start background purge task
    pub fn start_cleanup_task(self: Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let purged = self.purge_expired();
                if purged > 0 {
                    debug!("Cache cleanup removed {} entries", purged);
                }
            }
        })
    }
}

/// Floor `at` to a whole multiple of `step` (at least one second)
fn floor_to(at: DateTime<Utc>, step: Duration) -> DateTime<Utc> {
    let step = i64::try_from(step.as_secs()).unwrap_or(i64::MAX).max(1);
    let secs = at.timestamp();
    DateTime::from_timestamp(secs - secs.rem_euclid(step), 0).unwrap_or(at)
}

fn compute_kpis(records: &[MarketRecord]) -> Option<KpiSummary> {
    let as_of = records.iter().map(|r| r.extracted_at).max()?;
    let n = Decimal::from(records.len());
    let total_market_cap: Decimal = records.iter().map(|r| r.market_cap).sum();

    let mut by_cap: Vec<&MarketRecord> = records.iter().collect();
    by_cap.sort_by(|a, b| b.market_cap.cmp(&a.market_cap));
    let top10 = &by_cap[..by_cap.len().min(10)];
    let avg_price_top10 = top10.iter().map(|r| r.price).sum::<Decimal>() / Decimal::from(top10.len());

    Some(KpiSummary {
        asset_count: records.len(),
        total_market_cap,
        avg_market_cap: (total_market_cap / n).round_dp(2),
        avg_price_top10: avg_price_top10.round_dp(8),
        highest_gainer: records
            .iter()
            .max_by_key(|r| r.change_pct_24h)
            .map(|r| (r.symbol.clone(), r.change_pct_24h)),
        most_volatile: records
            .iter()
            .max_by_key(|r| r.volatility_score)
            .map(|r| (r.symbol.clone(), r.volatility_score)),
        as_of,
        computed_at: Utc::now(),
    })
}
