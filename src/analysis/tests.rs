//! Unit tests for analysis module

#[cfg(test)]
mod tests {
    use crate::analysis::{AnomalyDirection, MarketAnalytics};
    use crate::config::AnalyticsConfig;
    use crate::error::{AnalyticsError, StoreError};
    use crate::pipeline::{Orchestrator, PipelineSettings, RetryPolicy, RunStatus};
    use crate::storage::{MarketStore, MockMarketStore, SqliteStore};
    use crate::testing::{StaticSource, TestDataGenerator};
    use crate::types::{MarketRecord, MetricField};
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn settings() -> PipelineSettings {
        PipelineSettings {
            retry: RetryPolicy::immediate(1),
            ..PipelineSettings::default()
        }
    }

    fn analytics_over(store: Arc<dyn MarketStore>, config: &AnalyticsConfig) -> MarketAnalytics {
        let source = Arc::new(StaticSource::new(json!([])));
        let orchestrator = Arc::new(Orchestrator::new(source, store, settings()));
        MarketAnalytics::new(orchestrator, config)
    }

    /// Ten quiet assets and one that moved 100%
    fn outlier_section() -> Vec<MarketRecord> {
        let mut changes = vec![dec!(1); 10];
        changes.push(dec!(100));
        TestDataGenerator::new().cross_section(&changes, Utc::now())
    }

    fn mock_latest(records: Vec<MarketRecord>, calls: Arc<AtomicUsize>) -> MockMarketStore {
        let mut store = MockMarketStore::new();
        store.expect_read_latest_snapshot().returning(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(records.clone())
        });
        store
    }

    #[tokio::test]
    async fn test_no_data_before_first_run() {
        let store: Arc<dyn MarketStore> = Arc::new(SqliteStore::in_memory().await.unwrap());
        let analytics = analytics_over(store, &AnalyticsConfig::default());

        assert_eq!(analytics.latest_snapshot().await.unwrap_err(), AnalyticsError::NoData);
        assert_eq!(analytics.anomalies(None).await.unwrap_err(), AnalyticsError::NoData);
        assert_eq!(analytics.kpi_summary().await.unwrap_err(), AnalyticsError::NoData);
        assert_eq!(
            analytics.history("bitcoin", Utc::now() - Duration::hours(1)).await.unwrap_err(),
            AnalyticsError::NoData
        );
    }

    #[tokio::test]
    async fn test_reads_after_manual_run() {
        let store: Arc<dyn MarketStore> = Arc::new(SqliteStore::in_memory().await.unwrap());
        let source = Arc::new(StaticSource::new(TestDataGenerator::new().markets_payload(5)));
        let orchestrator = Arc::new(Orchestrator::new(source.clone(), store, settings()));
        let config = AnalyticsConfig {
            cache_ttl_secs: 0,
            ..Default::default()
        };
        let analytics = MarketAnalytics::new(orchestrator, &config);

        let run = analytics.trigger_run().await.unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(source.calls(), 1);

        let latest = analytics.latest_snapshot().await.unwrap();
        assert_eq!(latest.len(), 5);
        assert_eq!(latest[0].asset_id, "bitcoin");
        assert_eq!(latest[0].symbol, "BTC");

        let top = analytics.top_by(MetricField::Price, 2).await.unwrap();
        assert_eq!(top.len(), 2);
        assert!(top[0].price >= top[1].price);

        let history = analytics.history("ethereum", Utc::now() - Duration::hours(1)).await.unwrap();
        assert_eq!(history.len(), 1);

        // data exists, just not for this asset
        let unknown = analytics.history("not-a-coin", Utc::now() - Duration::hours(1)).await.unwrap();
        assert!(unknown.is_empty());
    }

    #[tokio::test]
    async fn test_top_by_breaks_ties_by_asset_id() {
        let calls = Arc::new(AtomicUsize::new(0));
        let records = TestDataGenerator::new().cross_section(&[dec!(3), dec!(7), dec!(7)], Utc::now());
        let analytics = analytics_over(Arc::new(mock_latest(records, calls)), &AnalyticsConfig::default());

        let top = analytics.top_by(MetricField::ChangePct24h, 10).await.unwrap();
        let ids: Vec<&str> = top.iter().map(|r| r.asset_id.as_str()).collect();
        assert_eq!(ids, vec!["asset_1", "asset_2", "asset_0"]);
    }

    #[tokio::test]
    async fn test_anomalies_use_configured_threshold() {
        let calls = Arc::new(AtomicUsize::new(0));
        let analytics = analytics_over(
            Arc::new(mock_latest(outlier_section(), calls)),
            &AnalyticsConfig::default(),
        );

        // z of the outlier is sqrt(10) ≈ 3.16, above the default 2.5
        let flagged = analytics.anomalies(None).await.unwrap();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].asset_id, "asset_10");
        assert_eq!(flagged[0].direction, AnomalyDirection::Spike);

        assert!(analytics.anomalies(Some(dec!(5))).await.unwrap().is_empty());

        let everything = analytics.anomalies(Some(dec!(0.1))).await.unwrap();
        assert_eq!(everything.len(), 11);
        assert_eq!(everything[0].asset_id, "asset_10");
    }

    #[tokio::test]
    async fn test_reads_within_ttl_hit_the_cache() {
        let calls = Arc::new(AtomicUsize::new(0));
        let analytics = analytics_over(
            Arc::new(mock_latest(outlier_section(), calls.clone())),
            &AnalyticsConfig::default(),
        );

        analytics.latest_snapshot().await.unwrap();
        analytics.latest_snapshot().await.unwrap();
        analytics.top_by(MetricField::MarketCap, 3).await.unwrap();
        analytics.anomalies(None).await.unwrap();
        analytics.kpi_summary().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = analytics.cache_stats();
        assert_eq!(stats.records.misses, 1);
        assert!(stats.records.hits >= 3);
    }

    #[tokio::test]
    async fn test_store_outage_serves_last_good_state() {
        let calls = Arc::new(AtomicUsize::new(0));
        let records = outlier_section();
        let mut store = MockMarketStore::new();
        {
            let calls = calls.clone();
            store.expect_read_latest_snapshot().returning(move || {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(records.clone())
                } else {
                    Err(StoreError::ConnectionFailed("connection refused".to_string()))
                }
            });
        }
        let config = AnalyticsConfig {
            cache_ttl_secs: 0,
            ..Default::default()
        };
        let analytics = analytics_over(Arc::new(store), &config);

        let first = analytics.latest_snapshot().await.unwrap();
        let second = analytics.latest_snapshot().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_store_error_without_cached_value() {
        let mut store = MockMarketStore::new();
        store
            .expect_read_latest_snapshot()
            .returning(|| Err(StoreError::Timeout("pool exhausted".to_string())));
        let analytics = analytics_over(Arc::new(store), &AnalyticsConfig::default());

        let err = analytics.latest_snapshot().await.unwrap_err();
        assert!(matches!(err, AnalyticsError::Store(StoreError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_kpi_summary() {
        let calls = Arc::new(AtomicUsize::new(0));
        let records = TestDataGenerator::new().cross_section(&[dec!(-4), dec!(12.5), dec!(3)], Utc::now());
        let total: Decimal = records.iter().map(|r| r.market_cap).sum();
        let analytics = analytics_over(Arc::new(mock_latest(records.clone(), calls)), &AnalyticsConfig::default());

        let kpi = analytics.kpi_summary().await.unwrap();
        assert_eq!(kpi.asset_count, 3);
        assert_eq!(kpi.total_market_cap, total);
        assert_eq!(kpi.highest_gainer.as_ref().map(|g| g.1), Some(dec!(12.5)));
        // volatility is |change| in generated records
        assert_eq!(kpi.most_volatile.as_ref().map(|v| v.1), Some(dec!(12.5)));
        assert_eq!(kpi.as_of, records[0].extracted_at);
    }

    #[tokio::test]
    async fn test_purge_expired_entries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = AnalyticsConfig {
            cache_ttl_secs: 0,
            ..Default::default()
        };
        let analytics = analytics_over(Arc::new(mock_latest(outlier_section(), calls)), &config);

        analytics.latest_snapshot().await.unwrap();
        analytics.kpi_summary().await.unwrap();
        assert_eq!(analytics.purge_expired(), 2);
        assert_eq!(analytics.cache_stats().records.total_entries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_task_purges_in_background() {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = AnalyticsConfig {
            cache_ttl_secs: 1,
            ..Default::default()
        };
        let analytics = Arc::new(analytics_over(Arc::new(mock_latest(outlier_section(), calls)), &config));
        analytics.latest_snapshot().await.unwrap();

        let task = analytics.clone().start_cleanup_task(std::time::Duration::from_secs(5));
        tokio::time::sleep(std::time::Duration::from_secs(6)).await;

        assert_eq!(analytics.cache_stats().records.total_entries, 0);
        task.abort();
    }

    #[tokio::test]
    async fn test_latest_ignores_assets_missing_from_newest_run() {
        let store: Arc<dyn MarketStore> = Arc::new(SqliteStore::in_memory().await.unwrap());
        let mut generator = TestDataGenerator::new();
        let now_at = Utc.with_ymd_and_hms(2025, 3, 4, 12, 0, 0).unwrap();
        // asset_3 crashed in an old run and has since left the universe
        let old = generator.cross_section(&[dec!(1), dec!(2), dec!(1), dec!(-90)], now_at - Duration::days(3));
        let now = generator.cross_section(&[dec!(2), dec!(1), dec!(3)], now_at);
        store.upsert_batch(&old).await.unwrap();
        store.upsert_batch(&now).await.unwrap();
        let analytics = analytics_over(store, &AnalyticsConfig::default());

        let latest = analytics.latest_snapshot().await.unwrap();
        let ids: Vec<&str> = latest.iter().map(|r| r.asset_id.as_str()).collect();
        assert_eq!(ids, vec!["asset_0", "asset_1", "asset_2"]);
        assert!(latest.iter().all(|r| r.extracted_at == now_at));

        let flagged = analytics.anomalies(Some(dec!(1.5))).await.unwrap();
        assert!(flagged.iter().all(|f| f.asset_id != "asset_3"));

        let kpi = analytics.kpi_summary().await.unwrap();
        assert_eq!(kpi.asset_count, 3);
        assert_eq!(kpi.as_of, now_at);
    }

    #[tokio::test]
    async fn test_history_shares_cache_within_ttl_bucket() {
        let start: DateTime<Utc> = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let records = TestDataGenerator::new().cross_section(&[dec!(1)], start);
        let mut store = MockMarketStore::new();
        {
            let calls = calls.clone();
            store.expect_read_window().returning(move |_, since| {
                calls.fetch_add(1, Ordering::SeqCst);
                assert_eq!(since, start);
                Ok(records.clone())
            });
        }
        let analytics = analytics_over(Arc::new(store), &AnalyticsConfig::default());

        // both fall in the same 60s bucket
        let first = analytics.history("asset_0", start + Duration::milliseconds(250)).await.unwrap();
        let second = analytics.history("asset_0", start + Duration::milliseconds(750)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        analytics.history("asset_0", start + Duration::seconds(59)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
