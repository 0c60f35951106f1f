//! Primary/fallback routing
//!
//! Calls go to the primary until it becomes unavailable. From then on
//! the fallback serves every call, starting with a retry of the failing one.

use super::{MarketStore, SnapshotInfo, StoreBackend};
use crate::error::{StoreError, StoreResult};
use crate::types::{MarketRecord, RawSnapshot};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, warn};

/// Routes a call to the active store, switching once when the primary is unavailable
macro_rules! routed {
    ($self:ident, $store:ident => $call:expr) => {{
        if !$self.is_failed_over() {
            let $store = &$self.primary;
            match $call.await {
                Err(err) if err.is_unavailable() => $self.switch_to_fallback(&err),
                other => return other,
            }
        }
        let $store = &$self.fallback;
        $call.await.map_err(|err| {
            error!("Fallback store failed: {}", err);
            err
        })
    }};
}

pub struct FailoverStore {
    primary: Arc<dyn MarketStore>,
    fallback: Arc<dyn MarketStore>,
    failed_over: AtomicBool,
}

impl FailoverStore {
    pub fn new(primary: Arc<dyn MarketStore>, fallback: Arc<dyn MarketStore>) -> Self {
        Self {
            primary,
            fallback,
            failed_over: AtomicBool::new(false),
        }
    }

    /// Whether the fallback has taken over
    pub fn is_failed_over(&self) -> bool {
        self.failed_over.load(Ordering::Acquire)
    }

    fn switch_to_fallback(&self, cause: &StoreError) {
        if !self.failed_over.swap(true, Ordering::AcqRel) {
            warn!("Primary store lost ({}), switching to fallback store", cause);
        }
    }
}

#[async_trait]
impl MarketStore for FailoverStore {
    fn backend(&self) -> StoreBackend {
        if self.is_failed_over() {
            self.fallback.backend()
        } else {
            self.primary.backend()
        }
    }

    async fn upsert_batch(&self, records: &[MarketRecord]) -> StoreResult<usize> {
        routed!(self, store => store.upsert_batch(records))
    }

    async fn read_latest(&self, asset_ids: &[String]) -> StoreResult<Vec<MarketRecord>> {
        routed!(self, store => store.read_latest(asset_ids))
    }

    async fn read_latest_snapshot(&self) -> StoreResult<Vec<MarketRecord>> {
        routed!(self, store => store.read_latest_snapshot())
    }

    async fn read_window(&self, asset_id: &str, since: DateTime<Utc>) -> StoreResult<Vec<MarketRecord>> {
        routed!(self, store => store.read_window(asset_id, since))
    }

    async fn archive_snapshot(&self, snapshot: &RawSnapshot) -> StoreResult<bool> {
        routed!(self, store => store.archive_snapshot(snapshot))
    }

    async fn recent_snapshots(&self, limit: usize) -> StoreResult<Vec<SnapshotInfo>> {
        routed!(self, store => store.recent_snapshots(limit))
    }

    async fn snapshot_at(&self, fetched_at: DateTime<Utc>) -> StoreResult<Option<RawSnapshot>> {
        routed!(self, store => store.snapshot_at(fetched_at))
    }

    async fn record_count(&self) -> StoreResult<u64> {
        routed!(self, store => store.record_count())
    }
}
