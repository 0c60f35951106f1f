//! Market data provider client
//!
//! - [`MarketSource`]: raw snapshot retrieval from an upstream provider
//! - [`CoinGeckoClient`]: `/coins/markets` implementation over reqwest
//! - [`Fetcher`]: retrieval plus boundary validation into typed candidates

mod coingecko;

pub use coingecko::{CoinGeckoClient, SOURCE_LABEL};

use crate::data::validation::{validate_payload, ValidatedBatch};
use crate::error::FetchResult;
use crate::types::{RawSnapshot, Universe};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// Upstream market data provider (allows faking in tests)
#[async_trait]
pub trait MarketSource: Send + Sync {
    /// Fetch one unvalidated response for the universe.
    ///
    /// Network failures, timeouts and non-success statuses are
    /// `FetchError::Transport`; a body that is not JSON is a schema violation.
    async fn fetch_raw(&self, universe: &Universe) -> FetchResult<RawSnapshot>;
}

/// Retrieval plus validation in one call
pub struct Fetcher {
    source: Arc<dyn MarketSource>,
}

impl Fetcher {
    pub fn new(source: Arc<dyn MarketSource>) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &Arc<dyn MarketSource> {
        &self.source
    }

    /// Fetch and validate. Returns the archived-form snapshot alongside the batch.
    pub async fn fetch(&self, universe: &Universe) -> FetchResult<(RawSnapshot, ValidatedBatch)> {
        let snapshot = self.source.fetch_raw(universe).await?;
        let batch = self.validate(&snapshot)?;
        Ok((snapshot, batch))
    }

    /// Validate an already retrieved (or archived) snapshot
    pub fn validate(&self, snapshot: &RawSnapshot) -> FetchResult<ValidatedBatch> {
        let batch = validate_payload(&snapshot.payload)?;

        if batch.dropped > 0 {
            warn!("Dropped {} invalid items (kept {})", batch.dropped, batch.candidates.len());
        }
        info!("Validated {} candidates from {}", batch.candidates.len(), snapshot.source);

        Ok(batch)
    }
}
