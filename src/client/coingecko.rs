//! CoinGecko `/coins/markets` client

use super::MarketSource;
use crate::config::ProviderConfig;
use crate::error::{FetchError, FetchResult};
use crate::types::{RawSnapshot, Universe};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

/// Source label stored with every archived snapshot
pub const SOURCE_LABEL: &str = "coingecko_markets";

/// Largest page the endpoint serves
const MAX_PER_PAGE: usize = 250;

/// CoinGecko market data client
pub struct CoinGeckoClient {
    http: Client,
    base_url: String,
    vs_currency: String,
    api_key: Option<String>,
}

impl CoinGeckoClient {
    pub fn new(config: &ProviderConfig) -> FetchResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(concat!("market-pulse/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            vs_currency: config.vs_currency.clone(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
        })
    }

    /// Query parameters for one page covering the universe
    pub(crate) fn market_query(&self, universe: &Universe) -> Vec<(&'static str, String)> {
        let per_page = universe.size().clamp(1, MAX_PER_PAGE);
        let mut query = vec![
            ("vs_currency", self.vs_currency.clone()),
            ("order", "market_cap_desc".to_string()),
            ("per_page", per_page.to_string()),
            ("page", "1".to_string()),
            ("sparkline", "false".to_string()),
            ("price_change_percentage", "24h".to_string()),
        ];
        if let Universe::Assets(ids) = universe {
            query.push(("ids", ids.join(",")));
        }
        query
    }
}

#[async_trait]
impl MarketSource for CoinGeckoClient {
    async fn fetch_raw(&self, universe: &Universe) -> FetchResult<RawSnapshot> {
        let url = format!("{}/coins/markets", self.base_url);
        let mut request = self
            .http
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .query(&self.market_query(universe));
        if let Some(key) = &self.api_key {
            request = request.header("x-cg-pro-api-key", key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(200).collect();
            return Err(FetchError::Transport(format!("HTTP {}: {}", status, body)));
        }

        let payload: serde_json::Value = response.json().await?;
        let snapshot = RawSnapshot::new(SOURCE_LABEL, payload);
        debug!("Received {} items from {}", snapshot.item_count(), url);
        Ok(snapshot)
    }
}
