//! Core domain types shared across the pipeline

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One provider response, archived verbatim for audit and replay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSnapshot {
    pub fetched_at: DateTime<Utc>,
    /// Provider label, e.g. "coingecko_markets"
    pub source: String,
    pub payload: serde_json::Value,
}

impl RawSnapshot {
    pub fn new(source: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            fetched_at: Utc::now().trunc_subsecs(6),
            source: source.into(),
            payload,
        }
    }

    /// Number of top-level items (0 for non-array payloads)
    pub fn item_count(&self) -> usize {
        self.payload.as_array().map(|a| a.len()).unwrap_or(0)
    }
}

/// A provider row that passed boundary validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCandidate {
    pub asset_id: String,
    pub symbol: String,
    pub name: String,
    pub price: Decimal,
    pub market_cap: Decimal,
    pub volume_24h: Decimal,
    pub change_pct_24h: Decimal,
    pub market_cap_rank: Option<u32>,
}

/// Normalized observation of one asset at one extraction instant.
///
/// `(asset_id, extracted_at)` is the natural key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketRecord {
    pub asset_id: String,
    pub symbol: String,
    pub name: String,
    pub price: Decimal,
    pub market_cap: Decimal,
    pub volume_24h: Decimal,
    pub change_pct_24h: Decimal,
    pub market_cap_rank: Option<u32>,
    pub volatility_score: Decimal,
    pub extracted_at: DateTime<Utc>,
}

/// Numeric column of a [`MarketRecord`] used for ranking and anomaly scans
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricField {
    Price,
    MarketCap,
    #[serde(rename = "volume_24h")]
    Volume24h,
    #[serde(rename = "change_pct_24h")]
    ChangePct24h,
    VolatilityScore,
}

impl MetricField {
    pub fn value(&self, record: &MarketRecord) -> Decimal {
        match self {
            Self::Price => record.price,
            Self::MarketCap => record.market_cap,
            Self::Volume24h => record.volume_24h,
            Self::ChangePct24h => record.change_pct_24h,
            Self::VolatilityScore => record.volatility_score,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Price => "price",
            Self::MarketCap => "market_cap",
            Self::Volume24h => "volume_24h",
            Self::ChangePct24h => "change_pct_24h",
            Self::VolatilityScore => "volatility_score",
        }
    }
}

impl fmt::Display for MetricField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricField {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "price" => Ok(Self::Price),
            "market_cap" | "mcap" => Ok(Self::MarketCap),
            "volume_24h" | "volume" => Ok(Self::Volume24h),
            "change_pct_24h" | "change" => Ok(Self::ChangePct24h),
            "volatility_score" | "volatility" => Ok(Self::VolatilityScore),
            other => Err(format!("unknown metric field: {}", other)),
        }
    }
}

/// The set of assets a run fetches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Universe {
    /// Top N assets by market cap
    TopN(usize),
    /// Explicit provider asset ids
    Assets(Vec<String>),
}

impl Universe {
    pub fn size(&self) -> usize {
        match self {
            Self::TopN(n) => *n,
            Self::Assets(ids) => ids.len(),
        }
    }
}

/// Canonical text form of a timestamp: fixed width so lexical order is time order
pub fn timestamp_key(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}
