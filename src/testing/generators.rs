//! Test Data Generators
//!
//! Deterministic provider payloads and market records

use crate::types::{MarketRecord, RawCandidate};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::{json, Value};

const ASSETS: [(&str, &str, &str); 10] = [
    ("bitcoin", "btc", "Bitcoin"),
    ("ethereum", "eth", "Ethereum"),
    ("tether", "usdt", "Tether"),
    ("binancecoin", "bnb", "BNB"),
    ("solana", "sol", "Solana"),
    ("ripple", "xrp", "XRP"),
    ("usd-coin", "usdc", "USDC"),
    ("cardano", "ada", "Cardano"),
    ("dogecoin", "doge", "Dogecoin"),
    ("tron", "trx", "TRON"),
];

/// Generator for test data
pub struct TestDataGenerator {
    counter: u32,
}

impl TestDataGenerator {
    pub fn new() -> Self {
        Self { counter: 0 }
    }

    /// One `/coins/markets` item for the asset at `rank` (1-based)
    pub fn coin_json(&mut self, rank: u32) -> Value {
        self.counter += 1;
        let (id, symbol, name) = asset(rank);
        json!({
            "id": id,
            "symbol": symbol,
            "name": name,
            "current_price": self.price(rank).to_string(),
            "market_cap": self.market_cap(rank).to_string(),
            "total_volume": self.volume(rank).to_string(),
            "price_change_percentage_24h": self.change_pct().to_string(),
            "market_cap_rank": rank
        })
    }

    /// A full provider response with `count` assets ranked 1..=count
    pub fn markets_payload(&mut self, count: u32) -> Value {
        Value::Array((1..=count).map(|rank| self.coin_json(rank)).collect())
    }

    /// A validated candidate for the asset at `rank`
    pub fn candidate(&mut self, rank: u32) -> RawCandidate {
        self.counter += 1;
        let (id, symbol, name) = asset(rank);
        RawCandidate {
            asset_id: id,
            symbol,
            name,
            price: self.price(rank),
            market_cap: self.market_cap(rank),
            volume_24h: self.volume(rank),
            change_pct_24h: self.change_pct(),
            market_cap_rank: Some(rank),
        }
    }

    /// A stored record with an explicit 24h change
    pub fn record(&mut self, asset_id: &str, change_pct_24h: Decimal, extracted_at: DateTime<Utc>) -> MarketRecord {
        self.counter += 1;
        MarketRecord {
            asset_id: asset_id.to_string(),
            symbol: asset_id.chars().take(4).collect::<String>().to_uppercase(),
            name: asset_id.to_string(),
            price: self.price(self.counter),
            market_cap: self.market_cap(self.counter),
            volume_24h: self.volume(self.counter),
            change_pct_24h,
            market_cap_rank: Some(self.counter),
            volatility_score: change_pct_24h.abs(),
            extracted_at,
        }
    }

    /// Records `asset_0..asset_{n-1}` whose 24h changes are `changes`
    pub fn cross_section(&mut self, changes: &[Decimal], extracted_at: DateTime<Utc>) -> Vec<MarketRecord> {
        changes
            .iter()
            .enumerate()
            .map(|(i, change)| self.record(&format!("asset_{}", i), *change, extracted_at))
            .collect()
    }

    fn price(&self, rank: u32) -> Decimal {
        let base = (rank * 7919 + self.counter * 31) % 90000 + 100;
        Decimal::new(base as i64, 2)
    }

    fn market_cap(&self, rank: u32) -> Decimal {
        Decimal::from(2_000_000_000_000u64 / u64::from(rank.max(1)))
    }

    fn volume(&self, rank: u32) -> Decimal {
        Decimal::from((u64::from(rank) * 12345 + u64::from(self.counter) * 777) % 1_000_000 + 10_000)
    }

    fn change_pct(&self) -> Decimal {
        let raw = (self.counter * 37 % 200) as i64 - 100;
        Decimal::new(raw, 1)
    }
}

impl Default for TestDataGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn asset(rank: u32) -> (String, String, String) {
    match ASSETS.get((rank as usize).wrapping_sub(1)) {
        Some((id, symbol, name)) => (id.to_string(), symbol.to_string(), name.to_string()),
        None => (format!("coin-{}", rank), format!("c{}", rank), format!("Coin {}", rank)),
    }
}
