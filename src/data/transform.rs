//! Candidate → record transformation
//!
//! Pure and deterministic: the same candidates, timestamp and price context
//! always produce the same records.

use crate::config::VolatilityModel;
use crate::types::{MarketRecord, RawCandidate};
use chrono::{DateTime, SubsecRound, Utc};
use rust_decimal::{Decimal, MathematicalOps};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const MAX_PRICE: Decimal = dec!(1000000000);
const MAX_MARKET_CAP: Decimal = dec!(1000000000000000);
const MAX_VOLUME: Decimal = dec!(10000000000000);
const MIN_CHANGE_PCT: Decimal = dec!(-100);
const MAX_CHANGE_PCT: Decimal = dec!(10000);

/// Recently persisted prices per asset, oldest first
#[derive(Debug, Clone, Default)]
pub struct PriceContext {
    recent: HashMap<String, Vec<Decimal>>,
}

impl PriceContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, asset_id: impl Into<String>, prices: Vec<Decimal>) {
        self.recent.insert(asset_id.into(), prices);
    }

    pub fn prices(&self, asset_id: &str) -> &[Decimal] {
        self.recent.get(asset_id).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Maps validated candidates to market records
#[derive(Debug, Clone, Default)]
pub struct Transformer {
    model: VolatilityModel,
}

impl Transformer {
    pub fn new(model: VolatilityModel) -> Self {
        Self { model }
    }

    /// Transform a batch, stamping every record with `extracted_at`.
    ///
    /// Output is ordered by market cap rank (unranked last), then asset id.
    pub fn transform(
        &self,
        candidates: &[RawCandidate],
        extracted_at: DateTime<Utc>,
        context: &PriceContext,
    ) -> Vec<MarketRecord> {
        let extracted_at = extracted_at.trunc_subsecs(6);
        let mut records: Vec<MarketRecord> = candidates
            .iter()
            .map(|c| self.transform_one(c, extracted_at, context.prices(&c.asset_id)))
            .collect();

        records.sort_by(|a, b| {
            (a.market_cap_rank.is_none(), a.market_cap_rank, &a.asset_id)
                .cmp(&(b.market_cap_rank.is_none(), b.market_cap_rank, &b.asset_id))
        });
        records
    }

    fn transform_one(&self, c: &RawCandidate, extracted_at: DateTime<Utc>, recent: &[Decimal]) -> MarketRecord {
        let price = clamp(c.price, Decimal::ZERO, MAX_PRICE);
        let volume_24h = clamp(c.volume_24h, Decimal::ZERO, MAX_VOLUME);
        let change_pct_24h = clamp(c.change_pct_24h, MIN_CHANGE_PCT, MAX_CHANGE_PCT);

        MarketRecord {
            asset_id: c.asset_id.clone(),
            symbol: c.symbol.to_uppercase(),
            name: c.name.clone(),
            price,
            market_cap: clamp(c.market_cap, Decimal::ZERO, MAX_MARKET_CAP),
            volume_24h,
            change_pct_24h,
            market_cap_rank: c.market_cap_rank,
            volatility_score: self.volatility_score(change_pct_24h, volume_24h, price, recent),
            extracted_at,
        }
    }

    /// Score for one asset; always within `[0, cap]`
    pub fn volatility_score(&self, change_pct: Decimal, volume_24h: Decimal, price: Decimal, recent: &[Decimal]) -> Decimal {
        let magnitude = change_pct.abs();
        let score = match &self.model {
            VolatilityModel::Magnitude { dispersion_weight, cap } => {
                let mut prices = recent.to_vec();
                prices.push(price);
                let raw = magnitude + (*dispersion_weight).max(Decimal::ZERO) * dispersion_pct(&prices);
                raw.min(*cap)
            }
            VolatilityModel::VolumeWeighted { cap } => magnitude.checked_mul(volume_24h).unwrap_or(*cap).min(*cap),
        };
        score.max(Decimal::ZERO).round_dp(4)
    }
}

/// Coefficient of variation in percent (population std / mean × 100).
///
/// Zero for fewer than two prices or a non-positive mean.
pub fn dispersion_pct(prices: &[Decimal]) -> Decimal {
    if prices.len() < 2 {
        return Decimal::ZERO;
    }

    let n = Decimal::from(prices.len());
    let mean = prices.iter().copied().sum::<Decimal>() / n;
    if mean <= Decimal::ZERO {
        return Decimal::ZERO;
    }

    let variance = prices
        .iter()
        .map(|p| {
            let d = *p - mean;
            d * d
        })
        .sum::<Decimal>()
        / n;

    variance
        .sqrt()
        .map(|std| std / mean * dec!(100))
        .unwrap_or(Decimal::ZERO)
}

fn clamp(value: Decimal, min: Decimal, max: Decimal) -> Decimal {
    value.max(min).min(max).round_dp(8)
}

/// Per-batch summary, logged after each transform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total_assets: usize,
    pub total_market_cap: Decimal,
    pub avg_price: Decimal,
    pub avg_change_pct_24h: Decimal,
    pub gainers: usize,
    pub losers: usize,
    /// `(symbol, change_pct_24h)`
    pub top_gainer: (String, Decimal),
    /// `(symbol, volatility_score)`
    pub most_volatile: (String, Decimal),
    pub extracted_at: DateTime<Utc>,
}

/// Summarize a batch; `None` when empty
pub fn summarize(records: &[MarketRecord]) -> Option<BatchSummary> {
    let first = records.first()?;
    let n = Decimal::from(records.len());

    let top_gainer = records.iter().max_by_key(|r| r.change_pct_24h)?;
    let most_volatile = records.iter().max_by_key(|r| r.volatility_score)?;

    Some(BatchSummary {
        total_assets: records.len(),
        total_market_cap: records.iter().map(|r| r.market_cap).sum(),
        avg_price: (records.iter().map(|r| r.price).sum::<Decimal>() / n).round_dp(8),
        avg_change_pct_24h: (records.iter().map(|r| r.change_pct_24h).sum::<Decimal>() / n).round_dp(4),
        gainers: records.iter().filter(|r| r.change_pct_24h > Decimal::ZERO).count(),
        losers: records.iter().filter(|r| r.change_pct_24h < Decimal::ZERO).count(),
        top_gainer: (top_gainer.symbol.clone(), top_gainer.change_pct_24h),
        most_volatile: (most_volatile.symbol.clone(), most_volatile.volatility_score),
        extracted_at: first.extracted_at,
    })
}
