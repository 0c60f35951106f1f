//! Z-score anomaly detection over a market cross-section

use crate::types::{MarketRecord, MetricField};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Sign of a deviation from the cross-section mean
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalyDirection {
    /// At or above the mean
    Spike,
    /// Below the mean
    Crash,
}

/// Per-asset detection result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyFlag {
    pub asset_id: String,
    pub symbol: String,
    pub value: Decimal,
    pub z_score: Decimal,
    pub is_anomalous: bool,
    pub direction: AnomalyDirection,
}

/// Population z-score detector for one metric
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnomalyDetector {
    field: MetricField,
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self::new(MetricField::ChangePct24h)
    }
}

impl AnomalyDetector {
    pub fn new(field: MetricField) -> Self {
        Self { field }
    }

    pub fn field(&self) -> MetricField {
        self.field
    }

    /// Score every record; `is_anomalous` is `|z| > threshold`.
    ///
    /// With fewer than two records or zero dispersion every z-score is 0 and
    /// nothing is flagged. Output follows input order.
    pub fn detect(&self, records: &[MarketRecord], threshold: Decimal) -> Vec<AnomalyFlag> {
        // f64 statistics: squared market caps overflow Decimal
        let values: Vec<f64> = records
            .iter()
            .map(|r| self.field.value(r).to_f64().unwrap_or(0.0))
            .collect();
        let threshold = threshold.to_f64().unwrap_or(f64::INFINITY);

        let (mean, std) = population_stats(&values);
        // identical inputs can still leave f64 rounding noise in std
        let uniform = match records.first() {
            Some(first) => {
                let first = self.field.value(first);
                records.iter().all(|r| self.field.value(r) == first)
            }
            None => true,
        };
        let degenerate = values.len() < 2 || uniform || !(std > 0.0) || !std.is_finite();

        records
            .iter()
            .zip(&values)
            .map(|(record, v)| {
                let z = if degenerate { 0.0 } else { (v - mean) / std };
                AnomalyFlag {
                    asset_id: record.asset_id.clone(),
                    symbol: record.symbol.clone(),
                    value: self.field.value(record),
                    z_score: Decimal::try_from(z).unwrap_or_default().round_dp(4),
                    is_anomalous: z.abs() > threshold,
                    direction: if z < 0.0 {
                        AnomalyDirection::Crash
                    } else {
                        AnomalyDirection::Spike
                    },
                }
            })
            .collect()
    }
}

fn population_stats(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}
