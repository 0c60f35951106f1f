//! Boundary validation of provider payloads
//!
//! Turns an untyped `/coins/markets` response into [`RawCandidate`]s.
//! Bad items are dropped and counted; a payload with no usable item fails.

use crate::error::{FetchError, FetchResult};
use crate::types::RawCandidate;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::str::FromStr;
use tracing::warn;

/// Why a single item was rejected
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ItemIssue {
    /// Item is not a JSON object
    NotAnObject,
    /// Required field absent, null or blank
    MissingField { field: String },
    /// Field present but unparseable or out of range
    InvalidValue { field: String, reason: String },
    /// Asset id already seen earlier in the payload
    DuplicateAsset { asset_id: String },
}

/// Validated items plus the count of dropped ones
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidatedBatch {
    pub candidates: Vec<RawCandidate>,
    pub dropped: usize,
    /// `(index, issue)` per dropped item
    pub issues: Vec<(usize, ItemIssue)>,
}

impl ValidatedBatch {
    pub fn total_items(&self) -> usize {
        self.candidates.len() + self.dropped
    }
}

/// Validate a full provider response
pub fn validate_payload(payload: &Value) -> FetchResult<ValidatedBatch> {
    let items = payload.as_array().ok_or_else(|| {
        FetchError::SchemaViolation(format!("expected a JSON array, got {}", json_kind(payload)))
    })?;

    if items.is_empty() {
        return Err(FetchError::EmptyResult(
            "provider returned an empty list (possible rate limit or outage)".to_string(),
        ));
    }

    let mut batch = ValidatedBatch::default();
    let mut seen = HashSet::new();

    for (index, item) in items.iter().enumerate() {
        match validate_item(item) {
            Ok(candidate) if !seen.insert(candidate.asset_id.clone()) => {
                batch.dropped += 1;
                batch.issues.push((index, ItemIssue::DuplicateAsset { asset_id: candidate.asset_id }));
            }
            Ok(candidate) => batch.candidates.push(candidate),
            Err(issue) => {
                warn!("Item[{}] rejected: {:?}", index, issue);
                batch.dropped += 1;
                batch.issues.push((index, issue));
            }
        }
    }

    if batch.candidates.is_empty() {
        return Err(FetchError::EmptyResult(format!(
            "no valid items after validation ({} dropped)",
            batch.dropped
        )));
    }

    Ok(batch)
}

/// Validate one provider item
pub fn validate_item(item: &Value) -> Result<RawCandidate, ItemIssue> {
    let obj = item.as_object().ok_or(ItemIssue::NotAnObject)?;

    let asset_id = match obj.get("id") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        _ => return Err(missing("id")),
    };

    let price = match present(obj, "current_price") {
        Some(v) => non_negative("current_price", v)?,
        None => return Err(missing("current_price")),
    };
    let market_cap = optional_non_negative(obj, "market_cap")?;
    let volume_24h = optional_non_negative(obj, "total_volume")?;
    let change_pct_24h = match present(obj, "price_change_percentage_24h") {
        Some(v) => parse_number(v).ok_or_else(|| invalid("price_change_percentage_24h", v))?,
        None => Decimal::ZERO,
    };

    let market_cap_rank = present(obj, "market_cap_rank")
        .and_then(parse_number)
        .filter(|r| r.fract().is_zero() && *r >= Decimal::ONE)
        .and_then(|r| r.to_u32());

    let symbol = text_or(obj, "symbol", &asset_id);
    let name = text_or(obj, "name", &asset_id);

    Ok(RawCandidate {
        asset_id,
        symbol,
        name,
        price,
        market_cap,
        volume_24h,
        change_pct_24h,
        market_cap_rank,
    })
}

/// Parse a JSON number or numeric string into a decimal
pub fn parse_number(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(Decimal::from(i))
            } else if let Some(u) = n.as_u64() {
                Some(Decimal::from(u))
            } else {
                n.as_f64().and_then(|f| Decimal::try_from(f).ok())
            }
        }
        Value::String(s) => {
            let s = s.trim();
            Decimal::from_str(s).or_else(|_| Decimal::from_scientific(s)).ok()
        }
        _ => None,
    }
}

fn present<'a>(obj: &'a Map<String, Value>, field: &str) -> Option<&'a Value> {
    obj.get(field).filter(|v| !v.is_null())
}

fn non_negative(field: &str, value: &Value) -> Result<Decimal, ItemIssue> {
    let n = parse_number(value).ok_or_else(|| invalid(field, value))?;
    if n < Decimal::ZERO {
        return Err(ItemIssue::InvalidValue {
            field: field.to_string(),
            reason: format!("negative value {}", n),
        });
    }
    Ok(n)
}

fn optional_non_negative(obj: &Map<String, Value>, field: &str) -> Result<Decimal, ItemIssue> {
    match present(obj, field) {
        Some(v) => non_negative(field, v),
        None => Ok(Decimal::ZERO),
    }
}

fn text_or(obj: &Map<String, Value>, field: &str, default: &str) -> String {
    match obj.get(field) {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        _ => default.to_string(),
    }
}

fn missing(field: &str) -> ItemIssue {
    ItemIssue::MissingField { field: field.to_string() }
}

fn invalid(field: &str, value: &Value) -> ItemIssue {
    ItemIssue::InvalidValue {
        field: field.to_string(),
        reason: format!("not a number: {}", value),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
