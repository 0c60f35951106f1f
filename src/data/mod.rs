//! Data engineering module
//!
//! - Boundary validation of provider payloads
//! - Candidate → record transformation with volatility scoring

pub mod transform;
pub mod validation;

pub use transform::{dispersion_pct, summarize, BatchSummary, PriceContext, Transformer};
pub use validation::{validate_item, validate_payload, ItemIssue, ValidatedBatch};
