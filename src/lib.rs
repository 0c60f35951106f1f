//! Market Pulse
//!
//! Scheduled crypto market ETL: fetch a provider snapshot, validate and
//! normalize it, persist it with primary/fallback failover, and serve cached
//! analytics (latest snapshot, rankings, history, z-score anomalies).

pub mod analysis;
pub mod client;
pub mod config;
pub mod data;
pub mod error;
pub mod pipeline;
pub mod storage;
pub mod testing;
pub mod types;
