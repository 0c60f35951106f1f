//! Configuration management
//!
//! Loaded from a TOML/YAML file layered with `MARKET_PULSE__SECTION__KEY`
//! environment variables. Every option has a default, so an empty file is valid.

use crate::types::{MetricField, Universe};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub provider: ProviderConfig,
    pub pipeline: PipelineConfig,
    pub breaker: BreakerConfig,
    pub storage: StorageConfig,
    pub analytics: AnalyticsConfig,
    pub transform: TransformConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Market data API base URL
    pub base_url: String,
    /// Optional pro API key, sent as `x-cg-pro-api-key`
    pub api_key: Option<String>,
    /// Quote currency
    pub vs_currency: String,
    /// Number of top assets by market cap to track (ignored when `asset_ids` is set)
    pub universe_size: usize,
    /// Explicit asset ids; overrides `universe_size` when non-empty
    pub asset_ids: Vec<String>,
    /// Per-request HTTP timeout
    pub request_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.coingecko.com/api/v3".to_string(),
            api_key: None,
            vs_currency: "usd".to_string(),
            universe_size: 20,
            asset_ids: Vec::new(),
            request_timeout_secs: 30,
        }
    }
}

impl ProviderConfig {
    pub fn universe(&self) -> Universe {
        if self.asset_ids.is_empty() {
            Universe::TopN(self.universe_size)
        } else {
            Universe::Assets(self.asset_ids.clone())
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Scheduled run interval
    pub interval_secs: u64,
    /// Hard deadline for one run; exceeding it records a Failed/Timeout outcome
    pub run_deadline_secs: u64,
    /// Number of run results kept in the rolling history
    pub history_limit: usize,
    /// Execute a run immediately when the scheduler starts
    pub run_on_start: bool,
    pub retry: RetryConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            run_deadline_secs: 120,
            history_limit: 100,
            run_on_start: true,
            retry: RetryConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn run_deadline(&self) -> Duration {
        Duration::from_secs(self.run_deadline_secs)
    }
}

/// Retry bounds for transient upstream failures within one run
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
    /// Random extra delay as a fraction of the computed backoff (0.0 disables)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 2000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 30_000,
            jitter: 0.1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failed runs that open the breaker
    pub failure_threshold: u32,
    /// How long the breaker stays open before a trial run
    pub cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 900,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// PostgreSQL URL of the primary store; unset means embedded only
    pub primary_url: Option<String>,
    /// SQLite file used as the embedded fallback store
    pub fallback_path: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            primary_url: None,
            fallback_path: "data/market_pulse.db".to_string(),
            max_connections: 5,
            connect_timeout_secs: 5,
        }
    }
}

impl StorageConfig {
    pub fn fallback_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.fallback_path).as_ref())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    /// |z| above which an asset is flagged
    pub anomaly_threshold: Decimal,
    /// Column the z-score is computed over
    pub anomaly_field: MetricField,
    /// TTL of cached read results
    pub cache_ttl_secs: u64,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            anomaly_threshold: dec!(2.5),
            anomaly_field: MetricField::ChangePct24h,
            cache_ttl_secs: 60,
        }
    }
}

impl AnalyticsConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    pub volatility: VolatilityModel,
    /// Lookback for the price dispersion term
    pub dispersion_window_secs: i64,
}

impl TransformConfig {
    /// Longest accepted dispersion lookback, one year
    pub const MAX_DISPERSION_WINDOW_SECS: i64 = 365 * 24 * 60 * 60;
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            volatility: VolatilityModel::default(),
            dispersion_window_secs: 3600,
        }
    }
}

/// Volatility score policy
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum VolatilityModel {
    /// `min(cap, |change| + weight * dispersion_pct)`
    Magnitude {
        #[serde(default = "default_dispersion_weight")]
        dispersion_weight: Decimal,
        #[serde(default = "default_magnitude_cap")]
        cap: Decimal,
    },
    /// `min(cap, |change| * volume_24h)`
    VolumeWeighted {
        #[serde(default = "default_volume_weighted_cap")]
        cap: Decimal,
    },
}

fn default_dispersion_weight() -> Decimal {
    dec!(0.5)
}

fn default_magnitude_cap() -> Decimal {
    dec!(1000)
}

fn default_volume_weighted_cap() -> Decimal {
    dec!(1000000000000000)
}

impl Default for VolatilityModel {
    fn default() -> Self {
        Self::Magnitude {
            dispersion_weight: default_dispersion_weight(),
            cap: default_magnitude_cap(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(&path.as_ref().to_string_lossy()))
            .add_source(config::Environment::with_prefix("MARKET_PULSE").separator("__"))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from default locations, falling back to environment-only settings
    pub fn load_default() -> anyhow::Result<Self> {
        let paths = ["config.toml", "config.yaml", "~/.config/market-pulse/config.toml"];

        for path in paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::load(expanded.as_ref());
            }
        }

        tracing::warn!("No configuration file found, using defaults and environment");
        let settings = config::Config::builder()
            .add_source(config::Environment::with_prefix("MARKET_PULSE").separator("__"))
            .build()?;
        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the scheduler or detector meaningless
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pipeline.interval_secs == 0 {
            anyhow::bail!("pipeline.interval_secs must be positive");
        }
        if self.pipeline.run_deadline_secs == 0 {
            anyhow::bail!("pipeline.run_deadline_secs must be positive");
        }
        if self.pipeline.retry.max_attempts == 0 {
            anyhow::bail!("pipeline.retry.max_attempts must be at least 1");
        }
        if self.breaker.failure_threshold == 0 {
            anyhow::bail!("breaker.failure_threshold must be at least 1");
        }
        if self.analytics.anomaly_threshold <= Decimal::ZERO {
            anyhow::bail!("analytics.anomaly_threshold must be positive");
        }
        let window = self.transform.dispersion_window_secs;
        if !(0..=TransformConfig::MAX_DISPERSION_WINDOW_SECS).contains(&window) {
            anyhow::bail!(
                "transform.dispersion_window_secs must be between 0 and {}, got {}",
                TransformConfig::MAX_DISPERSION_WINDOW_SECS,
                window
            );
        }
        if self.provider.asset_ids.is_empty() && self.provider.universe_size == 0 {
            anyhow::bail!("provider.universe_size must be positive when no asset_ids are set");
        }
        Ok(())
    }
}
