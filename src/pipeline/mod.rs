//! Pipeline orchestration
//!
//! The [`Orchestrator`] drives fetch → archive → validate → transform → upsert
//! on a fixed interval. Runs never overlap: the scheduler and manual triggers
//! share one run lock, acquired with `try_lock` so nothing ever queues behind
//! an in-flight run.

pub mod breaker;
pub mod retry;

pub use breaker::{BreakerState, CircuitBreaker, TickDecision};
pub use retry::{retry_with_policy, RetryPolicy};

use crate::client::{Fetcher, MarketSource};
use crate::config::{Config, TransformConfig, VolatilityModel};
use crate::data::{summarize, PriceContext, Transformer};
use crate::error::{FetchError, RunError, RunResult};
use crate::storage::MarketStore;
use crate::types::{timestamp_key, RawCandidate, RawSnapshot, Universe};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Outcome of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    /// Some items were dropped at validation, the rest were written
    Partial,
    Failed,
    /// Scheduled tick skipped by the open circuit breaker
    Skipped,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    Scheduled,
    Manual,
    /// Re-load of an archived snapshot
    Replay,
}

/// Where the current run is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunPhase {
    Idle = 0,
    Fetching = 1,
    Validating = 2,
    Transforming = 3,
    Storing = 4,
}

impl From<u8> for RunPhase {
    fn from(val: u8) -> Self {
        match val {
            1 => RunPhase::Fetching,
            2 => RunPhase::Validating,
            3 => RunPhase::Transforming,
            4 => RunPhase::Storing,
            _ => RunPhase::Idle,
        }
    }
}

/// Record of one finished (or skipped) run
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineRunResult {
    pub run_id: Uuid,
    pub trigger: RunTrigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    /// Top-level items in the provider response
    pub candidates_fetched: usize,
    pub candidates_dropped: usize,
    pub records_written: usize,
    /// Fetch attempts, retries included
    pub attempts: u32,
    pub error: Option<RunError>,
}

impl PipelineRunResult {
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, RunStatus::Success | RunStatus::Partial)
    }
}

/// Runtime settings, resolved from [`Config`]
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub universe: Universe,
    pub interval: Duration,
    pub run_deadline: Duration,
    pub history_limit: usize,
    pub run_on_start: bool,
    pub retry: RetryPolicy,
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub volatility: VolatilityModel,
    /// Lookback for the per-asset price dispersion term
    pub dispersion_window: chrono::Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            universe: config.provider.universe(),
            interval: config.pipeline.interval(),
            run_deadline: config.pipeline.run_deadline(),
            history_limit: config.pipeline.history_limit.max(1),
            run_on_start: config.pipeline.run_on_start,
            retry: RetryPolicy::from(&config.pipeline.retry),
            failure_threshold: config.breaker.failure_threshold,
            cooldown: Duration::from_secs(config.breaker.cooldown_secs),
            volatility: config.transform.volatility.clone(),
            dispersion_window: chrono::Duration::seconds(
                config
                    .transform
                    .dispersion_window_secs
                    .clamp(0, TransformConfig::MAX_DISPERSION_WINDOW_SECS),
            ),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug, Default)]
struct RunProgress {
    candidates_fetched: usize,
    candidates_dropped: usize,
    records_written: usize,
    attempts: u32,
}

/// Scheduled ETL driver; the only writer to the store
pub struct Orchestrator {
    fetcher: Fetcher,
    store: Arc<dyn MarketStore>,
    transformer: Transformer,
    settings: PipelineSettings,
    run_lock: tokio::sync::Mutex<()>,
    breaker: Mutex<CircuitBreaker>,
    history: Mutex<VecDeque<PipelineRunResult>>,
    phase: AtomicU8,
}

impl Orchestrator {
    pub fn new(source: Arc<dyn MarketSource>, store: Arc<dyn MarketStore>, settings: PipelineSettings) -> Self {
        let breaker = CircuitBreaker::new(settings.failure_threshold, settings.cooldown, settings.interval);
        Self {
            fetcher: Fetcher::new(source),
            store,
            transformer: Transformer::new(settings.volatility.clone()),
            run_lock: tokio::sync::Mutex::new(()),
            breaker: Mutex::new(breaker),
            history: Mutex::new(VecDeque::with_capacity(settings.history_limit)),
            phase: AtomicU8::new(RunPhase::Idle as u8),
            settings,
        }
    }

    pub fn store(&self) -> Arc<dyn MarketStore> {
        Arc::clone(&self.store)
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn phase(&self) -> RunPhase {
        RunPhase::from(self.phase.load(Ordering::SeqCst))
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.lock().state()
    }

    /// Finished runs, oldest first
    pub fn history(&self) -> Vec<PipelineRunResult> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn last_result(&self) -> Option<PipelineRunResult> {
        self.history.lock().back().cloned()
    }

    /// One scheduled tick.
    ///
    /// Returns `None` when a run is already in progress; the tick is dropped.
    pub async fn tick(&self) -> Option<PipelineRunResult> {
        let Ok(_guard) = self.run_lock.try_lock() else {
            info!("Run still in progress, coalescing scheduled tick");
            return None;
        };

        let decision = self.breaker.lock().on_tick();
        let result = match decision {
            TickDecision::Skip => {
                info!("Circuit breaker open, skipping scheduled run");
                self.skipped_result()
            }
            TickDecision::Run | TickDecision::Trial => self.execute(RunTrigger::Scheduled, None).await,
        };

        self.finish(&result, true);
        Some(result)
    }

    /// Run now, bypassing an open breaker.
    ///
    /// Fails fast with [`RunError::Busy`] while another run holds the lock.
    pub async fn trigger_run(&self) -> RunResult<PipelineRunResult> {
        let _guard = self.run_lock.try_lock().map_err(|_| RunError::Busy)?;
        info!("Manual run triggered");

        let result = self.execute(RunTrigger::Manual, None).await;
        self.finish(&result, true);
        Ok(result)
    }

    /// Re-validate, re-transform and re-upsert an archived snapshot.
    ///
    /// Records keep the snapshot's extraction time, so replaying twice
    /// leaves the store unchanged.
    pub async fn replay_snapshot(&self, fetched_at: DateTime<Utc>) -> RunResult<PipelineRunResult> {
        let _guard = self.run_lock.try_lock().map_err(|_| RunError::Busy)?;

        let snapshot = self
            .store
            .snapshot_at(fetched_at)
            .await?
            .ok_or_else(|| RunError::SnapshotNotFound(timestamp_key(&fetched_at)))?;
        info!("Replaying snapshot {} ({} items)", timestamp_key(&fetched_at), snapshot.item_count());

        let result = self.execute(RunTrigger::Replay, Some(snapshot)).await;
        // upstream was not involved, leave the breaker alone
        self.finish(&result, false);
        Ok(result)
    }

    /// Drive scheduled ticks until `shutdown` flips to true.
    ///
    /// Each tick is spawned so a slow run never delays the timer; ticks that
    /// land on a running pipeline are coalesced.
    pub async fn run_forever(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.settings.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        if !self.settings.run_on_start {
            // the first tick completes immediately
            interval.tick().await;
        }

        info!(
            "Scheduler started: every {}s, deadline {}s",
            self.settings.interval.as_secs(),
            self.settings.run_deadline.as_secs()
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        this.tick().await;
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown requested, stopping scheduler");
                        break;
                    }
                }
            }
        }

        // let an in-flight run finish; the deadline bounds the wait
        let _guard = self.run_lock.lock().await;
        info!("Scheduler stopped");
    }

    async fn execute(&self, trigger: RunTrigger, replay: Option<RawSnapshot>) -> PipelineRunResult {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut progress = RunProgress::default();
        debug!(%run_id, ?trigger, "Run started");

        let outcome = tokio::time::timeout(self.settings.run_deadline, async {
            match replay {
                Some(snapshot) => self.load(&snapshot, &mut progress).await,
                None => self.fetch_and_load(&mut progress).await,
            }
        })
        .await;
        self.set_phase(RunPhase::Idle);

        let (status, error) = match outcome {
            Ok(Ok(())) if progress.candidates_dropped > 0 => (RunStatus::Partial, None),
            Ok(Ok(())) => (RunStatus::Success, None),
            Ok(Err(e)) => (RunStatus::Failed, Some(e)),
            Err(_) => (
                RunStatus::Failed,
                Some(RunError::Timeout {
                    deadline_secs: self.settings.run_deadline.as_secs(),
                }),
            ),
        };

        PipelineRunResult {
            run_id,
            trigger,
            started_at,
            finished_at: Utc::now(),
            status,
            candidates_fetched: progress.candidates_fetched,
            candidates_dropped: progress.candidates_dropped,
            records_written: progress.records_written,
            attempts: progress.attempts,
            error,
        }
    }

    async fn fetch_and_load(&self, progress: &mut RunProgress) -> RunResult<()> {
        self.set_phase(RunPhase::Fetching);
        let source = self.fetcher.source();
        let universe = &self.settings.universe;

        let (fetched, attempts) = retry_with_policy(
            &self.settings.retry,
            |attempt| async move {
                debug!(attempt, "Fetching {} assets", universe.size());
                source.fetch_raw(universe).await
            },
            FetchError::is_transient,
        )
        .await;
        progress.attempts = attempts;
        let snapshot = fetched?;

        // archived before validation so rejected payloads stay inspectable
        match self.store.archive_snapshot(&snapshot).await {
            Ok(true) => debug!("Archived raw snapshot {}", timestamp_key(&snapshot.fetched_at)),
            Ok(false) => warn!("Snapshot {} was already archived", timestamp_key(&snapshot.fetched_at)),
            Err(e) => warn!("Failed to archive raw snapshot: {}", e),
        }

        self.load(&snapshot, progress).await
    }

    async fn load(&self, snapshot: &RawSnapshot, progress: &mut RunProgress) -> RunResult<()> {
        self.set_phase(RunPhase::Validating);
        progress.candidates_fetched = snapshot.item_count();
        let batch = self.fetcher.validate(snapshot)?;
        progress.candidates_dropped = batch.dropped;

        self.set_phase(RunPhase::Transforming);
        let context = self.price_context(&batch.candidates, snapshot.fetched_at).await;
        let records = self.transformer.transform(&batch.candidates, snapshot.fetched_at, &context);
        if let Some(summary) = summarize(&records) {
            info!(
                "Batch: {} assets, total mcap ${}, {} up / {} down, top gainer {} ({}%)",
                summary.total_assets,
                summary.total_market_cap.round_dp(0),
                summary.gainers,
                summary.losers,
                summary.top_gainer.0,
                summary.top_gainer.1
            );
        }

        self.set_phase(RunPhase::Storing);
        progress.records_written = self.store.upsert_batch(&records).await?;
        Ok(())
    }

    /// Recent prices per candidate, strictly before `as_of`.
    ///
    /// Lookup failures only cost the dispersion term.
    async fn price_context(&self, candidates: &[RawCandidate], as_of: DateTime<Utc>) -> PriceContext {
        let mut context = PriceContext::new();
        if self.settings.dispersion_window.is_zero() {
            return context;
        }

        let Some(since) = as_of.checked_sub_signed(self.settings.dispersion_window) else {
            return context;
        };
        for candidate in candidates {
            match self.store.read_window(&candidate.asset_id, since).await {
                Ok(window) => {
                    let prices: Vec<_> = window
                        .iter()
                        .filter(|r| r.extracted_at < as_of)
                        .map(|r| r.price)
                        .collect();
                    if !prices.is_empty() {
                        context.insert(candidate.asset_id.clone(), prices);
                    }
                }
                Err(e) => {
                    warn!("Price history unavailable, scoring without dispersion: {}", e);
                    break;
                }
            }
        }
        context
    }

    fn skipped_result(&self) -> PipelineRunResult {
        let now = Utc::now();
        PipelineRunResult {
            run_id: Uuid::new_v4(),
            trigger: RunTrigger::Scheduled,
            started_at: now,
            finished_at: now,
            status: RunStatus::Skipped,
            candidates_fetched: 0,
            candidates_dropped: 0,
            records_written: 0,
            attempts: 0,
            error: None,
        }
    }

    fn finish(&self, result: &PipelineRunResult, feeds_breaker: bool) {
        if feeds_breaker {
            self.breaker.lock().record(result.status);
        }

        match (&result.status, &result.error) {
            (RunStatus::Failed, Some(e)) => error!(
                "Run {} ({:?}) failed after {} attempt(s): {}",
                result.run_id, result.trigger, result.attempts, e
            ),
            (RunStatus::Skipped, _) => {}
            (status, _) => info!(
                "Run {} ({:?}) {}: {} written, {} dropped in {}ms",
                result.run_id,
                result.trigger,
                status,
                result.records_written,
                result.candidates_dropped,
                result.duration().num_milliseconds()
            ),
        }

        let mut history = self.history.lock();
        history.push_back(result.clone());
        while history.len() > self.settings.history_limit {
            history.pop_front();
        }
    }

    fn set_phase(&self, phase: RunPhase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }
}
