//! Tick-based circuit breaker for scheduled runs
//!
//! Counts consecutive failed runs. At the threshold it opens for a fixed number
//! of scheduled ticks, each skipped without touching upstream. The tick after
//! that is a half-open trial: success closes, failure reopens.

use super::RunStatus;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BreakerState {
    Closed { consecutive_failures: u32 },
    Open { remaining_ticks: u32 },
    HalfOpen,
}

/// What a scheduled tick should do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickDecision {
    Run,
    /// Half-open trial run
    Trial,
    Skip,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    open_ticks: u32,
    state: BreakerState,
}

impl CircuitBreaker {
    /// `cooldown` is converted to whole scheduled ticks, rounding up
    pub fn new(failure_threshold: u32, cooldown: Duration, interval: Duration) -> Self {
        let interval_ms = interval.as_millis().max(1);
        let ticks = cooldown.as_millis().div_ceil(interval_ms);
        Self::with_ticks(failure_threshold, u32::try_from(ticks).unwrap_or(u32::MAX))
    }

    pub fn with_ticks(failure_threshold: u32, open_ticks: u32) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            open_ticks,
            state: BreakerState::Closed { consecutive_failures: 0 },
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, BreakerState::Open { .. })
    }

    /// Scheduled ticks skipped per open period
    pub fn open_ticks(&self) -> u32 {
        self.open_ticks
    }

    /// Advance by one scheduled tick
    pub fn on_tick(&mut self) -> TickDecision {
        match self.state {
            BreakerState::Closed { .. } => TickDecision::Run,
            BreakerState::HalfOpen => TickDecision::Trial,
            BreakerState::Open { remaining_ticks: 0 } => {
                info!("Circuit breaker half-open, allowing trial run");
                self.state = BreakerState::HalfOpen;
                TickDecision::Trial
            }
            BreakerState::Open { remaining_ticks } => {
                self.state = BreakerState::Open {
                    remaining_ticks: remaining_ticks - 1,
                };
                TickDecision::Skip
            }
        }
    }

    /// Feed a finished run's outcome
    pub fn record(&mut self, status: RunStatus) {
        match (status, self.state) {
            (RunStatus::Skipped, _) => {}
            (RunStatus::Success | RunStatus::Partial, BreakerState::Closed { .. }) => {
                self.state = BreakerState::Closed { consecutive_failures: 0 };
            }
            (RunStatus::Success | RunStatus::Partial, _) => {
                info!("Circuit breaker closed after successful run");
                self.state = BreakerState::Closed { consecutive_failures: 0 };
            }
            (RunStatus::Failed, BreakerState::Closed { consecutive_failures }) => {
                let failures = consecutive_failures + 1;
                if failures >= self.failure_threshold {
                    self.open(failures);
                } else {
                    self.state = BreakerState::Closed {
                        consecutive_failures: failures,
                    };
                }
            }
            (RunStatus::Failed, BreakerState::HalfOpen) => {
                warn!("Trial run failed, circuit breaker reopened");
                self.open(self.failure_threshold);
            }
            // a manual run failing while open does not extend the cool-down
            (RunStatus::Failed, BreakerState::Open { .. }) => {}
        }
    }

    fn open(&mut self, failures: u32) {
        warn!(
            "Circuit breaker OPEN after {} consecutive failures, skipping next {} ticks",
            failures, self.open_ticks
        );
        self.state = BreakerState::Open {
            remaining_ticks: self.open_ticks,
        };
    }
}
