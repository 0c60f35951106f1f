//! In-crate market sources for pipeline tests
//!
//! - [`StaticSource`]: same payload every call
//! - [`ScriptedSource`]: one scripted outcome per call
//! - [`GatedSource`]: blocks inside `fetch_raw` until released

use crate::client::MarketSource;
use crate::error::{FetchError, FetchResult};
use crate::types::{RawSnapshot, Universe};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

const FAKE_SOURCE: &str = "fake_markets";

/// Returns the same payload on every call
pub struct StaticSource {
    payload: Value,
    calls: AtomicUsize,
}

impl StaticSource {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MarketSource for StaticSource {
    async fn fetch_raw(&self, _universe: &Universe) -> FetchResult<RawSnapshot> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(RawSnapshot::new(FAKE_SOURCE, self.payload.clone()))
    }
}

/// Pops one scripted outcome per call; the last one repeats once the script runs out
pub struct ScriptedSource {
    script: Mutex<VecDeque<FetchResult<Value>>>,
    last: Mutex<Option<FetchResult<Value>>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(script: Vec<FetchResult<Value>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(None),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Sleep before answering each call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Transport failures followed by a good payload
    pub fn flaky(failures: usize, payload: Value) -> Self {
        let mut script: Vec<FetchResult<Value>> = (0..failures)
            .map(|i| Err(FetchError::Transport(format!("connection reset #{}", i + 1))))
            .collect();
        script.push(Ok(payload));
        Self::new(script)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_outcome(&self) -> FetchResult<Value> {
        let next = self.script.lock().pop_front();
        let mut last = self.last.lock();
        match next {
            Some(outcome) => {
                *last = Some(outcome.clone());
                outcome
            }
            None => last
                .clone()
                .unwrap_or_else(|| Err(FetchError::Transport("script exhausted".to_string()))),
        }
    }
}

#[async_trait]
impl MarketSource for ScriptedSource {
    async fn fetch_raw(&self, _universe: &Universe) -> FetchResult<RawSnapshot> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.next_outcome().map(|payload| RawSnapshot::new(FAKE_SOURCE, payload))
    }
}

/// Signals entry into `fetch_raw`, then waits for [`release`](Self::release)
pub struct GatedSource {
    payload: Value,
    entered: Arc<Notify>,
    gate: Arc<Notify>,
}

impl GatedSource {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            entered: Arc::new(Notify::new()),
            gate: Arc::new(Notify::new()),
        }
    }

    /// Resolves once a call is parked at the gate
    pub async fn wait_entered(&self) {
        self.entered.notified().await;
    }

    /// Let one parked call through
    pub fn release(&self) {
        self.gate.notify_one();
    }
}

#[async_trait]
impl MarketSource for GatedSource {
    async fn fetch_raw(&self, _universe: &Universe) -> FetchResult<RawSnapshot> {
        self.entered.notify_one();
        self.gate.notified().await;
        Ok(RawSnapshot::new(FAKE_SOURCE, self.payload.clone()))
    }
}
