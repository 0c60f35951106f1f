//! In-memory result cache for read paths
//!
//! TTL-based memoization with single-flight recomputation: callers that hit
//! the same stale key wait on one computation and share its value.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Cache entry with expiry
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    computed_at: Instant,
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn new(value: V, ttl: Duration) -> Self {
        let computed_at = Instant::now();
        Self {
            value,
            computed_at,
            expires_at: computed_at + ttl,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

type Slot<V> = Arc<tokio::sync::Mutex<Option<CacheEntry<V>>>>;

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub expired_entries: usize,
    pub valid_entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Keyed TTL cache with per-key single-flight
pub struct ResultCache<V> {
    slots: Mutex<HashMap<String, Slot<V>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V> Default for ResultCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> ResultCache<V> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn slot(&self, key: &str) -> Slot<V> {
        let mut slots = self.slots.lock();
        slots.entry(key.to_string()).or_default().clone()
    }

    /// Drop expired entries.
    ///
    /// A slot some caller still holds is kept even when expired, so callers
    /// queued on that key keep sharing one computation.
    pub fn purge_expired(&self) -> usize {
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|_, slot| {
            Arc::strong_count(slot) > 1
                || slot
                    .try_lock()
                    .is_ok_and(|entry| entry.as_ref().is_some_and(|e| !e.is_expired()))
        });
        before - slots.len()
    }

    pub fn stats(&self) -> CacheStats {
        let slots = self.slots.lock();
        let mut stats = CacheStats {
            total_entries: 0,
            expired_entries: 0,
            valid_entries: 0,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        };
        for slot in slots.values() {
            // A locked slot is being recomputed; count it as pending, not as an entry
            let Ok(entry) = slot.try_lock() else { continue };
            if let Some(entry) = entry.as_ref() {
                stats.total_entries += 1;
                if entry.is_expired() {
                    stats.expired_entries += 1;
                } else {
                    stats.valid_entries += 1;
                }
            }
        }
        stats
    }
}

impl<V: Clone + Send + Sync + 'static> ResultCache<V> {
    /// Return the fresh cached value for `key`, computing it on a miss
    pub async fn get_or_compute<F, Fut>(&self, key: &str, ttl: Duration, compute: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let slot = self.slot(key);
        let mut guard = slot.lock().await;

        if let Some(entry) = guard.as_ref().filter(|e| !e.is_expired()) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return entry.value.clone();
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(key, "Cache miss, recomputing");
        let value = compute().await;
        *guard = Some(CacheEntry::new(value.clone(), ttl));
        value
    }

    /// Like [`get_or_compute`](Self::get_or_compute) with a fallible computation.
    ///
    /// A failed recompute serves the previous value when there is one; the
    /// error only reaches the caller when the key never computed successfully.
    pub async fn try_get_or_compute<F, Fut, E>(&self, key: &str, ttl: Duration, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: std::fmt::Display,
    {
        let slot = self.slot(key);
        let mut guard = slot.lock().await;

        if let Some(entry) = guard.as_ref().filter(|e| !e.is_expired()) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(entry.value.clone());
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(key, "Cache miss, recomputing");
        match compute().await {
            Ok(value) => {
                *guard = Some(CacheEntry::new(value.clone(), ttl));
                Ok(value)
            }
            Err(err) => match guard.as_ref() {
                Some(stale) => {
                    warn!(
                        key,
                        age_ms = stale.computed_at.elapsed().as_millis() as u64,
                        "Recompute failed ({}), serving stale value",
                        err
                    );
                    Ok(stale.value.clone())
                }
                None => Err(err),
            },
        }
    }
}
