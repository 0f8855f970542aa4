//! Process-local cache storage.
//!
//! Entries are type-erased values keyed by [`CacheKey`]. Reads go through
//! [`CacheStore::get_or_compute`], which runs at most one computation per key at a time
//! and never blocks computations for other keys.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use metrics::counter;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::{debug, info};

use super::config::CacheConfig;
use super::keys::{CacheKey, KeyPattern, region_of};
use super::lock::{mutex_lock, rw_read, rw_write};

const SOURCE: &str = "cache::store";

pub const METRIC_CACHE_HIT: &str = "scriptorium_cache_hit_total";
pub const METRIC_CACHE_MISS: &str = "scriptorium_cache_miss_total";
pub const METRIC_CACHE_COMPUTE: &str = "scriptorium_cache_compute_total";
pub const METRIC_CACHE_COMPUTE_FAILED: &str = "scriptorium_cache_compute_failed_total";
pub const METRIC_CACHE_INVALIDATED: &str = "scriptorium_cache_invalidated_total";
pub const METRIC_CACHE_EXPIRED: &str = "scriptorium_cache_expired_total";

type SharedValue = Arc<dyn Any + Send + Sync>;

struct Entry {
    value: SharedValue,
    /// Sliding window of the entry's region; `None` never expires.
    window: Option<Duration>,
    last_access: Instant,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.window
            .is_some_and(|window| now.saturating_duration_since(self.last_access) >= window)
    }
}

/// Outcome of the latest computation of a flight.
#[derive(Default)]
struct FlightSlot {
    /// Set when an invalidation matching the key lands while a computation runs.
    stale: bool,
    /// The last value stored by this flight, handed to callers queued behind it.
    value: Option<SharedValue>,
}

/// Per-key state shared by every caller of the same missing key.
#[derive(Default)]
struct FlightState {
    permit: AsyncMutex<()>,
    slot: Mutex<FlightSlot>,
}

impl FlightState {
    fn slot(&self, op: &'static str) -> MutexGuard<'_, FlightSlot> {
        mutex_lock(&self.slot, SOURCE, op)
    }

    fn mark_stale(&self) {
        let mut slot = self.slot("mark_stale");
        slot.stale = true;
        slot.value = None;
    }
}

/// Registration in the per-key flight table, removed when the last participant leaves.
struct Flight<'a> {
    store: &'a CacheStore,
    key: &'a str,
    state: Arc<FlightState>,
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        let mut flights = mutex_lock(&self.store.flights, SOURCE, "leave_flight");
        // One reference in the table plus ours: nobody else is waiting.
        if Arc::strong_count(&self.state) == 2 {
            flights.remove(self.key);
        }
    }
}

/// Cache store with single-flight population and pattern invalidation.
///
/// Constructed explicitly and shared through `Arc`; there is no global instance.
pub struct CacheStore {
    config: CacheConfig,
    entries: DashMap<String, Entry>,
    flights: Mutex<HashMap<String, Arc<FlightState>>>,
    /// Held shared while storing a computed value and exclusively while purging.
    gate: RwLock<()>,
}

impl CacheStore {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            flights: Mutex::new(HashMap::new()),
            gate: RwLock::new(()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Return the cached value for `key`, or run `compute` once and cache its result.
    ///
    /// Concurrent callers for the same key wait for the running computation and receive
    /// the value it stored. A computation overlapped by an invalidation matching its
    /// key returns its value to its own caller only; queued callers then compute
    /// again. Invalidations of other keys do not affect it. A failed computation
    /// stores nothing and the error goes to the caller that ran it. An entry of a
    /// different type under the same key is treated as a miss and replaced.
    pub async fn get_or_compute<V, E, F, Fut>(
        &self,
        key: &CacheKey,
        compute: F,
    ) -> Result<Arc<V>, E>
    where
        V: Any + Send + Sync,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let region = key.region();
        if let Some(value) = self.lookup::<V>(key.as_str()) {
            counter!(METRIC_CACHE_HIT, "region" => region.to_owned()).increment(1);
            return Ok(value);
        }

        let flight = self.join_flight(key.as_str());
        let _permit = flight.state.permit.lock().await;

        // The participant ahead of us may have computed the key while we waited.
        let handed_off = flight.state.slot("handoff").value.clone();
        if let Some(value) = handed_off.and_then(|value| value.downcast::<V>().ok()) {
            counter!(METRIC_CACHE_HIT, "region" => region.to_owned()).increment(1);
            return Ok(value);
        }
        if let Some(value) = self.lookup::<V>(key.as_str()) {
            counter!(METRIC_CACHE_HIT, "region" => region.to_owned()).increment(1);
            return Ok(value);
        }

        counter!(METRIC_CACHE_MISS, "region" => region.to_owned()).increment(1);
        counter!(METRIC_CACHE_COMPUTE, "region" => region.to_owned()).increment(1);
        debug!(cache_key = %key, region, "Cache miss, computing value");

        *flight.state.slot("begin_compute") = FlightSlot::default();
        let value = match compute().await {
            Ok(value) => Arc::new(value),
            Err(err) => {
                counter!(METRIC_CACHE_COMPUTE_FAILED, "region" => region.to_owned()).increment(1);
                debug!(cache_key = %key, region, "Cache computation failed, key left absent");
                return Err(err);
            }
        };

        self.store_unless_stale(key, &flight.state, value.clone());
        Ok(value)
    }

    /// Cached value for `key` when present, unexpired, and of type `V`.
    ///
    /// A hit refreshes the entry's sliding window.
    pub fn get<V: Any + Send + Sync>(&self, key: &CacheKey) -> Option<Arc<V>> {
        self.lookup(key.as_str())
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        let now = Instant::now();
        self.entries
            .get(key.as_str())
            .is_some_and(|entry| !entry.is_expired(now))
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry selected by `pattern` and return how many were removed.
    ///
    /// Computations of matching keys running concurrently will not store their results.
    pub fn invalidate(&self, pattern: &KeyPattern) -> usize {
        let removed = {
            let _gate = rw_write(&self.gate, SOURCE, "invalidate");
            self.mark_flights_stale(|key| pattern.matches(key));
            match pattern {
                KeyPattern::Exact(key) => usize::from(self.entries.remove(&**key).is_some()),
                KeyPattern::Prefix(prefix) => {
                    let mut removed = 0;
                    self.entries.retain(|key, _| {
                        let keep = !key.starts_with(&**prefix);
                        if !keep {
                            removed += 1;
                        }
                        keep
                    });
                    removed
                }
            }
        };

        counter!(METRIC_CACHE_INVALIDATED).increment(removed as u64);
        debug!(pattern = %pattern, removed, "Cache entries invalidated");
        removed
    }

    /// Remove every entry.
    pub fn clear_all(&self) -> usize {
        let removed = {
            let _gate = rw_write(&self.gate, SOURCE, "clear_all");
            self.mark_flights_stale(|_| true);
            let removed = self.entries.len();
            self.entries.clear();
            removed
        };

        counter!(METRIC_CACHE_INVALIDATED).increment(removed as u64);
        info!(removed, "Cache cleared");
        removed
    }

    /// Drop entries whose sliding window has elapsed and return how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut expired = 0;
        self.entries.retain(|_, entry| {
            let keep = !entry.is_expired(now);
            if !keep {
                expired += 1;
            }
            keep
        });

        if expired > 0 {
            counter!(METRIC_CACHE_EXPIRED).increment(expired as u64);
            debug!(expired, "Expired cache entries purged");
        }
        expired
    }

    fn lookup<V: Any + Send + Sync>(&self, key: &str) -> Option<Arc<V>> {
        let now = Instant::now();
        {
            let mut entry = self.entries.get_mut(key)?;
            if !entry.is_expired(now) {
                entry.last_access = now;
                return entry.value.clone().downcast::<V>().ok();
            }
        }

        if self
            .entries
            .remove_if(key, |_, entry| entry.is_expired(now))
            .is_some()
        {
            counter!(METRIC_CACHE_EXPIRED).increment(1);
            debug!(cache_key = key, "Cache entry expired");
        }
        None
    }

    fn join_flight<'a>(&'a self, key: &'a str) -> Flight<'a> {
        let state = mutex_lock(&self.flights, SOURCE, "join_flight")
            .entry(key.to_string())
            .or_default()
            .clone();
        Flight {
            store: self,
            key,
            state,
        }
    }

    /// Caller holds the gate exclusively.
    fn mark_flights_stale(&self, selects: impl Fn(&str) -> bool) {
        let flights = mutex_lock(&self.flights, SOURCE, "mark_flights_stale");
        for (key, state) in flights.iter() {
            if selects(key.as_str()) {
                state.mark_stale();
            }
        }
    }

    fn store_unless_stale<V: Any + Send + Sync>(
        &self,
        key: &CacheKey,
        state: &FlightState,
        value: Arc<V>,
    ) {
        let _gate = rw_read(&self.gate, SOURCE, "store");
        let mut slot = state.slot("store");
        if slot.stale {
            debug!(
                cache_key = %key,
                "Cache value computed across an invalidation, not stored"
            );
            return;
        }

        let shared: SharedValue = value.clone();
        slot.value = Some(shared);
        let window = self.config.sliding_expiration(region_of(key.as_str()));
        self.entries.insert(
            key.as_str().to_string(),
            Entry {
                value,
                window,
                last_access: Instant::now(),
            },
        );
    }

    #[cfg(test)]
    fn flight_count(&self) -> usize {
        mutex_lock(&self.flights, SOURCE, "flight_count").len()
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}
