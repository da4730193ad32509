use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use dashmap::{DashMap, mapref::entry::Entry};

/// Mutations between opportunistic sweeps of expired entries.
const PURGE_EVERY_MUTATIONS: u64 = 256;

/// Integer counters with optional expiry.
///
/// Missing and expired keys read as `0`. Every mutation is atomic with
/// respect to other mutations of the same key. `ttl` is applied when a key
/// is created (or recreated after expiry); updating a live key keeps its
/// original deadline.
pub trait AccountingStore: Send + Sync {
    fn get(&self, key: &str) -> i64;

    /// Overwrite `key`, resetting its deadline.
    fn set(&self, key: &str, value: i64, ttl: Option<Duration>);

    /// Add `delta` and return the new value.
    fn incr(&self, key: &str, delta: i64, ttl: Option<Duration>) -> i64;

    /// Subtract `delta` and return the new value. Never goes below zero; a
    /// key that reaches zero is dropped, so its next use starts a fresh TTL.
    fn decr(&self, key: &str, delta: i64) -> i64;

    /// Increment by one only if the current value is below `limit`.
    ///
    /// Returns the new value, or `None` when the key is already at or above
    /// `limit`, in which case nothing changes.
    fn try_incr_below(&self, key: &str, limit: i64, ttl: Option<Duration>) -> Option<i64>;

    /// Drop expired entries, returning how many were removed.
    fn purge_expired(&self) -> usize;
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    value: i64,
    expires_at: Option<Instant>,
}

impl Counter {
    fn fresh(value: i64, ttl: Option<Duration>, now: Instant) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| now + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process [`AccountingStore`] on a sharded concurrent map.
///
/// Nothing survives a restart.
#[derive(Clone, Default)]
pub struct MemoryStore {
    counters: Arc<DashMap<String, Counter>>,
    mutations: Arc<AtomicU64>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently held, expired or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    fn get_at(&self, key: &str, now: Instant) -> i64 {
        self.counters
            .get(key)
            .filter(|c| !c.is_expired(now))
            .map_or(0, |c| c.value)
    }

    fn update_at(
        &self,
        key: &str,
        ttl: Option<Duration>,
        now: Instant,
        apply: impl FnOnce(i64) -> Option<i64>,
    ) -> Option<i64> {
        let result = match self.counters.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let counter = occupied.get_mut();
                if counter.is_expired(now) {
                    let next = apply(0)?;
                    *counter = Counter::fresh(next, ttl, now);
                    Some(next)
                } else {
                    let next = apply(counter.value)?;
                    counter.value = next;
                    Some(next)
                }
            },
            Entry::Vacant(vacant) => {
                let next = apply(0)?;
                vacant.insert(Counter::fresh(next, ttl, now));
                Some(next)
            },
        };
        self.purge_if_needed(now);
        result
    }

    fn purge_at(&self, now: Instant) -> usize {
        let before = self.counters.len();
        self.counters.retain(|_, c| !c.is_expired(now));
        before.saturating_sub(self.counters.len())
    }

    fn purge_if_needed(&self, now: Instant) {
        let seen = self.mutations.fetch_add(1, Ordering::Relaxed) + 1;
        if seen.is_multiple_of(PURGE_EVERY_MUTATIONS) {
            self.purge_at(now);
        }
    }
}

impl AccountingStore for MemoryStore {
    fn get(&self, key: &str) -> i64 {
        self.get_at(key, Instant::now())
    }

    fn set(&self, key: &str, value: i64, ttl: Option<Duration>) {
        let now = Instant::now();
        self.counters
            .insert(key.to_string(), Counter::fresh(value, ttl, now));
        self.purge_if_needed(now);
    }

    fn incr(&self, key: &str, delta: i64, ttl: Option<Duration>) -> i64 {
        self.update_at(key, ttl, Instant::now(), |v| Some(v.saturating_add(delta)))
            .unwrap_or_default()
    }

    fn decr(&self, key: &str, delta: i64) -> i64 {
        if !self.counters.contains_key(key) {
            return 0;
        }
        let left = self
            .update_at(key, None, Instant::now(), |v| {
                Some(v.saturating_sub(delta).max(0))
            })
            .unwrap_or_default();
        if left == 0 {
            self.counters.remove_if(key, |_, c| c.value == 0);
        }
        left
    }

    fn try_incr_below(&self, key: &str, limit: i64, ttl: Option<Duration>) -> Option<i64> {
        self.update_at(key, ttl, Instant::now(), |v| (v < limit).then_some(v + 1))
    }

    fn purge_expired(&self) -> usize {
        self.purge_at(Instant::now())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(10);

    #[test]
    fn missing_key_reads_zero() {
        let store = MemoryStore::new();
        assert_eq!(store.get("nope"), 0);
    }

    #[test]
    fn incr_and_decr_round_trip() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("k", 3, None), 3);
        assert_eq!(store.incr("k", 2, None), 5);
        assert_eq!(store.decr("k", 4), 1);
        assert_eq!(store.get("k"), 1);
    }

    #[test]
    fn decr_floors_at_zero() {
        let store = MemoryStore::new();
        assert_eq!(store.decr("k", 1), 0);
        store.set("k", 2, None);
        assert_eq!(store.decr("k", 5), 0);
    }

    #[test]
    fn decr_to_zero_drops_the_deadline() {
        let store = MemoryStore::new();
        store.incr("k", 1, Some(TTL));
        assert_eq!(store.decr("k", 1), 0);
        assert!(store.is_empty());
        assert_eq!(store.decr("missing", 1), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn try_incr_below_stops_at_limit() {
        let store = MemoryStore::new();
        assert_eq!(store.try_incr_below("k", 2, None), Some(1));
        assert_eq!(store.try_incr_below("k", 2, None), Some(2));
        assert_eq!(store.try_incr_below("k", 2, None), None);
        assert_eq!(store.get("k"), 2);
    }

    #[test]
    fn zero_limit_never_admits() {
        let store = MemoryStore::new();
        assert_eq!(store.try_incr_below("k", 0, None), None);
        assert_eq!(store.get("k"), 0);
    }

    #[test]
    fn expired_entries_read_zero_and_restart() {
        let store = MemoryStore::new();
        let start = Instant::now();
        store.update_at("k", Some(TTL), start, |v| Some(v + 4));
        assert_eq!(store.get_at("k", start + Duration::from_secs(5)), 4);

        let later = start + TTL + Duration::from_secs(1);
        assert_eq!(store.get_at("k", later), 0);
        assert_eq!(store.update_at("k", Some(TTL), later, |v| Some(v + 1)), Some(1));
    }

    #[test]
    fn live_update_keeps_original_deadline() {
        let store = MemoryStore::new();
        let start = Instant::now();
        store.update_at("k", Some(TTL), start, |v| Some(v + 1));
        store.update_at("k", Some(TTL), start + Duration::from_secs(9), |v| Some(v + 1));
        assert_eq!(store.get_at("k", start + Duration::from_secs(11)), 0);
    }

    #[test]
    fn purge_removes_only_expired() {
        let store = MemoryStore::new();
        let start = Instant::now();
        store.update_at("short", Some(TTL), start, |_| Some(1));
        store.update_at("forever", None, start, |_| Some(1));
        assert_eq!(store.purge_at(start + TTL * 2), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("forever"), 1);
    }

    #[test]
    fn concurrent_admission_never_exceeds_limit() {
        let store = MemoryStore::new();
        let admitted = AtomicU64::new(0);
        std::thread::scope(|s| {
            for _ in 0..16 {
                s.spawn(|| {
                    for _ in 0..100 {
                        if store.try_incr_below("jobs", 5, None).is_some() {
                            admitted.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        });
        assert_eq!(admitted.load(Ordering::Relaxed), 5);
        assert_eq!(store.get("jobs"), 5);
    }

    #[test]
    fn concurrent_incr_is_lossless() {
        let store = MemoryStore::new();
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..250 {
                        store.incr("n", 1, None);
                    }
                });
            }
        });
        assert_eq!(store.get("n"), 2000);
    }
}
