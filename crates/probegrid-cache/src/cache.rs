//! Shared result cache with TTL expiry, capacity eviction, and statistics.
//!
//! `get` on an expired entry removes it and reports a miss. `set` at
//! capacity evicts the least recently accessed entry first. A background
//! sweeper ([`ResultCache::run_sweeper`]) proactively drops expired entries
//! whether or not they are read. `clear` also resets the hit/miss counters.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::table::{Lookup, LruTable};

const EVENT_CAPACITY: usize = 256;

/// Configuration for a [`ResultCache`].
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub max_size: usize,
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            max_size: 1000,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Notification published when entries leave the cache other than by
/// explicit invalidation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// Removed to make room for a new entry.
    Evicted { key: String },
    /// Removed because its TTL elapsed.
    Expired { key: String },
    /// The whole cache was cleared.
    Cleared { entries: usize },
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    /// Hits over lookups, 0.0 before the first lookup.
    pub hit_rate: f64,
}

struct State<V> {
    table: LruTable<V>,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

struct Inner<V> {
    config: CacheConfig,
    state: Mutex<State<V>>,
    events: broadcast::Sender<CacheEvent>,
}

/// Time-bounded cache keyed by target URL. Cheap to clone.
pub struct ResultCache<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for ResultCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Clone> ResultCache<V> {
    pub fn new(config: CacheConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    table: LruTable::new(config.max_size),
                    hits: 0,
                    misses: 0,
                    evictions: 0,
                    expirations: 0,
                }),
                config,
                events,
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Subscribe to eviction, expiry, and clear notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.events.subscribe()
    }

    /// Fetch a fresh entry, counting a hit or a miss.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut st = self.state();
        let lookup = st.table.get(key, Instant::now(), self.inner.config.ttl);
        match lookup {
            Lookup::Hit(value) => {
                st.hits += 1;
                debug!(key, hits = st.hits, "cache hit");
                Some(value)
            }
            Lookup::Miss => {
                st.misses += 1;
                None
            }
            Lookup::Expired => {
                st.misses += 1;
                st.expirations += 1;
                drop(st);
                debug!(key, "cache entry expired on read");
                self.publish(CacheEvent::Expired { key: key.to_string() });
                None
            }
        }
    }

    /// Store `value` under `key`, evicting the least recently accessed
    /// entry if the cache is full.
    pub fn set(&self, key: impl Into<String>, value: V) {
        let mut st = self.state();
        let evicted = st.table.insert(key.into(), value, Instant::now());
        if let Some(key) = evicted {
            st.evictions += 1;
            drop(st);
            debug!(key = %key, "cache entry evicted for capacity");
            self.publish(CacheEvent::Evicted { key });
        }
    }

    /// Remove `key` if present. Returns whether an entry was removed.
    pub fn invalidate(&self, key: &str) -> bool {
        self.state().table.remove(key)
    }

    /// Drop every entry and reset all counters.
    pub fn clear(&self) {
        let entries = {
            let mut st = self.state();
            st.hits = 0;
            st.misses = 0;
            st.evictions = 0;
            st.expirations = 0;
            st.table.clear()
        };
        info!(entries, "result cache cleared");
        self.publish(CacheEvent::Cleared { entries });
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let removed = {
            let mut st = self.state();
            let removed = st.table.remove_expired(Instant::now(), self.inner.config.ttl);
            st.expirations += removed.len() as u64;
            removed
        };
        let n = removed.len();
        if n > 0 {
            debug!(removed = n, "cache sweep");
        }
        for key in removed {
            self.publish(CacheEvent::Expired { key });
        }
        n
    }

    /// Sweep every `sweep_interval` until shutdown is signalled.
    pub async fn run_sweeper(&self, mut shutdown: watch::Receiver<bool>) {
        let period = self.inner.config.sweep_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep();
                }
                _ = shutdown.changed() => {
                    debug!("cache sweeper stopping");
                    break;
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.state().table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let st = self.state();
        let lookups = st.hits + st.misses;
        CacheStats {
            size: st.table.len(),
            capacity: st.table.capacity(),
            hits: st.hits,
            misses: st.misses,
            evictions: st.evictions,
            expirations: st.expirations,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                st.hits as f64 / lookups as f64
            },
        }
    }

    fn state(&self) -> MutexGuard<'_, State<V>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, event: CacheEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(max_size: usize) -> ResultCache<u32> {
        ResultCache::new(CacheConfig {
            max_size,
            ..Default::default()
        })
    }

    // ── TTL ──────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn entry_is_fresh_until_ttl() {
        let c = cache(10);
        c.set("t1", 7);

        tokio::time::advance(Duration::from_millis(299_999)).await;
        assert_eq!(c.get("t1"), Some(7));

        tokio::time::advance(Duration::from_millis(2)).await;
        assert_eq!(c.get("t1"), None);
        assert!(c.is_empty());

        let stats = c.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.expirations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn access_does_not_extend_ttl() {
        let c = cache(10);
        c.set("t1", 1);
        tokio::time::advance(Duration::from_secs(200)).await;
        assert_eq!(c.get("t1"), Some(1));
        tokio::time::advance(Duration::from_secs(100)).await;
        assert_eq!(c.get("t1"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn set_restarts_ttl() {
        let c = cache(10);
        c.set("t1", 1);
        tokio::time::advance(Duration::from_secs(200)).await;
        c.set("t1", 2);
        tokio::time::advance(Duration::from_secs(200)).await;
        assert_eq!(c.get("t1"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_on_read_is_published() {
        let c = cache(10);
        let mut events = c.subscribe();
        c.set("t1", 1);
        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(c.get("t1"), None);
        assert_eq!(
            events.try_recv().unwrap(),
            CacheEvent::Expired { key: "t1".into() }
        );
    }

    // ── Capacity ─────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn full_cache_evicts_oldest_access() {
        let c = cache(2);
        let mut events = c.subscribe();
        c.set("a", 1);
        c.set("b", 2);
        assert_eq!(c.get("a"), Some(1));
        c.set("c", 3);

        assert_eq!(c.get("b"), None);
        assert_eq!(c.get("a"), Some(1));
        assert_eq!(c.get("c"), Some(3));
        assert_eq!(c.stats().evictions, 1);
        assert_eq!(
            events.try_recv().unwrap(),
            CacheEvent::Evicted { key: "b".into() }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_removes_entry() {
        let c = cache(4);
        c.set("a", 1);
        assert!(c.invalidate("a"));
        assert!(!c.invalidate("a"));
        assert_eq!(c.get("a"), None);
    }

    // ── Sweep ────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_only_expired() {
        let c = cache(10);
        c.set("old", 1);
        tokio::time::advance(Duration::from_secs(250)).await;
        c.set("new", 2);
        tokio::time::advance(Duration::from_secs(60)).await;

        assert_eq!(c.sweep(), 1);
        assert_eq!(c.len(), 1);
        assert_eq!(c.get("new"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_runs_until_shutdown() {
        let c = cache(10);
        c.set("a", 1);
        let (tx, rx) = watch::channel(false);
        let sweeper = {
            let c = c.clone();
            tokio::spawn(async move { c.run_sweeper(rx).await })
        };

        // Ticks every 60s; the 300s tick is the first to find it expired.
        tokio::time::sleep(Duration::from_secs(361)).await;
        assert!(c.is_empty());
        assert_eq!(c.stats().expirations, 1);

        tx.send(true).unwrap();
        sweeper.await.unwrap();
    }

    // ── Clear and stats ──────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn clear_resets_counters() {
        let c = cache(10);
        let mut events = c.subscribe();
        c.set("a", 1);
        c.get("a");
        c.get("missing");
        assert_eq!(c.stats().hit_rate, 0.5);

        c.clear();
        let stats = c.stats();
        assert_eq!(stats.size, 0);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.hit_rate, 0.0);
        assert_eq!(events.try_recv().unwrap(), CacheEvent::Cleared { entries: 1 });
    }
}
