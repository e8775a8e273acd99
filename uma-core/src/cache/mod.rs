//! Namespaced TTL+LRU metrics cache.
//!
//! Collectors publish snapshots here; the read surface serves from here. The
//! hit path takes only the read lock: expiry is checked against `expires_at`
//! and access metadata lives in atomics. Expired entries are left in place
//! for the janitor sweep so `get` never needs the write lock.

pub mod invalidation;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::types::Namespace;

/// Point-in-time counters reported by [`MetricsCache::stats`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub max_entries: usize,
    pub evictions: u64,
    pub expired_removed: u64,
}

/// Metadata view of a live entry, used by invalidation strategies.
#[derive(Debug, Clone)]
pub struct EntryMeta {
    /// Key without the namespace prefix.
    pub key: String,
    /// Time since the entry was created.
    pub age: Duration,
}

struct Entry {
    value: Arc<Value>,
    created_at: Instant,
    created_unix: i64,
    expires_at: Instant,
    /// Milliseconds since the cache epoch; updated on every hit.
    last_access_ms: AtomicU64,
    access_count: AtomicU64,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

pub struct MetricsCache {
    entries: RwLock<HashMap<String, Entry>>,
    epoch: Instant,
    max_entries: usize,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired_removed: AtomicU64,
}

impl std::fmt::Debug for MetricsCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCache")
            .field("entries", &self.entries.read().len())
            .field("max_entries", &self.max_entries)
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

impl MetricsCache {
    pub fn new(max_entries: usize, default_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            epoch: Instant::now(),
            max_entries: max_entries.max(1),
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expired_removed: AtomicU64::new(0),
        }
    }

    pub fn from_settings(settings: &uma_config::CacheSettings) -> Self {
        Self::new(
            settings.max_entries,
            Duration::from_secs(settings.default_ttl_secs),
        )
    }

    fn full_key(namespace: Namespace, key: &str) -> String {
        format!("{namespace}:{key}")
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Fetch the live value for `(namespace, key)`.
    ///
    /// Expired entries count as misses and are left for the janitor.
    pub fn get(&self, namespace: Namespace, key: &str) -> Option<Arc<Value>> {
        self.get_with_meta(namespace, key).map(|(value, _)| value)
    }

    /// Like [`get`](Self::get) but also returns the entry's creation time as
    /// epoch seconds, for `last_updated` response fields.
    pub fn get_with_meta(
        &self,
        namespace: Namespace,
        key: &str,
    ) -> Option<(Arc<Value>, i64)> {
        let full = Self::full_key(namespace, key);
        let now = Instant::now();
        let entries = self.entries.read();

        match entries.get(&full) {
            Some(entry) if entry.is_live(now) => {
                entry.access_count.fetch_add(1, Ordering::Relaxed);
                entry.last_access_ms.store(self.now_ms(), Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some((entry.value.clone(), entry.created_unix))
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store with the default TTL.
    pub fn set(&self, namespace: Namespace, key: &str, value: Value) {
        self.set_with_ttl(namespace, key, value, self.default_ttl);
    }

    /// Store with an explicit TTL, LRU-evicting one entry first if the cache
    /// is at capacity and the key is new.
    pub fn set_with_ttl(
        &self,
        namespace: Namespace,
        key: &str,
        value: Value,
        ttl: Duration,
    ) {
        let full = Self::full_key(namespace, key);
        let now = Instant::now();
        let mut entries = self.entries.write();

        if !entries.contains_key(&full) && entries.len() >= self.max_entries {
            if let Some(victim) = Self::lru_victim(&entries) {
                entries.remove(&victim);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(key = %victim, "evicted least-recently-used cache entry");
            }
        }

        entries.insert(
            full,
            Entry {
                value: Arc::new(value),
                created_at: now,
                created_unix: chrono::Utc::now().timestamp(),
                expires_at: now + ttl,
                last_access_ms: AtomicU64::new(self.now_ms()),
                access_count: AtomicU64::new(0),
            },
        );
    }

    /// Pick the eviction victim: smallest `(last_access, access_count, key)`.
    fn lru_victim(entries: &HashMap<String, Entry>) -> Option<String> {
        entries
            .iter()
            .min_by(|(ka, a), (kb, b)| {
                a.last_access_ms
                    .load(Ordering::Relaxed)
                    .cmp(&b.last_access_ms.load(Ordering::Relaxed))
                    .then_with(|| {
                        a.access_count
                            .load(Ordering::Relaxed)
                            .cmp(&b.access_count.load(Ordering::Relaxed))
                    })
                    .then_with(|| ka.cmp(kb))
            })
            .map(|(key, _)| key.clone())
    }

    pub fn delete(&self, namespace: Namespace, key: &str) -> bool {
        let full = Self::full_key(namespace, key);
        self.entries.write().remove(&full).is_some()
    }

    /// Delete several keys of one namespace in a single write-locked pass.
    pub fn delete_many(&self, namespace: Namespace, keys: &[String]) -> usize {
        let mut entries = self.entries.write();
        keys.iter()
            .filter(|key| {
                entries.remove(&Self::full_key(namespace, key)).is_some()
            })
            .count()
    }

    /// Remove everything, or everything under one namespace.
    pub fn clear(&self, namespace: Option<Namespace>) {
        let mut entries = self.entries.write();
        match namespace {
            Some(ns) => {
                let prefix = format!("{ns}:");
                entries.retain(|key, _| !key.starts_with(&prefix));
            }
            None => entries.clear(),
        }
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            entries: self.entries.read().len(),
            hits,
            misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            max_entries: self.max_entries,
            evictions: self.evictions.load(Ordering::Relaxed),
            expired_removed: self.expired_removed.load(Ordering::Relaxed),
        }
    }

    /// One write-locked pass deleting every expired entry. Returns the count.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        let removed = before - entries.len();
        if removed > 0 {
            self.expired_removed
                .fetch_add(removed as u64, Ordering::Relaxed);
        }
        removed
    }

    /// Metadata for every live entry of a namespace, for the invalidation
    /// router.
    pub fn live_entries(&self, namespace: Namespace) -> Vec<EntryMeta> {
        let prefix = format!("{namespace}:");
        let now = Instant::now();
        self.entries
            .read()
            .iter()
            .filter(|(key, entry)| key.starts_with(&prefix) && entry.is_live(now))
            .map(|(key, entry)| EntryMeta {
                key: key[prefix.len()..].to_string(),
                age: now.duration_since(entry.created_at),
            })
            .collect()
    }

    /// How long ago the key was last read, if it exists. Used by the adaptive
    /// scheduler as its activity signal.
    pub fn last_access_age(
        &self,
        namespace: Namespace,
        key: &str,
    ) -> Option<Duration> {
        let full = Self::full_key(namespace, key);
        let entries = self.entries.read();
        let entry = entries.get(&full)?;
        let accessed_ms = entry.last_access_ms.load(Ordering::Relaxed);
        Some(Duration::from_millis(
            self.now_ms().saturating_sub(accessed_ms),
        ))
    }
}

/// Periodic expired-entry sweep. One writer; wakes at `interval`, holds the
/// write lock for a single pass.
pub fn spawn_janitor(
    cache: Arc<MetricsCache>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so startup stays quiet.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("cache janitor stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let removed = cache.sweep_expired();
                    if removed > 0 {
                        debug!(removed, "cache janitor removed expired entries");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn cache(max: usize) -> MetricsCache {
        MetricsCache::new(max, Duration::from_secs(60))
    }

    #[test]
    fn set_then_get_within_ttl() {
        let c = cache(16);
        c.set(Namespace::System, "metrics", json!({"cpu": 1}));
        let got = c.get(Namespace::System, "metrics").unwrap();
        assert_eq!(got.as_ref(), &json!({"cpu": 1}));
    }

    #[test]
    fn expired_entry_reads_absent_and_janitor_removes_it() {
        let c = cache(16);
        c.set_with_ttl(
            Namespace::System,
            "x",
            json!("v"),
            Duration::from_millis(100),
        );
        std::thread::sleep(Duration::from_millis(150));

        assert!(c.get(Namespace::System, "x").is_none());
        // Entry is still physically present until the janitor runs.
        assert_eq!(c.stats().entries, 1);
        assert_eq!(c.sweep_expired(), 1);
        assert_eq!(c.stats().entries, 0);
    }

    #[test]
    fn delete_then_get_is_absent() {
        let c = cache(16);
        c.set(Namespace::Docker, "container_list", json!([]));
        assert!(c.delete(Namespace::Docker, "container_list"));
        assert!(c.get(Namespace::Docker, "container_list").is_none());
    }

    #[test]
    fn lru_evicts_least_recently_accessed() {
        let c = cache(3);
        c.set(Namespace::General, "a", json!(1));
        c.set(Namespace::General, "b", json!(2));
        c.set(Namespace::General, "c", json!(3));

        // Touch `a` so `b` becomes the coldest entry.
        std::thread::sleep(Duration::from_millis(5));
        assert!(c.get(Namespace::General, "a").is_some());

        c.set(Namespace::General, "d", json!(4));

        assert!(c.get(Namespace::General, "b").is_none());
        assert!(c.get(Namespace::General, "a").is_some());
        assert!(c.get(Namespace::General, "c").is_some());
        assert!(c.get(Namespace::General, "d").is_some());
        assert_eq!(c.stats().evictions, 1);
    }

    #[test]
    fn lru_tiebreak_falls_back_to_access_count_then_key() {
        let c = cache(2);
        c.set(Namespace::General, "a", json!(1));
        c.set(Namespace::General, "b", json!(2));

        // Same access instant resolution is possible; hit counts split the
        // tie, then lexicographic key order.
        std::thread::sleep(Duration::from_millis(5));
        assert!(c.get(Namespace::General, "a").is_some());
        assert!(c.get(Namespace::General, "b").is_some());
        assert!(c.get(Namespace::General, "b").is_some());

        c.set(Namespace::General, "z", json!(3));
        assert!(c.get(Namespace::General, "a").is_none());
        assert!(c.get(Namespace::General, "b").is_some());
    }

    #[test]
    fn overwriting_existing_key_does_not_evict() {
        let c = cache(2);
        c.set(Namespace::General, "a", json!(1));
        c.set(Namespace::General, "b", json!(2));
        c.set(Namespace::General, "a", json!(10));

        assert_eq!(c.stats().evictions, 0);
        assert_eq!(
            c.get(Namespace::General, "a").unwrap().as_ref(),
            &json!(10)
        );
        assert!(c.get(Namespace::General, "b").is_some());
    }

    #[test]
    fn clear_namespace_leaves_other_namespaces() {
        let c = cache(16);
        c.set(Namespace::Smart, "disk_sda", json!({}));
        c.set(Namespace::Smart, "disk_sdb", json!({}));
        c.set(Namespace::Sensor, "sensors", json!({}));

        c.clear(Some(Namespace::Smart));

        assert!(c.get(Namespace::Smart, "disk_sda").is_none());
        assert!(c.get(Namespace::Smart, "disk_sdb").is_none());
        assert!(c.get(Namespace::Sensor, "sensors").is_some());
    }

    #[test]
    fn stats_track_hits_and_misses() {
        let c = cache(16);
        c.set(Namespace::System, "metrics", json!(1));
        c.get(Namespace::System, "metrics");
        c.get(Namespace::System, "metrics");
        c.get(Namespace::System, "missing");

        let stats = c.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 2.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn last_access_age_reflects_reads() {
        let c = cache(16);
        c.set(Namespace::System, "metrics", json!(1));
        std::thread::sleep(Duration::from_millis(20));
        assert!(
            c.last_access_age(Namespace::System, "metrics").unwrap()
                >= Duration::from_millis(15)
        );

        c.get(Namespace::System, "metrics");
        assert!(
            c.last_access_age(Namespace::System, "metrics").unwrap()
                < Duration::from_millis(15)
        );
    }

    #[tokio::test]
    async fn janitor_sweeps_on_interval() {
        let c = Arc::new(cache(16));
        c.set_with_ttl(
            Namespace::System,
            "x",
            json!(1),
            Duration::from_millis(10),
        );

        let shutdown = CancellationToken::new();
        let handle = spawn_janitor(
            c.clone(),
            Duration::from_millis(50),
            shutdown.clone(),
        );

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(c.stats().entries, 0);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
