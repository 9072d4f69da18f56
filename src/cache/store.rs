//! Entry Store: a single-tier, in-process key/value container.
//!
//! # Design
//!
//! - Keys hash onto a fixed set of shards, each behind its own `RwLock`, so
//!   operations on different keys rarely contend
//! - A hit takes only a read lock; recency/frequency are atomics on the entry
//! - Eviction runs synchronously inside `set`: one victim per entry inserted
//!   past `max_size`, chosen across all shards by the store's [`Evictor`]
//! - Expiry is lazy (on read) with an optional eager sweep via [`EntryStore::purge_expired`]

use std::collections::HashMap;
use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::RwLock;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, trace};

use crate::cache::entry::{CacheEntry, EntryInfo};
use crate::cache::evictor::{EvictionPolicy, Evictor};
use crate::error::{CacheError, Result};

/// Why an entry left the store without an explicit delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalCause {
    /// Chosen by the eviction policy.
    Evicted,
    /// Found past its TTL.
    Expired,
}

/// Callback invoked after an entry is evicted or purged.
pub type RemovalListener = Arc<dyn Fn(&str, RemovalCause) + Send + Sync>;

/// Store settings.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Maximum number of entries.
    pub max_size: usize,

    /// TTL used when `set` is given none.
    pub default_ttl: Option<Duration>,

    pub eviction_policy: EvictionPolicy,

    /// Largest accepted payload in bytes.
    pub max_entry_bytes: usize,

    /// Number of lock shards.
    pub shards: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            default_ttl: None,
            eviction_policy: EvictionPolicy::Lru,
            max_entry_bytes: 16 * 1024 * 1024,
            shards: 16,
        }
    }
}

/// Point-in-time statistics for one cache or store.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub size: usize,
    pub max_size: usize,
    pub evictions: u64,
}

impl CacheStats {
    /// `hits / (hits + misses)`, 0 when there were no lookups.
    pub fn rate(hits: u64, misses: u64) -> f64 {
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

type Shard = RwLock<HashMap<String, CacheEntry>>;

/// Sharded in-process store with TTL and a size-bound eviction policy.
pub struct EntryStore {
    name: String,
    shards: Box<[Shard]>,
    hasher: RandomState,
    evictor: Evictor,
    config: StoreConfig,

    /// Logical clock for insertion and access order.
    clock: AtomicU64,

    len: AtomicUsize,
    bytes: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,

    listener: Option<RemovalListener>,
}

impl std::fmt::Debug for EntryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryStore")
            .field("name", &self.name)
            .field("len", &self.len())
            .field("config", &self.config)
            .finish()
    }
}

impl EntryStore {
    /// Create a store. `max_size` and `shards` must be non-zero.
    pub fn new(name: impl Into<String>, config: StoreConfig) -> Result<Self> {
        let name = name.into();
        if config.max_size == 0 {
            return Err(CacheError::InvalidConfiguration(format!(
                "store {name}: max_size must be at least 1"
            )));
        }
        if config.shards == 0 {
            return Err(CacheError::InvalidConfiguration(format!(
                "store {name}: shards must be at least 1"
            )));
        }

        let shards = (0..config.shards)
            .map(|_| RwLock::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            name,
            shards,
            hasher: RandomState::new(),
            evictor: Evictor::new(config.eviction_policy),
            config,
            clock: AtomicU64::new(1),
            len: AtomicUsize::new(0),
            bytes: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            listener: None,
        })
    }

    /// Register a callback for evictions and expirations.
    pub fn with_removal_listener(mut self, listener: RemovalListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn shard(&self, key: &str) -> &Shard {
        let idx = (self.hasher.hash_one(key) as usize) % self.shards.len();
        &self.shards[idx]
    }

    fn notify(&self, key: &str, cause: RemovalCause) {
        if let Some(listener) = &self.listener {
            listener(key, cause);
        }
    }

    /// Account for an entry that was removed from a shard.
    fn forget(&self, entry: &CacheEntry) {
        self.len.fetch_sub(1, Ordering::Relaxed);
        self.bytes.fetch_sub(entry.size_estimate, Ordering::Relaxed);
    }

    /// Remove `key` if it is still the same expired entry.
    fn remove_expired(&self, key: &str, insert_seq: u64) {
        let removed = {
            let mut shard = self.shard(key).write();
            match shard.get(key) {
                Some(e) if e.insert_seq == insert_seq && e.is_expired() => shard.remove(key),
                _ => None,
            }
        };
        if let Some(entry) = removed {
            self.forget(&entry);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            trace!(cache = %self.name, key, "Expired entry purged on read");
            self.notify(key, RemovalCause::Expired);
        }
    }

    /// Look up a live value, counting a hit or miss.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.get_with_ttl(key).map(|(value, _)| value)
    }

    /// Like [`EntryStore::get`], also returning the time left before expiry.
    pub fn get_with_ttl(&self, key: &str) -> Option<(Bytes, Option<Duration>)> {
        let expired_seq = {
            let shard = self.shard(key).read();
            match shard.get(key) {
                Some(entry) if !entry.is_expired() => {
                    entry.record_access(self.tick());
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some((entry.value.clone(), entry.ttl_remaining()));
                }
                Some(entry) => Some(entry.insert_seq),
                None => None,
            }
        };

        if let Some(seq) = expired_seq {
            self.remove_expired(key, seq);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Read a live value without touching statistics or recency.
    pub fn peek(&self, key: &str) -> Option<Bytes> {
        let shard = self.shard(key).read();
        shard
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.value.clone())
    }

    /// Whether a live entry exists. Not counted as an access.
    pub fn has(&self, key: &str) -> bool {
        let shard = self.shard(key).read();
        shard.get(key).is_some_and(|entry| !entry.is_expired())
    }

    /// Metadata of a live entry.
    pub fn entry_info(&self, key: &str) -> Option<EntryInfo> {
        let shard = self.shard(key).read();
        shard
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(CacheEntry::info)
    }

    /// Insert or replace `key`.
    ///
    /// `ttl` of `None` falls back to the store default; a zero TTL means no expiry.
    /// Fails with `Serialization` when the payload exceeds `max_entry_bytes`.
    pub fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        if value.len() > self.config.max_entry_bytes {
            return Err(CacheError::Serialization(format!(
                "payload for {key} is {} bytes, limit is {}",
                value.len(),
                self.config.max_entry_bytes
            )));
        }

        let ttl = ttl
            .or(self.config.default_ttl)
            .filter(|ttl| !ttl.is_zero());
        let entry = CacheEntry::new(key.to_string(), value, ttl, self.tick());
        let size = entry.size_estimate;

        let previous = self.shard(key).write().insert(key.to_string(), entry);
        self.bytes.fetch_add(size, Ordering::Relaxed);
        match previous {
            Some(old) => {
                self.bytes.fetch_sub(old.size_estimate, Ordering::Relaxed);
                Ok(())
            }
            None => {
                self.len.fetch_add(1, Ordering::Relaxed);
                self.enforce_capacity(key)
            }
        }
    }

    /// Evict until the store is back within `max_size`, never touching `inserted`.
    fn enforce_capacity(&self, inserted: &str) -> Result<()> {
        while self.len.load(Ordering::Relaxed) > self.config.max_size {
            if !self.evict_one(&[inserted]) {
                // Nothing else to evict: undo the insert rather than exceed the bound.
                if let Some(entry) = self.shard(inserted).write().remove(inserted) {
                    self.forget(&entry);
                }
                return Err(CacheError::CapacityExceeded {
                    cache: self.name.clone(),
                    max_size: self.config.max_size,
                });
            }
        }
        Ok(())
    }

    /// Evict the highest-priority entry across all shards.
    ///
    /// Returns false when no candidate exists.
    fn evict_one(&self, protected: &[&str]) -> bool {
        loop {
            let victim = self
                .shards
                .iter()
                .filter_map(|shard| {
                    let guard = shard.read();
                    self.evictor.select_victim(guard.values(), protected)
                })
                .max();

            let Some(victim) = victim else {
                return false;
            };

            // The victim may have been replaced or removed since the scan.
            let removed = {
                let mut shard = self.shard(&victim.key).write();
                match shard.get(&victim.key) {
                    Some(e) if e.insert_seq == victim.insert_seq => shard.remove(&victim.key),
                    _ => None,
                }
            };

            if let Some(entry) = removed {
                self.forget(&entry);
                let cause = if victim.expired {
                    self.expirations.fetch_add(1, Ordering::Relaxed);
                    RemovalCause::Expired
                } else {
                    RemovalCause::Evicted
                };
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(
                    cache = %self.name,
                    key = %victim.key,
                    policy = %self.evictor.policy(),
                    expired = victim.expired,
                    "Evicted entry"
                );
                self.notify(&victim.key, cause);
                return true;
            }
        }
    }

    /// Reset the TTL of a live entry. Returns false when absent.
    pub fn touch(&self, key: &str, ttl: Option<Duration>) -> bool {
        let ttl = ttl
            .or(self.config.default_ttl)
            .filter(|ttl| !ttl.is_zero());
        let mut shard = self.shard(key).write();
        match shard.get_mut(key) {
            Some(entry) if !entry.is_expired() => {
                entry.expires_at = ttl.and_then(|ttl| Instant::now().checked_add(ttl));
                true
            }
            _ => false,
        }
    }

    /// Remove `key`. Returns whether a live entry was removed.
    pub fn delete(&self, key: &str) -> bool {
        let removed = self.shard(key).write().remove(key);
        match removed {
            Some(entry) => {
                self.forget(&entry);
                !entry.is_expired()
            }
            None => false,
        }
    }

    /// Remove every live entry whose key matches; returns the removed keys.
    pub fn remove_matching(&self, pattern: &Regex) -> Vec<String> {
        let mut removed = Vec::new();
        for shard in self.shards.iter() {
            let mut guard = shard.write();
            let keys: Vec<String> = guard
                .keys()
                .filter(|key| pattern.is_match(key))
                .cloned()
                .collect();
            for key in keys {
                if let Some(entry) = guard.remove(&key) {
                    self.forget(&entry);
                    if !entry.is_expired() {
                        removed.push(key);
                    }
                }
            }
        }
        removed
    }

    /// Live keys, in no particular order.
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        self.shards
            .iter()
            .flat_map(|shard| {
                shard
                    .read()
                    .values()
                    .filter(|entry| !entry.is_expired_at(now))
                    .map(|entry| entry.key.clone())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Drop every entry. Statistics are kept.
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            let mut guard = shard.write();
            for entry in guard.values() {
                self.forget(entry);
            }
            guard.clear();
        }
    }

    /// Eagerly remove expired entries; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut purged = Vec::new();
        for shard in self.shards.iter() {
            let mut guard = shard.write();
            guard.retain(|key, entry| {
                if entry.is_expired_at(now) {
                    purged.push((key.clone(), entry.size_estimate));
                    false
                } else {
                    true
                }
            });
        }

        for (key, size) in &purged {
            self.len.fetch_sub(1, Ordering::Relaxed);
            self.bytes.fetch_sub(*size, Ordering::Relaxed);
            self.notify(key, RemovalCause::Expired);
        }
        self.expirations
            .fetch_add(purged.len() as u64, Ordering::Relaxed);
        if !purged.is_empty() {
            debug!(cache = %self.name, purged = purged.len(), "Purged expired entries");
        }
        purged.len()
    }

    /// Number of physically present entries (expired ones until purged).
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of entry size estimates in bytes.
    pub fn memory_usage(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn expirations(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        CacheStats {
            hits,
            misses,
            hit_rate: CacheStats::rate(hits, misses),
            size: self.len(),
            max_size: self.config.max_size,
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn store(max_size: usize, policy: EvictionPolicy) -> EntryStore {
        EntryStore::new(
            "test",
            StoreConfig {
                max_size,
                eviction_policy: policy,
                shards: 4,
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn b(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    #[test]
    fn test_set_then_get() {
        let store = store(10, EvictionPolicy::Lru);
        store.set("k", b("v"), None).unwrap();
        assert_eq!(store.get("k"), Some(b("v")));
        assert_eq!(store.get("missing"), None);

        let stats = store.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate, 0.5);
        assert_eq!(stats.size, 1);
    }

    #[test]
    fn test_overwrite_keeps_size() {
        let store = store(10, EvictionPolicy::Lru);
        store.set("k", b("v1"), None).unwrap();
        store.set("k", b("v2"), None).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.peek("k"), Some(b("v2")));
    }

    #[test]
    fn test_lru_eviction() {
        let store = store(3, EvictionPolicy::Lru);
        store.set("a", b("1"), None).unwrap();
        store.set("b", b("2"), None).unwrap();
        store.set("c", b("3"), None).unwrap();
        assert!(store.get("a").is_some());
        store.set("d", b("4"), None).unwrap();

        assert!(store.has("a"));
        assert!(!store.has("b"));
        assert!(store.has("c"));
        assert!(store.has("d"));
        assert_eq!(store.stats().evictions, 1);
    }

    #[test]
    fn test_lfu_eviction() {
        let store = store(2, EvictionPolicy::Lfu);
        store.set("a", b("1"), None).unwrap();
        store.set("b", b("2"), None).unwrap();
        store.get("a");
        store.get("a");
        store.get("b");
        store.set("c", b("3"), None).unwrap();

        assert!(store.has("a"));
        assert!(!store.has("b"));
    }

    #[test]
    fn test_fifo_eviction() {
        let store = store(2, EvictionPolicy::Fifo);
        store.set("a", b("1"), None).unwrap();
        store.set("b", b("2"), None).unwrap();
        store.get("a");
        store.set("c", b("3"), None).unwrap();

        assert!(!store.has("a"));
        assert!(store.has("b"));
        assert!(store.has("c"));
    }

    #[test]
    fn test_expired_preferred_over_policy() {
        let store = store(2, EvictionPolicy::Fifo);
        store.set("old", b("1"), None).unwrap();
        store
            .set("short", b("2"), Some(Duration::from_millis(1)))
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));
        store.set("new", b("3"), None).unwrap();

        assert!(store.has("old"));
        assert!(store.has("new"));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_ttl_expiry_is_lazy_but_unreadable() {
        let store = store(10, EvictionPolicy::Lru);
        store
            .set("x", b("1"), Some(Duration::from_millis(10)))
            .unwrap();
        assert!(store.has("x"));
        std::thread::sleep(Duration::from_millis(20));

        assert!(!store.has("x"));
        assert_eq!(store.peek("x"), None);
        assert_eq!(store.get("x"), None);
        assert_eq!(store.len(), 0);
        assert_eq!(store.expirations(), 1);
    }

    #[test]
    fn test_payload_limit() {
        let store = EntryStore::new(
            "small",
            StoreConfig {
                max_entry_bytes: 4,
                ..Default::default()
            },
        )
        .unwrap();
        let err = store.set("k", Bytes::from(vec![0u8; 5]), None).unwrap_err();
        assert!(matches!(err, CacheError::Serialization(_)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_remove_matching_and_keys() {
        let store = store(10, EvictionPolicy::Lru);
        for key in ["bill:1", "bill:2", "user:1"] {
            store.set(key, b("v"), None).unwrap();
        }
        let re = Regex::new("^bill:.*$").unwrap();
        let mut removed = store.remove_matching(&re);
        removed.sort();
        assert_eq!(removed, vec!["bill:1", "bill:2"]);
        assert_eq!(store.keys(), vec!["user:1".to_string()]);
    }

    #[test]
    fn test_purge_notifies_listener() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let store = store(10, EvictionPolicy::Lru).with_removal_listener(Arc::new(
            move |key: &str, cause: RemovalCause| sink.lock().unwrap().push((key.to_string(), cause)),
        ));
        store
            .set("gone", b("1"), Some(Duration::from_millis(1)))
            .unwrap();
        store.set("kept", b("2"), None).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("gone".to_string(), RemovalCause::Expired)]
        );
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_touch_refreshes_ttl() {
        let store = store(10, EvictionPolicy::Lru);
        store
            .set("k", b("v"), Some(Duration::from_millis(30)))
            .unwrap();
        assert!(store.touch("k", Some(Duration::from_secs(60))));
        std::thread::sleep(Duration::from_millis(40));
        assert!(store.has("k"));
        assert!(!store.touch("missing", None));
    }

    #[test]
    fn test_unrepresentable_ttl_never_expires() {
        let store = store(10, EvictionPolicy::Lru);
        store.set("k", b("v"), Some(Duration::MAX)).unwrap();
        assert_eq!(store.get_with_ttl("k"), Some((b("v"), None)));
        assert!(store.touch("k", Some(Duration::MAX)));
        assert!(store.has("k"));
    }

    #[test]
    fn test_get_with_ttl_reports_remaining() {
        let store = store(10, EvictionPolicy::Lru);
        store.set("k", b("v"), Some(Duration::from_secs(5))).unwrap();
        let (value, ttl) = store.get_with_ttl("k").unwrap();
        assert_eq!(value, b("v"));
        assert!(ttl.unwrap() <= Duration::from_secs(5));
        assert_eq!(store.stats().hits, 1);
    }

    #[test]
    fn test_clear_resets_size_and_memory() {
        let store = store(10, EvictionPolicy::Lru);
        store.set("a", b("1"), None).unwrap();
        store.set("b", b("2"), None).unwrap();
        assert!(store.memory_usage() > 0);
        store.clear();
        assert_eq!(store.len(), 0);
        assert_eq!(store.memory_usage(), 0);
    }

    #[test]
    fn test_zero_sized_store_rejected() {
        let err = EntryStore::new(
            "bad",
            StoreConfig {
                max_size: 0,
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, CacheError::InvalidConfiguration(_)));
    }
}
