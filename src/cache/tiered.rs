//! Tier coordinator: orchestrates reads and writes across an ordered set of tiers.
//!
//! Tiers are ordered nearest (in-process) to farthest (remote). The coordinator:
//! - probes tiers near-to-far and promotes hits into nearer tiers
//! - writes through to every tier selected by the write policy
//! - degrades to local-only operation when the remote tier fails
//! - rejects layouts that cannot support `delete_pattern` at construction time

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::codec::{Codec, CodecConfig};
use crate::cache::pattern::glob_to_regex;
use crate::cache::store::{CacheStats, EntryStore, RemovalListener, StoreConfig};
use crate::cache::traits::{Cache, EnhancedCache};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::remote::adapter::RemoteStore;
use crate::remote::tier::RemoteTier;

/// When values found in a farther tier are copied into nearer tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PromotionStrategy {
    /// Copy a farther-tier hit into every nearer tier.
    #[default]
    OnHit,
    /// Copy a farther-tier hit only into the nearer tiers that answered with a
    /// miss during this lookup; tiers that failed are skipped.
    OnMiss,
    /// Like `OnHit`, and also refresh the TTL of the entry that served the hit,
    /// including first-tier hits.
    Always,
}

/// Which tiers a write reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WritePolicy {
    /// Every tier.
    #[default]
    WriteThrough,
    /// Only the nearest tier. Farther copies of the key are deleted so a later
    /// read cannot resurrect an older value.
    NearestOnly,
}

/// One backing store in the ordered tier list.
#[derive(Debug, Clone)]
pub enum Tier {
    /// In-process entry store.
    Memory(Arc<EntryStore>),
    /// Networked store.
    Remote(RemoteTier),
}

impl Tier {
    pub fn is_remote(&self) -> bool {
        matches!(self, Tier::Remote(_))
    }

    pub fn supports_enumeration(&self) -> bool {
        match self {
            Tier::Memory(_) => true,
            Tier::Remote(remote) => remote.supports_enumeration(),
        }
    }

    pub fn as_memory(&self) -> Option<&Arc<EntryStore>> {
        match self {
            Tier::Memory(store) => Some(store),
            Tier::Remote(_) => None,
        }
    }

    /// Value plus its remaining TTL.
    async fn get(&self, key: &str) -> Result<Option<(Bytes, Option<Duration>)>> {
        match self {
            Tier::Memory(store) => Ok(store.get_with_ttl(key)),
            Tier::Remote(remote) => Ok(remote.get(key).await?.map(|v| (v.data, v.ttl))),
        }
    }

    /// Read without touching statistics or recency.
    async fn peek(&self, key: &str) -> Result<Option<Bytes>> {
        match self {
            Tier::Memory(store) => Ok(store.peek(key)),
            Tier::Remote(remote) => Ok(remote.get(key).await?.map(|v| v.data)),
        }
    }

    async fn set(&self, key: &str, value: &Bytes, ttl: Option<Duration>) -> Result<()> {
        match self {
            Tier::Memory(store) => store.set(key, value.clone(), ttl),
            Tier::Remote(remote) => remote.set(key, value, ttl).await,
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        match self {
            Tier::Memory(store) => Ok(store.delete(key)),
            Tier::Remote(remote) => remote.delete(key).await,
        }
    }

    async fn has(&self, key: &str) -> Result<bool> {
        match self {
            Tier::Memory(store) => Ok(store.has(key)),
            Tier::Remote(remote) => Ok(remote.get(key).await?.is_some()),
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Memory(store) => write!(f, "memory({})", store.name()),
            Tier::Remote(remote) => write!(f, "remote({})", remote.name()),
        }
    }
}

/// Per-tier statistics.
#[derive(Debug, Clone, Serialize)]
pub struct TierStats {
    pub name: String,
    pub remote: bool,
    /// Entries held (memory tiers only).
    pub entries: Option<usize>,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Failed remote calls.
    pub failures: u64,
}

/// Coordinator behaviour switches.
#[derive(Debug, Clone)]
pub struct TieredOptions {
    pub promotion: PromotionStrategy,
    pub write_policy: WritePolicy,
    pub default_ttl: Option<Duration>,
    /// Require enumeration support from every tier.
    pub pattern_delete: bool,
}

impl Default for TieredOptions {
    fn default() -> Self {
        Self {
            promotion: PromotionStrategy::OnHit,
            write_policy: WritePolicy::WriteThrough,
            default_ttl: None,
            pattern_delete: true,
        }
    }
}

/// Outcome of probing one tier during a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Probe {
    Missed,
    Failed,
}

/// A cache instance backed by one or more tiers.
pub struct TieredCache {
    name: String,
    tiers: Vec<Tier>,
    options: TieredOptions,
    hits: AtomicU64,
    misses: AtomicU64,
    promotions: AtomicU64,
    degraded: AtomicU64,
}

impl std::fmt::Debug for TieredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("name", &self.name)
            .field("tiers", &self.tiers)
            .field("options", &self.options)
            .finish()
    }
}

impl TieredCache {
    /// Build a coordinator over `tiers`, ordered nearest first.
    pub fn new(name: impl Into<String>, tiers: Vec<Tier>, options: TieredOptions) -> Result<Self> {
        let name = name.into();
        if tiers.is_empty() {
            return Err(CacheError::InvalidConfiguration(format!(
                "cache {name} needs at least one tier"
            )));
        }
        if options.pattern_delete {
            if let Some(tier) = tiers.iter().find(|t| !t.supports_enumeration()) {
                return Err(CacheError::InvalidConfiguration(format!(
                    "cache {name}: tier {tier} cannot enumerate keys, required for delete_pattern"
                )));
            }
        }

        Ok(Self {
            name,
            tiers,
            options,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            promotions: AtomicU64::new(0),
            degraded: AtomicU64::new(0),
        })
    }

    /// Build from configuration: a memory tier, plus a remote tier when both
    /// configured and supplied.
    pub fn from_config(
        config: &CacheConfig,
        remote: Option<Arc<dyn RemoteStore>>,
        listener: Option<RemovalListener>,
    ) -> Result<Self> {
        config.validate()?;

        let mut store = EntryStore::new(
            format!("{}:memory", config.name),
            StoreConfig {
                max_size: config.memory_max_size(),
                default_ttl: config.default_ttl(),
                eviction_policy: config.eviction_policy,
                max_entry_bytes: config.max_entry_bytes,
                shards: config.tiers.memory.shards,
            },
        )?;
        if let Some(listener) = listener {
            store = store.with_removal_listener(listener);
        }
        let mut tiers = vec![Tier::Memory(Arc::new(store))];

        match (&config.tiers.remote, remote) {
            (Some(remote_cfg), Some(store)) => {
                if config.enable_encryption {
                    warn!(
                        cache = %config.name,
                        "enable_encryption set but no cipher is configured; remote payloads are framed only"
                    );
                }
                let prefix = remote_cfg
                    .key_prefix
                    .clone()
                    .unwrap_or_else(|| format!("{}:", config.name));
                let codec = Codec::new(CodecConfig {
                    compression: config.enable_compression,
                    ..Default::default()
                });
                tiers.push(Tier::Remote(RemoteTier::new(
                    store,
                    prefix,
                    codec,
                    Duration::from_millis(remote_cfg.timeout_ms),
                )));
            }
            (Some(_), None) => {
                return Err(CacheError::InvalidConfiguration(format!(
                    "cache {} configures a remote tier but no remote store was supplied",
                    config.name
                )));
            }
            (None, _) => {}
        }

        let cache = Self::new(
            config.name.clone(),
            tiers,
            TieredOptions {
                promotion: config.promotion_strategy,
                write_policy: config.write_policy,
                default_ttl: config.default_ttl(),
                pattern_delete: config.pattern_delete,
            },
        )?;
        info!(
            cache = %cache.name,
            tiers = cache.tiers.len(),
            max_size = config.memory_max_size(),
            policy = %config.eviction_policy,
            promotion = ?config.promotion_strategy,
            "Cache created"
        );
        Ok(cache)
    }

    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    /// The nearest in-process store, if any.
    pub fn memory(&self) -> Option<&Arc<EntryStore>> {
        self.tiers.iter().find_map(Tier::as_memory)
    }

    fn has_local_tier(&self) -> bool {
        self.tiers.iter().any(|t| !t.is_remote())
    }

    /// Whether a failure on `tier` should be absorbed (degraded mode).
    fn absorb(&self, tier: &Tier, err: &CacheError, operation: &str, key: &str) -> bool {
        if tier.is_remote() && err.is_remote_failure() && self.has_local_tier() {
            self.degraded.fetch_add(1, Ordering::Relaxed);
            warn!(
                cache = %self.name,
                tier = %tier,
                operation,
                key,
                error = %err,
                "Remote tier failed, continuing with local tiers"
            );
            true
        } else {
            false
        }
    }

    /// Tiers a write stores into, and tiers it must clear.
    fn write_targets(&self) -> (&[Tier], &[Tier]) {
        match self.options.write_policy {
            WritePolicy::WriteThrough => (self.tiers.as_slice(), &[]),
            WritePolicy::NearestOnly => self.tiers.split_at(1),
        }
    }

    /// TTL for a copy of an entry with `remaining` lifetime: never longer than
    /// the source, and capped by the cache default.
    fn copy_ttl(&self, remaining: Option<Duration>) -> Option<Duration> {
        match (remaining, self.options.default_ttl) {
            (Some(left), Some(default)) => Some(left.min(default)),
            (Some(left), None) => Some(left),
            (None, default) => default,
        }
    }

    async fn promote(
        &self,
        key: &str,
        value: &Bytes,
        remaining: Option<Duration>,
        hit_tier: usize,
        probes: &[Probe],
    ) {
        let targets: Vec<usize> = match self.options.promotion {
            PromotionStrategy::OnHit | PromotionStrategy::Always => (0..hit_tier).collect(),
            PromotionStrategy::OnMiss => (0..hit_tier)
                .filter(|&i| probes[i] == Probe::Missed)
                .collect(),
        };

        let mut ttl = self.copy_ttl(remaining);

        // Refreshing restarts the entry's lifetime at the cache default; without
        // a default there is nothing to restart to.
        if let (PromotionStrategy::Always, Some(refresh)) =
            (self.options.promotion, self.options.default_ttl)
        {
            let tier = &self.tiers[hit_tier];
            let refreshed = match tier {
                Tier::Memory(store) => Ok(store.touch(key, Some(refresh))),
                Tier::Remote(_) => tier.set(key, value, Some(refresh)).await.map(|()| true),
            };
            match refreshed {
                Ok(true) => ttl = Some(refresh),
                Ok(false) => {}
                Err(err) => {
                    self.absorb(tier, &err, "refresh", key);
                }
            }
        }

        if ttl.is_some_and(|ttl| ttl.is_zero()) {
            // Expired while being read.
            return;
        }

        for idx in targets {
            let tier = &self.tiers[idx];
            match tier.set(key, value, ttl).await {
                Ok(()) => {
                    self.promotions.fetch_add(1, Ordering::Relaxed);
                    debug!(cache = %self.name, key, from = hit_tier, to = idx, "Promoted entry");
                }
                Err(err) => {
                    if !self.absorb(tier, &err, "promote", key) {
                        warn!(cache = %self.name, key, error = %err, "Promotion failed");
                    }
                }
            }
        }
    }

    async fn write(&self, key: &str, value: &Bytes, ttl: Option<Duration>) -> Result<()> {
        let ttl = ttl.or(self.options.default_ttl);
        let (targets, stale) = self.write_targets();
        let mut written = 0;
        for tier in targets {
            match tier.set(key, value, ttl).await {
                Ok(()) => written += 1,
                Err(err) => {
                    if !self.absorb(tier, &err, "set", key) {
                        return Err(err);
                    }
                }
            }
        }
        for tier in stale {
            if let Err(err) = tier.delete(key).await {
                if !self.absorb(tier, &err, "invalidate", key) {
                    return Err(err);
                }
            }
        }
        debug!(cache = %self.name, key, tiers = written, "Stored entry");
        Ok(())
    }

    /// Look a key up without counting hits or misses and without promoting.
    /// Remote failures are absorbed as misses when a local tier exists.
    pub async fn peek_bytes(&self, key: &str) -> Result<Option<Bytes>> {
        for tier in &self.tiers {
            match tier.peek(key).await {
                Ok(Some(value)) => return Ok(Some(value)),
                Ok(None) => {}
                Err(err) => {
                    if !self.absorb(tier, &err, "peek", key) {
                        return Err(err);
                    }
                }
            }
        }
        Ok(None)
    }

    pub fn promotions(&self) -> u64 {
        self.promotions.load(Ordering::Relaxed)
    }

    /// Remote failures absorbed in degraded mode.
    pub fn degraded_operations(&self) -> u64 {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn tier_stats(&self) -> Vec<TierStats> {
        self.tiers
            .iter()
            .map(|tier| match tier {
                Tier::Memory(store) => {
                    let stats = store.stats();
                    TierStats {
                        name: tier.to_string(),
                        remote: false,
                        entries: Some(stats.size),
                        hits: stats.hits,
                        misses: stats.misses,
                        evictions: stats.evictions,
                        failures: 0,
                    }
                }
                Tier::Remote(remote) => TierStats {
                    name: tier.to_string(),
                    remote: true,
                    entries: None,
                    hits: 0,
                    misses: 0,
                    evictions: 0,
                    failures: remote.stats().failures.load(Ordering::Relaxed),
                },
            })
            .collect()
    }

    /// Sum of memory-tier size estimates.
    pub fn memory_usage(&self) -> usize {
        self.tiers
            .iter()
            .filter_map(Tier::as_memory)
            .map(|store| store.memory_usage())
            .sum()
    }

    /// Eagerly purge expired entries from memory tiers.
    pub fn purge_expired(&self) -> usize {
        self.tiers
            .iter()
            .filter_map(Tier::as_memory)
            .map(|store| store.purge_expired())
            .sum()
    }
}

#[async_trait]
impl Cache for TieredCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_bytes(&self, key: &str) -> Result<Option<Bytes>> {
        let mut probes = Vec::with_capacity(self.tiers.len());
        for (idx, tier) in self.tiers.iter().enumerate() {
            match tier.get(key).await {
                Ok(Some((value, remaining))) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    if idx > 0 || self.options.promotion == PromotionStrategy::Always {
                        self.promote(key, &value, remaining, idx, &probes).await;
                    }
                    return Ok(Some(value));
                }
                Ok(None) => probes.push(Probe::Missed),
                Err(err) => {
                    if !self.absorb(tier, &err, "get", key) {
                        return Err(err);
                    }
                    probes.push(Probe::Failed);
                }
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }

    async fn set_bytes(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        self.write(key, &value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut removed = false;
        for tier in &self.tiers {
            match tier.delete(key).await {
                Ok(hit) => removed |= hit,
                Err(err) => {
                    if !self.absorb(tier, &err, "delete", key) {
                        return Err(err);
                    }
                }
            }
        }
        Ok(removed)
    }

    async fn has(&self, key: &str) -> Result<bool> {
        for tier in &self.tiers {
            match tier.has(key).await {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(err) => {
                    if !self.absorb(tier, &err, "has", key) {
                        return Err(err);
                    }
                }
            }
        }
        Ok(false)
    }

    async fn clear(&self) -> Result<()> {
        for tier in &self.tiers {
            match tier {
                Tier::Memory(store) => store.clear(),
                Tier::Remote(remote) if remote.supports_enumeration() => {
                    if let Err(err) = remote.delete_matching("*").await {
                        if !self.absorb(tier, &err, "clear", "*") {
                            return Err(err);
                        }
                    }
                }
                Tier::Remote(_) => {
                    warn!(cache = %self.name, tier = %tier, "Cannot clear a tier without enumeration");
                }
            }
        }
        info!(cache = %self.name, "Cache cleared");
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let memory = self.memory().map(|store| store.stats());
        CacheStats {
            hits,
            misses,
            hit_rate: CacheStats::rate(hits, misses),
            size: memory.as_ref().map_or(0, |s| s.size),
            max_size: memory.as_ref().map_or(0, |s| s.max_size),
            evictions: self
                .tiers
                .iter()
                .filter_map(Tier::as_memory)
                .map(|store| store.stats().evictions)
                .sum(),
        }
    }
}

#[async_trait]
impl EnhancedCache for TieredCache {
    async fn get_many_bytes(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get_bytes(key).await?);
        }
        Ok(values)
    }

    async fn set_many_bytes(
        &self,
        entries: Vec<(String, Bytes)>,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let writes = entries
            .iter()
            .map(|(key, value)| self.write(key, value, ttl));
        futures::future::try_join_all(writes).await?;
        Ok(())
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<usize> {
        if !self.options.pattern_delete {
            return Err(CacheError::InvalidConfiguration(format!(
                "pattern deletion is disabled for cache {}",
                self.name
            )));
        }
        let matcher = glob_to_regex(pattern)?;

        let mut removed = HashSet::new();
        for tier in &self.tiers {
            match tier {
                Tier::Memory(store) => removed.extend(store.remove_matching(&matcher)),
                Tier::Remote(remote) => match remote.delete_matching(pattern).await {
                    Ok(keys) => removed.extend(keys),
                    Err(err) => {
                        if !self.absorb(tier, &err, "delete_pattern", pattern) {
                            return Err(err);
                        }
                    }
                },
            }
        }
        info!(cache = %self.name, pattern, removed = removed.len(), "Deleted by pattern");
        Ok(removed.len())
    }
}
