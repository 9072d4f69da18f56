//! Cache registry: named instances of every variant, plus global statistics.
//!
//! A registry is constructed explicitly and passed to whoever needs it; there
//! is no process-wide default.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::info;

use crate::cache::semantic::SemanticCache;
use crate::cache::similarity::Embedder;
use crate::cache::single_flight::SingleFlightCache;
use crate::cache::store::CacheStats;
use crate::cache::tiered::TieredCache;
use crate::cache::traits::{Cache, EnhancedCache};
use crate::config::{CacheConfig, CacheDefinition, CacheKind};
use crate::error::{CacheError, Result};
use crate::remote::adapter::RemoteStore;

/// A registered cache instance.
#[derive(Clone)]
pub enum CacheHandle {
    Basic(Arc<TieredCache>),
    MultiTier(Arc<TieredCache>),
    SingleFlight(Arc<SingleFlightCache>),
    Semantic(Arc<SemanticCache>),
}

impl CacheHandle {
    pub fn kind(&self) -> CacheKind {
        match self {
            CacheHandle::Basic(_) => CacheKind::Basic,
            CacheHandle::MultiTier(_) => CacheKind::MultiTier,
            CacheHandle::SingleFlight(_) => CacheKind::SingleFlight,
            CacheHandle::Semantic(_) => CacheKind::Semantic,
        }
    }

    /// The instance behind its capability interface.
    pub fn as_cache(&self) -> Arc<dyn EnhancedCache> {
        match self {
            CacheHandle::Basic(cache) | CacheHandle::MultiTier(cache) => cache.clone(),
            CacheHandle::SingleFlight(cache) => cache.clone(),
            CacheHandle::Semantic(cache) => cache.clone(),
        }
    }

    /// The tier coordinator every variant is built on.
    pub fn tiered(&self) -> &Arc<TieredCache> {
        match self {
            CacheHandle::Basic(cache) | CacheHandle::MultiTier(cache) => cache,
            CacheHandle::SingleFlight(cache) => cache.inner(),
            CacheHandle::Semantic(cache) => cache.inner(),
        }
    }

    pub fn name(&self) -> &str {
        self.tiered().name()
    }

    pub fn stats(&self) -> CacheStats {
        self.tiered().stats()
    }

    pub fn memory_usage(&self) -> usize {
        self.tiered().memory_usage()
    }
}

/// Registry-wide statistics, recomputed on every call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GlobalStats {
    pub total_caches: usize,
    pub total_hits: u64,
    pub total_misses: u64,
    pub global_hit_rate: f64,
    /// Sum of memory-tier size estimates, in bytes.
    pub memory_usage: usize,
}

#[derive(Default)]
pub struct CacheRegistry {
    caches: RwLock<HashMap<String, CacheHandle>>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_vacant(&self, name: &str) {
        if self.caches.read().contains_key(name) {
            panic!("cache {name:?} is already registered");
        }
    }

    fn register(&self, handle: CacheHandle) {
        let name = handle.name().to_string();
        let kind = handle.kind();
        let mut caches = self.caches.write();
        if caches.contains_key(&name) {
            drop(caches);
            panic!("cache {name:?} is already registered");
        }
        caches.insert(name.clone(), handle);
        info!(cache = %name, ?kind, "Cache registered");
    }

    /// Create a single-tier in-process cache.
    ///
    /// # Panics
    ///
    /// If a cache with the same name is already registered.
    pub fn create_cache(&self, config: CacheConfig) -> Result<Arc<TieredCache>> {
        self.ensure_vacant(&config.name);
        let mut config = config;
        config.tiers.remote = None;
        let cache = Arc::new(TieredCache::from_config(&config, None, None)?);
        self.register(CacheHandle::Basic(cache.clone()));
        Ok(cache)
    }

    /// Create a memory + remote cache.
    ///
    /// # Panics
    ///
    /// If a cache with the same name is already registered.
    pub fn create_multi_tier_cache(
        &self,
        config: CacheConfig,
        remote: Arc<dyn RemoteStore>,
    ) -> Result<Arc<TieredCache>> {
        self.ensure_vacant(&config.name);
        let mut config = config;
        config.tiers.remote.get_or_insert_with(Default::default);
        let cache = Arc::new(TieredCache::from_config(&config, Some(remote), None)?);
        self.register(CacheHandle::MultiTier(cache.clone()));
        Ok(cache)
    }

    /// Create a deduplicating cache.
    ///
    /// # Panics
    ///
    /// If a cache with the same name is already registered.
    pub fn create_ai_cache(
        &self,
        config: CacheConfig,
        remote: Option<Arc<dyn RemoteStore>>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Arc<SemanticCache>> {
        self.ensure_vacant(&config.name);
        let cache = Arc::new(SemanticCache::from_config(&config, remote, embedder)?);
        self.register(CacheHandle::Semantic(cache.clone()));
        Ok(cache)
    }

    /// Create a cache with single-flight compute-on-miss.
    ///
    /// # Panics
    ///
    /// If a cache with the same name is already registered.
    pub fn create_single_flight_cache(
        &self,
        config: CacheConfig,
        remote: Option<Arc<dyn RemoteStore>>,
    ) -> Result<Arc<SingleFlightCache>> {
        self.ensure_vacant(&config.name);
        let cache = Arc::new(SingleFlightCache::from_config(&config, remote)?);
        self.register(CacheHandle::SingleFlight(cache.clone()));
        Ok(cache)
    }

    /// Create the cache a configuration entry describes.
    ///
    /// # Panics
    ///
    /// If a cache with the same name is already registered.
    pub fn create_from_definition(
        &self,
        definition: &CacheDefinition,
        remote: Arc<dyn RemoteStore>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<CacheHandle> {
        let config = definition.config.clone();
        let wants_remote = config.tiers.remote.is_some();
        let remote = wants_remote.then_some(remote);
        Ok(match definition.kind {
            CacheKind::Basic => CacheHandle::Basic(self.create_cache(config)?),
            CacheKind::MultiTier => match remote {
                Some(remote) => CacheHandle::MultiTier(self.create_multi_tier_cache(config, remote)?),
                None => {
                    return Err(CacheError::InvalidConfiguration(format!(
                        "multi-tier cache {} has no tiers.remote section",
                        config.name
                    )))
                }
            },
            CacheKind::SingleFlight => {
                CacheHandle::SingleFlight(self.create_single_flight_cache(config, remote)?)
            }
            CacheKind::Semantic => CacheHandle::Semantic(self.create_ai_cache(config, remote, embedder)?),
        })
    }

    pub fn get(&self, name: &str) -> Option<CacheHandle> {
        self.caches.read().get(name).cloned()
    }

    /// Unregister `name`. Outstanding handles keep working.
    pub fn destroy(&self, name: &str) -> bool {
        let removed = self.caches.write().remove(name).is_some();
        if removed {
            info!(cache = %name, "Cache destroyed");
        }
        removed
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.caches.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn handles(&self) -> Vec<CacheHandle> {
        self.caches.read().values().cloned().collect()
    }

    /// Eagerly purge expired entries in every cache.
    pub fn purge_expired(&self) -> usize {
        self.handles()
            .iter()
            .map(|handle| handle.tiered().purge_expired())
            .sum()
    }

    pub fn global_stats(&self) -> GlobalStats {
        let handles = self.handles();
        let mut stats = GlobalStats {
            total_caches: handles.len(),
            ..Default::default()
        };
        for handle in &handles {
            let cache = handle.stats();
            stats.total_hits += cache.hits;
            stats.total_misses += cache.misses;
            stats.memory_usage += handle.memory_usage();
        }
        stats.global_hit_rate = CacheStats::rate(stats.total_hits, stats.total_misses);
        stats
    }
}
