//! Prometheus exposition of registry statistics.
//!
//! Values are snapshots taken from the registry on every scrape, so each
//! series is a gauge even where the underlying counter only grows.

use prometheus::{Encoder, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::cache::registry::CacheRegistry;

#[derive(Clone)]
pub struct CacheMetrics {
    registry: Registry,
    caches: IntGauge,
    hits: IntGaugeVec,
    misses: IntGaugeVec,
    entries: IntGaugeVec,
    evictions: IntGaugeVec,
    memory_bytes: IntGaugeVec,
}

fn per_cache(name: &str, help: &str) -> prometheus::Result<IntGaugeVec> {
    IntGaugeVec::new(Opts::new(name, help), &["cache"])
}

impl CacheMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let metrics = Self {
            caches: IntGauge::new("tiered_cache_instances", "Registered cache instances")?,
            hits: per_cache("tiered_cache_hits", "Reads answered by any tier")?,
            misses: per_cache("tiered_cache_misses", "Reads answered by no tier")?,
            entries: per_cache("tiered_cache_entries", "Entries in the nearest memory tier")?,
            evictions: per_cache("tiered_cache_evictions", "Entries evicted from memory tiers")?,
            memory_bytes: per_cache(
                "tiered_cache_memory_bytes",
                "Estimated bytes held by memory tiers",
            )?,
            registry,
        };

        metrics.registry.register(Box::new(metrics.caches.clone()))?;
        for vec in [
            &metrics.hits,
            &metrics.misses,
            &metrics.entries,
            &metrics.evictions,
            &metrics.memory_bytes,
        ] {
            metrics.registry.register(Box::new(vec.clone()))?;
        }
        Ok(metrics)
    }

    /// Copy current registry statistics into the gauges.
    pub fn refresh(&self, caches: &CacheRegistry) {
        for vec in [
            &self.hits,
            &self.misses,
            &self.entries,
            &self.evictions,
            &self.memory_bytes,
        ] {
            vec.reset();
        }

        let names = caches.names();
        self.caches.set(names.len() as i64);
        for name in names {
            let Some(handle) = caches.get(&name) else {
                continue;
            };
            let stats = handle.stats();
            let labels = [name.as_str()];
            self.hits.with_label_values(&labels).set(stats.hits as i64);
            self.misses.with_label_values(&labels).set(stats.misses as i64);
            self.entries.with_label_values(&labels).set(stats.size as i64);
            self.evictions
                .with_label_values(&labels)
                .set(stats.evictions as i64);
            self.memory_bytes
                .with_label_values(&labels)
                .set(handle.memory_usage() as i64);
        }
    }

    /// Text exposition format.
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;

    #[test]
    fn test_render_includes_each_cache() {
        let registry = CacheRegistry::new();
        registry.create_cache(CacheConfig::named("users")).unwrap();
        registry.create_cache(CacheConfig::named("orders")).unwrap();

        let metrics = CacheMetrics::new().unwrap();
        metrics.refresh(&registry);
        let text = metrics.render().unwrap();

        assert!(text.contains("tiered_cache_instances 2"));
        assert!(text.contains("tiered_cache_hits{cache=\"users\"} 0"));
        assert!(text.contains("tiered_cache_entries{cache=\"orders\"} 0"));
    }

    #[test]
    fn test_destroyed_cache_disappears() {
        let registry = CacheRegistry::new();
        registry.create_cache(CacheConfig::named("gone")).unwrap();
        let metrics = CacheMetrics::new().unwrap();
        metrics.refresh(&registry);

        registry.destroy("gone");
        metrics.refresh(&registry);
        assert!(!metrics.render().unwrap().contains("gone"));
    }
}
