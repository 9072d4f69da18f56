//! Integration tests for the cache registry.

use std::sync::Arc;

use tiered_cache::cache::registry::{CacheHandle, CacheRegistry};
use tiered_cache::cache::similarity::HashingEmbedder;
use tiered_cache::cache::traits::CacheExt;
use tiered_cache::config::{CacheConfig, CacheKind, Config};
use tiered_cache::remote::adapter::{InMemoryRemoteStore, RemoteStore};

async fn record_traffic(cache: &CacheHandle, hits: usize, misses: usize) {
    let cache = cache.as_cache();
    cache.set("present", &1u32, None).await.unwrap();
    for _ in 0..hits {
        assert!(cache.get::<u32>("present").await.unwrap().is_some());
    }
    for i in 0..misses {
        assert!(cache.get::<u32>(&format!("absent-{i}")).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn test_global_stats_aggregate_instances() {
    let registry = CacheRegistry::new();
    registry.create_cache(CacheConfig::named("one")).unwrap();
    registry
        .create_single_flight_cache(CacheConfig::named("two"), None)
        .unwrap();

    for name in ["one", "two"] {
        record_traffic(&registry.get(name).unwrap(), 10, 5).await;
    }

    let stats = registry.global_stats();
    assert_eq!(stats.total_caches, 2);
    assert_eq!(stats.total_hits, 20);
    assert_eq!(stats.total_misses, 10);
    assert!((stats.global_hit_rate - 0.6667).abs() < 1e-4);
    assert!(stats.memory_usage > 0);
}

#[test]
#[should_panic(expected = "already registered")]
fn test_duplicate_name_fails_fast() {
    let registry = CacheRegistry::new();
    registry.create_cache(CacheConfig::named("dup")).unwrap();
    let _ = registry.create_single_flight_cache(CacheConfig::named("dup"), None);
}

#[test]
#[should_panic(expected = "already registered")]
fn test_duplicate_name_across_variants() {
    let registry = CacheRegistry::new();
    registry
        .create_ai_cache(
            CacheConfig::named("shared"),
            None,
            Arc::new(HashingEmbedder::default()),
        )
        .unwrap();
    let remote: Arc<dyn RemoteStore> = Arc::new(InMemoryRemoteStore::default());
    let _ = registry.create_multi_tier_cache(CacheConfig::named("shared"), remote);
}

#[tokio::test]
async fn test_build_from_configuration() {
    let json = r#"{
        "caches": [
            { "kind": "basic", "name": "sessions", "max_size": 100 },
            { "kind": "multi-tier", "name": "bills", "tiers": { "remote": {} } },
            { "kind": "single-flight", "name": "reports" },
            { "kind": "semantic", "name": "answers", "similarity_threshold": 0.9 }
        ]
    }"#;
    let config: Config = serde_json::from_str(json).unwrap();
    let remote: Arc<dyn RemoteStore> = Arc::new(InMemoryRemoteStore::default());
    let embedder = Arc::new(HashingEmbedder::default());

    let registry = CacheRegistry::new();
    for definition in &config.caches {
        registry
            .create_from_definition(definition, remote.clone(), embedder.clone())
            .unwrap();
    }

    assert_eq!(registry.names(), vec!["answers", "bills", "reports", "sessions"]);
    assert_eq!(registry.get("bills").unwrap().kind(), CacheKind::MultiTier);
    assert_eq!(registry.get("sessions").unwrap().stats().max_size, 100);

    let bills = registry.get("bills").unwrap().as_cache();
    bills.set("b1", "due", None).await.unwrap();
    assert!(remote.get("bills:b1").await.unwrap().is_some());
}

#[test]
fn test_multi_tier_definition_requires_remote_section() {
    let json = r#"{ "caches": [ { "kind": "multi-tier", "name": "bills" } ] }"#;
    let config: Config = serde_json::from_str(json).unwrap();
    let registry = CacheRegistry::new();

    let result = registry.create_from_definition(
        &config.caches[0],
        Arc::new(InMemoryRemoteStore::default()),
        Arc::new(HashingEmbedder::default()),
    );
    assert!(result.is_err());
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_purge_expired_sweeps_all_caches() {
    let registry = CacheRegistry::new();
    let a = registry.create_cache(CacheConfig::named("a")).unwrap();
    let b = registry.create_cache(CacheConfig::named("b")).unwrap();

    let ttl = Some(std::time::Duration::from_millis(5));
    a.set("x", &1, ttl).await.unwrap();
    b.set("y", &2, ttl).await.unwrap();
    b.set("z", &3, None).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    assert_eq!(registry.purge_expired(), 2);
    assert_eq!(registry.global_stats().total_caches, 2);
}
