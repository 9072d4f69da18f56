//! Integration tests for single-flight request coalescing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use tiered_cache::cache::single_flight::{FlightOptions, SingleFlightCache};
use tiered_cache::cache::traits::{Cache, CacheExt};
use tiered_cache::config::{CacheConfig, RemoteTierConfig};
use tiered_cache::error::CacheError;
use tiered_cache::remote::adapter::{InMemoryRemoteStore, RemoteStore};

fn cache(name: &str) -> Arc<SingleFlightCache> {
    Arc::new(SingleFlightCache::from_config(&CacheConfig::named(name), None).unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fifty_concurrent_calls_compute_once() {
    let cache = cache("collapse");
    let counter = Arc::new(AtomicUsize::new(0));

    let calls = (0..50).map(|_| {
        let cache = cache.clone();
        let counter = counter.clone();
        tokio::spawn(async move {
            cache
                .single_flight(
                    "k",
                    move || async move {
                        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(format!("computed-{n}"))
                    },
                    FlightOptions::default(),
                )
                .await
        })
    });

    let results: Vec<String> = join_all(calls)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(results.len(), 50);
    assert!(results.iter().all(|r| r == "computed-1"));

    let stats = cache.flight_stats();
    assert_eq!(stats.started, 1);
    assert_eq!(stats.in_flight, 0);
}

#[tokio::test]
async fn test_result_visible_right_after_flight() {
    let cache = cache("visible");
    let value: u64 = cache
        .single_flight("n", || async { Ok(99u64) }, FlightOptions::default())
        .await
        .unwrap();
    assert_eq!(value, 99);
    assert_eq!(cache.get::<u64>("n").await.unwrap(), Some(99));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failure_fans_out_then_retries() {
    let cache = cache("failing");
    let attempts = Arc::new(AtomicUsize::new(0));

    let calls = (0..10).map(|_| {
        let cache = cache.clone();
        let attempts = attempts.clone();
        tokio::spawn(async move {
            cache
                .single_flight::<String, _, _>(
                    "k",
                    move || async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        anyhow::bail!("upstream unavailable")
                    },
                    FlightOptions::default(),
                )
                .await
        })
    });

    let errors: Vec<CacheError> = join_all(calls)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap_err())
        .collect();

    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert!(errors
        .iter()
        .all(|e| matches!(e, CacheError::Compute(inner) if inner.to_string() == "upstream unavailable")));
    assert!(!cache.has("k").await.unwrap());

    // The next caller starts a fresh flight.
    let attempts_after = attempts.clone();
    let value: String = cache
        .single_flight(
            "k",
            move || async move {
                attempts_after.fetch_add(1, Ordering::SeqCst);
                Ok("recovered".to_string())
            },
            FlightOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(value, "recovered");
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timeout_does_not_cancel_other_waiters() {
    let cache = cache("timeouts");
    let runs = Arc::new(AtomicUsize::new(0));

    let slow = {
        let cache = cache.clone();
        let runs = runs.clone();
        tokio::spawn(async move {
            cache
                .single_flight(
                    "slow",
                    move || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(7u32)
                    },
                    FlightOptions::default(),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let impatient = cache
        .single_flight::<u32, _, _>(
            "slow",
            || async { Ok(0u32) },
            FlightOptions {
                timeout: Some(Duration::from_millis(20)),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(impatient, Err(CacheError::Timeout { .. })));

    assert_eq!(slow.await.unwrap().unwrap(), 7);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(cache.get::<u32>("slow").await.unwrap(), Some(7));
}

#[tokio::test]
async fn test_instance_timeout_applies_by_default() {
    let mut config = CacheConfig::named("default-timeout");
    config.single_flight.timeout_ms = Some(10);
    let cache = SingleFlightCache::from_config(&config, None).unwrap();

    let err = cache
        .single_flight(
            "k",
            || async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(1u8)
            },
            FlightOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::Timeout { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distinct_keys_run_independently() {
    let cache = cache("independent");
    let counter = Arc::new(AtomicUsize::new(0));

    let calls = (0..8).map(|i| {
        let cache = cache.clone();
        let counter = counter.clone();
        tokio::spawn(async move {
            cache
                .single_flight(
                    &format!("key-{i}"),
                    move || async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(i)
                    },
                    FlightOptions::default(),
                )
                .await
        })
    });

    let mut values: Vec<i32> = join_all(calls)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();
    values.sort();

    assert_eq!(values, (0..8).collect::<Vec<_>>());
    assert_eq!(counter.load(Ordering::SeqCst), 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_late_caller_reuses_value_of_finished_flight() {
    let remote = Arc::new(InMemoryRemoteStore::new("remote"));
    let mut config = CacheConfig::named("late");
    config.tiers.remote = Some(RemoteTierConfig {
        timeout_ms: 1_000,
        ..Default::default()
    });
    let cache = Arc::new(
        SingleFlightCache::from_config(&config, Some(remote.clone() as Arc<dyn RemoteStore>))
            .unwrap(),
    );
    let runs = Arc::new(AtomicUsize::new(0));

    let first = {
        let cache = cache.clone();
        let runs = runs.clone();
        tokio::spawn(async move {
            cache
                .single_flight(
                    "k",
                    move || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok("first".to_string())
                    },
                    FlightOptions::default(),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    // The second caller misses memory, then sits in a slow remote read that
    // outlives the first flight, so it reaches the flight table only after
    // that flight has completed and left it.
    remote.set_latency(Duration::from_millis(150));
    let second = {
        let cache = cache.clone();
        let runs = runs.clone();
        tokio::spawn(async move {
            cache
                .single_flight(
                    "k",
                    move || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok("second".to_string())
                    },
                    FlightOptions::default(),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    remote.set_latency(Duration::ZERO);

    assert_eq!(first.await.unwrap().unwrap(), "first");
    // Its slow remote read then fails and degrades to a miss.
    remote.set_available(false);
    let second = second.await.unwrap().unwrap();
    remote.set_available(true);

    assert_eq!(second, "first");
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(cache.flight_stats().started, 2);
}
