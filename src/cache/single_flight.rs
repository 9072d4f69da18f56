//! Single-flight: collapse concurrent computations of the same key into one.
//!
//! The first caller for an idle key starts a flight; the computation runs in
//! its own task so that it always runs to completion. Every caller, the
//! starter included, waits on the flight's result slot and receives the same
//! value or error. A caller whose timeout elapses gets `Timeout` for itself
//! only; the flight keeps going and still populates the cache.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::codec;
use crate::cache::store::CacheStats;
use crate::cache::tiered::TieredCache;
use crate::cache::traits::{Cache, EnhancedCache};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::remote::adapter::RemoteStore;

type FlightResult = std::result::Result<Bytes, CacheError>;

/// One in-flight computation.
struct Flight {
    id: Uuid,
    started_at: Instant,
    result: watch::Sender<Option<FlightResult>>,
    waiters: AtomicUsize,
}

#[derive(Debug, Default)]
struct FlightCounters {
    started: AtomicU64,
    joined: AtomicU64,
    timeouts: AtomicU64,
    failures: AtomicU64,
}

/// Flight statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlightStats {
    /// Computations started.
    pub started: u64,
    /// Calls that joined an existing flight instead of computing.
    pub joined: u64,
    /// Callers that gave up waiting.
    pub timeouts: u64,
    /// Flights that ended in an error.
    pub failures: u64,
    pub in_flight: usize,
}

/// Removes the flight and publishes its outcome; publishes `FlightAborted`
/// if the leader task goes away without a result.
struct FlightGuard {
    flights: Arc<DashMap<String, Arc<Flight>>>,
    counters: Arc<FlightCounters>,
    key: String,
    flight: Arc<Flight>,
    done: bool,
}

impl FlightGuard {
    fn complete(mut self, outcome: FlightResult) {
        self.finish(outcome);
    }

    fn finish(&mut self, outcome: FlightResult) {
        self.done = true;
        if outcome.is_err() {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
        }
        let id = self.flight.id;
        self.flights.remove_if(&self.key, |_, flight| flight.id == id);
        debug!(
            key = %self.key,
            flight_id = %id,
            waiters = self.flight.waiters.load(Ordering::Relaxed),
            elapsed_ms = self.flight.started_at.elapsed().as_millis() as u64,
            ok = outcome.is_ok(),
            "Flight completed"
        );
        self.flight.result.send_replace(Some(outcome));
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if !self.done {
            warn!(key = %self.key, flight_id = %self.flight.id, "Flight aborted without a result");
            let key = self.key.clone();
            self.finish(Err(CacheError::FlightAborted(key)));
        }
    }
}

/// Per-instance flight table.
pub struct FlightGroup {
    flights: Arc<DashMap<String, Arc<Flight>>>,
    permits: Arc<Semaphore>,
    counters: Arc<FlightCounters>,
}

impl FlightGroup {
    /// `max_concurrent` bounds how many computations run at once; further
    /// flights queue for a permit.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            flights: Arc::new(DashMap::new()),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            counters: Arc::new(FlightCounters::default()),
        }
    }

    /// Run `work` as the flight for `key`, or join the flight already running.
    pub async fn run<W>(&self, key: &str, work: W, timeout: Option<Duration>) -> Result<Bytes>
    where
        W: Future<Output = Result<Bytes>> + Send + 'static,
    {
        let (flight, leader) = match self.flights.entry(key.to_string()) {
            Entry::Occupied(existing) => {
                let flight = existing.get().clone();
                flight.waiters.fetch_add(1, Ordering::Relaxed);
                (flight, false)
            }
            Entry::Vacant(slot) => {
                let (tx, _) = watch::channel(None);
                let flight = Arc::new(Flight {
                    id: Uuid::new_v4(),
                    started_at: Instant::now(),
                    result: tx,
                    waiters: AtomicUsize::new(1),
                });
                slot.insert(flight.clone());
                (flight, true)
            }
        };
        let mut rx = flight.result.subscribe();

        if leader {
            self.counters.started.fetch_add(1, Ordering::Relaxed);
            debug!(key, flight_id = %flight.id, "Flight started");
            let guard = FlightGuard {
                flights: self.flights.clone(),
                counters: self.counters.clone(),
                key: key.to_string(),
                flight: flight.clone(),
                done: false,
            };
            let permits = self.permits.clone();
            tokio::spawn(async move {
                let outcome = match permits.acquire_owned().await {
                    Ok(_permit) => work.await,
                    Err(_) => Err(CacheError::FlightAborted(guard.key.clone())),
                };
                guard.complete(outcome);
            });
        } else {
            self.counters.joined.fetch_add(1, Ordering::Relaxed);
            debug!(key, flight_id = %flight.id, "Joined flight");
        }

        let waited = Instant::now();
        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx.wait_for(Option::is_some)).await {
                Ok(received) => received.ok().and_then(|slot| (*slot).clone()),
                Err(_) => {
                    self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                    debug!(key, flight_id = %flight.id, "Stopped waiting for flight");
                    return Err(CacheError::Timeout {
                        operation: format!("single-flight {key}"),
                        elapsed: waited.elapsed(),
                    });
                }
            },
            None => rx
                .wait_for(Option::is_some)
                .await
                .ok()
                .and_then(|slot| (*slot).clone()),
        };

        outcome.unwrap_or_else(|| Err(CacheError::FlightAborted(key.to_string())))
    }

    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }

    pub fn stats(&self) -> FlightStats {
        FlightStats {
            started: self.counters.started.load(Ordering::Relaxed),
            joined: self.counters.joined.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
        }
    }
}

/// Per-call options for [`SingleFlightCache::single_flight`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FlightOptions {
    /// TTL of the stored result; `None` uses the cache default.
    pub ttl: Option<Duration>,
    /// How long this caller waits; `None` uses the cache default.
    pub timeout: Option<Duration>,
}

/// A tiered cache whose compute-on-miss calls go through a [`FlightGroup`].
pub struct SingleFlightCache {
    inner: Arc<TieredCache>,
    group: FlightGroup,
    default_timeout: Option<Duration>,
}

impl SingleFlightCache {
    pub fn new(inner: Arc<TieredCache>, max_concurrent: usize, default_timeout: Option<Duration>) -> Self {
        Self {
            inner,
            group: FlightGroup::new(max_concurrent),
            default_timeout,
        }
    }

    pub fn from_config(config: &CacheConfig, remote: Option<Arc<dyn RemoteStore>>) -> Result<Self> {
        let inner = TieredCache::from_config(config, remote, None)?;
        Ok(Self::new(
            Arc::new(inner),
            config.single_flight.max_concurrent,
            config.flight_timeout(),
        ))
    }

    pub fn inner(&self) -> &Arc<TieredCache> {
        &self.inner
    }

    /// Return the cached value for `key`, or compute it exactly once across
    /// all concurrent callers.
    ///
    /// On success the value is written to the cache before any caller is
    /// released. On failure every caller receives the same error and nothing
    /// is stored, so the next call computes again.
    pub async fn single_flight<T, F, Fut>(&self, key: &str, compute: F, options: FlightOptions) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        if let Some(bytes) = self.inner.get_bytes(key).await? {
            return codec::decode(&bytes);
        }

        let inner = self.inner.clone();
        let owned_key = key.to_string();
        let ttl = options.ttl;
        let work = async move {
            // A flight for this key may have finished between the lookup above
            // and this flight starting; its value is already stored.
            if let Some(bytes) = inner.peek_bytes(&owned_key).await? {
                return Ok(bytes);
            }
            let value = compute().await.map_err(CacheError::compute)?;
            let bytes = codec::encode(&value)?;
            inner.set_bytes(&owned_key, bytes.clone(), ttl).await?;
            Ok(bytes)
        };

        let bytes = self
            .group
            .run(key, work, options.timeout.or(self.default_timeout))
            .await?;
        codec::decode(&bytes)
    }

    pub fn flight_stats(&self) -> FlightStats {
        self.group.stats()
    }

    pub fn in_flight(&self) -> usize {
        self.group.in_flight()
    }
}

#[async_trait]
impl Cache for SingleFlightCache {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get_bytes(&self, key: &str) -> Result<Option<Bytes>> {
        self.inner.get_bytes(key).await
    }

    async fn set_bytes(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        self.inner.set_bytes(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.inner.delete(key).await
    }

    async fn has(&self, key: &str) -> Result<bool> {
        self.inner.has(key).await
    }

    async fn clear(&self) -> Result<()> {
        self.inner.clear().await
    }

    fn stats(&self) -> CacheStats {
        self.inner.stats()
    }
}

#[async_trait]
impl EnhancedCache for SingleFlightCache {
    async fn get_many_bytes(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>> {
        self.inner.get_many_bytes(keys).await
    }

    async fn set_many_bytes(
        &self,
        entries: Vec<(String, Bytes)>,
        ttl: Option<Duration>,
    ) -> Result<()> {
        self.inner.set_many_bytes(entries, ttl).await
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<usize> {
        self.inner.delete_pattern(pattern).await
    }
}
