//! Remote Tier Adapter contract and an in-memory reference implementation.
//!
//! The adapter is an external collaborator: a networked key/value store.
//! Enumeration is an optional capability declared up front so that the tier
//! coordinator can reject unsupported layouts at construction time.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;

use crate::cache::pattern::glob_to_regex;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Remote store unreachable: {0}")]
    ConnectionFailed(String),

    #[error("Remote store timed out")]
    Timeout,

    #[error("Remote store does not support key enumeration")]
    EnumerationUnsupported,
}

/// A value read from a remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteValue {
    pub data: Bytes,
    /// Remaining lifetime, `None` when the value never expires.
    pub ttl: Option<Duration>,
}

/// A networked key/value store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Backend name for logs and stats.
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<RemoteValue>, RemoteError>;

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), RemoteError>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool, RemoteError>;

    /// Whether [`RemoteStore::enumerate`] is supported.
    fn supports_enumeration(&self) -> bool;

    /// Keys matching a glob pattern.
    async fn enumerate(&self, pattern: &str) -> Result<Vec<String>, RemoteError>;
}

struct StoredValue {
    data: Bytes,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self) -> bool {
        self.expires_at.map_or(true, |at| Instant::now() < at)
    }

    fn ttl_remaining(&self) -> Option<Duration> {
        self.expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }
}

/// Process-local stand-in for a networked store.
///
/// Supports fault injection: while unavailable every call fails with
/// `ConnectionFailed`, and an artificial latency can be added to exercise
/// timeouts.
pub struct InMemoryRemoteStore {
    name: String,
    storage: DashMap<String, StoredValue>,
    enumerable: bool,
    available: AtomicBool,
    latency_ms: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl Default for InMemoryRemoteStore {
    fn default() -> Self {
        Self::new("in-memory-remote")
    }
}

impl InMemoryRemoteStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            storage: DashMap::new(),
            enumerable: true,
            available: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Declare the enumeration capability.
    pub fn with_enumeration(mut self, enumerable: bool) -> Self {
        self.enumerable = enumerable;
        self
    }

    /// Simulate the store going down or coming back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Add artificial latency to every call.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Live keys currently stored.
    pub fn len(&self) -> usize {
        self.storage.iter().filter(|e| e.value().is_live()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw stored bytes, bypassing latency and availability.
    pub fn raw(&self, key: &str) -> Option<Bytes> {
        self.storage
            .get(key)
            .filter(|v| v.is_live())
            .map(|v| v.data.clone())
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    async fn simulate_network(&self) -> Result<(), RemoteError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::ConnectionFailed(format!(
                "{} is unavailable",
                self.name
            )))
        }
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<RemoteValue>, RemoteError> {
        self.simulate_network().await?;
        self.reads.fetch_add(1, Ordering::Relaxed);

        match self.storage.get(key) {
            Some(v) if v.is_live() => {
                return Ok(Some(RemoteValue {
                    data: v.data.clone(),
                    ttl: v.ttl_remaining(),
                }))
            }
            Some(_) => {}
            None => return Ok(None),
        }
        self.storage.remove_if(key, |_, v| !v.is_live());
        Ok(None)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), RemoteError> {
        self.simulate_network().await?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.storage.insert(
            key.to_string(),
            StoredValue {
                data: value,
                // An unrepresentable deadline means the value never expires.
                expires_at: ttl.and_then(|ttl| Instant::now().checked_add(ttl)),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, RemoteError> {
        self.simulate_network().await?;
        Ok(self
            .storage
            .remove(key)
            .is_some_and(|(_, v)| v.is_live()))
    }

    fn supports_enumeration(&self) -> bool {
        self.enumerable
    }

    async fn enumerate(&self, pattern: &str) -> Result<Vec<String>, RemoteError> {
        if !self.enumerable {
            return Err(RemoteError::EnumerationUnsupported);
        }
        self.simulate_network().await?;
        let re = glob_to_regex(pattern)
            .map_err(|e| RemoteError::ConnectionFailed(e.to_string()))?;
        Ok(self
            .storage
            .iter()
            .filter(|e| e.value().is_live() && re.is_match(e.key()))
            .map(|e| e.key().clone())
            .collect())
    }
}
