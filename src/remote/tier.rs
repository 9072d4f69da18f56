//! Remote tier: the coordinator's view of a [`RemoteStore`].
//!
//! Namespaces keys with a per-cache prefix, frames payloads through the
//! [`Codec`], bounds every call with a timeout and maps adapter failures into
//! [`CacheError`].

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::debug;

use crate::cache::codec::Codec;
use crate::error::{CacheError, Result};
use crate::remote::adapter::{RemoteError, RemoteStore, RemoteValue};

/// Remote tier statistics.
#[derive(Debug, Default)]
pub struct RemoteTierStats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub failures: AtomicU64,
}

/// A remote store bound to one cache instance.
#[derive(Clone)]
pub struct RemoteTier {
    store: Arc<dyn RemoteStore>,
    key_prefix: String,
    codec: Codec,
    timeout: Duration,
    stats: Arc<RemoteTierStats>,
}

impl std::fmt::Debug for RemoteTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTier")
            .field("store", &self.store.name())
            .field("key_prefix", &self.key_prefix)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RemoteTier {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        key_prefix: impl Into<String>,
        codec: Codec,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
            codec,
            timeout,
            stats: Arc::new(RemoteTierStats::default()),
        }
    }

    pub fn name(&self) -> &str {
        self.store.name()
    }

    pub fn supports_enumeration(&self) -> bool {
        self.store.supports_enumeration()
    }

    pub fn stats(&self) -> &RemoteTierStats {
        &self.stats
    }

    fn remote_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    fn map_error(&self, err: RemoteError, operation: &str, started: Instant) -> CacheError {
        self.stats.failures.fetch_add(1, Ordering::Relaxed);
        match err {
            RemoteError::ConnectionFailed(reason) => CacheError::ConnectionFailed {
                tier: self.store.name().to_string(),
                reason,
            },
            RemoteError::Timeout => CacheError::Timeout {
                operation: format!("remote {operation}"),
                elapsed: started.elapsed(),
            },
            RemoteError::EnumerationUnsupported => CacheError::InvalidConfiguration(format!(
                "{} does not support key enumeration",
                self.store.name()
            )),
        }
    }

    /// Run one adapter call under the tier timeout.
    async fn call<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = std::result::Result<T, RemoteError>>,
    ) -> Result<T> {
        let started = Instant::now();
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(self.map_error(err, operation, started)),
            Err(_) => Err(self.map_error(RemoteError::Timeout, operation, started)),
        }
    }

    /// Read and unframe a value; the remaining TTL is passed through.
    pub async fn get(&self, key: &str) -> Result<Option<RemoteValue>> {
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        let remote_key = self.remote_key(key);
        match self.call("get", self.store.get(&remote_key)).await? {
            Some(stored) => Ok(Some(RemoteValue {
                data: self.codec.open(&stored.data)?,
                ttl: stored.ttl,
            })),
            None => Ok(None),
        }
    }

    pub async fn set(&self, key: &str, value: &Bytes, ttl: Option<Duration>) -> Result<()> {
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        let frame = self.codec.seal(value)?;
        let remote_key = self.remote_key(key);
        self.call("set", self.store.set(&remote_key, frame, ttl))
            .await
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        let remote_key = self.remote_key(key);
        self.call("delete", self.store.delete(&remote_key)).await
    }

    /// Delete keys matching a glob; returns the (unprefixed) keys removed.
    pub async fn delete_matching(&self, pattern: &str) -> Result<Vec<String>> {
        let remote_pattern = self.remote_key(pattern);
        let keys = self
            .call("enumerate", self.store.enumerate(&remote_pattern))
            .await?;

        let mut removed = Vec::with_capacity(keys.len());
        for remote_key in keys {
            // The prefix is spliced into the glob unescaped; only delete keys
            // that really belong to this tier.
            let Some(key) = remote_key.strip_prefix(&self.key_prefix) else {
                continue;
            };
            if self.call("delete", self.store.delete(&remote_key)).await? {
                removed.push(key.to_string());
            }
        }
        debug!(
            store = self.store.name(),
            pattern,
            removed = removed.len(),
            "Deleted matching remote keys"
        );
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::codec::CodecConfig;
    use crate::remote::adapter::InMemoryRemoteStore;

    fn tier(store: Arc<InMemoryRemoteStore>, compression: bool) -> RemoteTier {
        RemoteTier::new(
            store,
            "bills:",
            Codec::new(CodecConfig {
                compression,
                min_compress_bytes: 0,
                ..Default::default()
            }),
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn test_prefixed_round_trip() {
        let store = Arc::new(InMemoryRemoteStore::default());
        let tier = tier(store.clone(), true);
        let value = Bytes::from(vec![7u8; 1024]);

        tier.set("1", &value, None).await.unwrap();
        assert!(store.raw("bills:1").is_some());
        assert!(store.raw("bills:1").unwrap().len() < value.len());
        assert_eq!(tier.get("1").await.unwrap().map(|v| v.data), Some(value));
    }

    #[tokio::test]
    async fn test_timeout_maps_to_timeout_error() {
        let store = Arc::new(InMemoryRemoteStore::default());
        store.set_latency(Duration::from_millis(200));
        let tier = tier(store, false);

        let err = tier.get("slow").await.unwrap_err();
        assert!(matches!(err, CacheError::Timeout { .. }));
        assert_eq!(tier.stats().failures.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_delete_matching_strips_prefix() {
        let store = Arc::new(InMemoryRemoteStore::default());
        let tier = tier(store.clone(), false);
        for key in ["bill:1", "bill:2", "user:1"] {
            tier.set(key, &Bytes::from_static(b"v"), None).await.unwrap();
        }
        let mut removed = tier.delete_matching("bill:*").await.unwrap();
        removed.sort();
        assert_eq!(removed, vec!["bill:1", "bill:2"]);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_matching_stays_inside_prefix() {
        let store = Arc::new(InMemoryRemoteStore::default());
        let mine = RemoteTier::new(store.clone(), "a?:", Codec::default(), Duration::from_millis(50));
        let other = RemoteTier::new(store.clone(), "ab:", Codec::default(), Duration::from_millis(50));
        mine.set("1", &Bytes::from_static(b"v"), None).await.unwrap();
        other.set("1", &Bytes::from_static(b"v"), None).await.unwrap();

        assert_eq!(mine.delete_matching("*").await.unwrap(), vec!["1"]);
        assert!(store.raw("ab:1").is_some());
        assert!(store.raw("a?:1").is_none());
    }
}
