//! Capability interfaces shared by every cache variant.
//!
//! [`Cache`] and [`EnhancedCache`] are object safe and work on raw payload
//! bytes; [`CacheExt`] and [`EnhancedCacheExt`] layer typed, serde-encoded
//! access on top of any implementation.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::cache::codec;
use crate::cache::store::CacheStats;
use crate::error::{CacheError, Result};

/// Basic cache contract.
#[async_trait]
pub trait Cache: Send + Sync {
    fn name(&self) -> &str;

    /// Live value for `key`; a miss is `Ok(None)`.
    async fn get_bytes(&self, key: &str) -> Result<Option<Bytes>>;

    /// Store `value`; `ttl` of `None` uses the instance default.
    async fn set_bytes(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()>;

    /// Remove `key`; returns whether anything was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn has(&self, key: &str) -> Result<bool>;

    async fn clear(&self) -> Result<()>;

    fn stats(&self) -> CacheStats;

    /// Delete that requires the key to exist.
    async fn remove_strict(&self, key: &str) -> Result<()> {
        if self.delete(key).await? {
            Ok(())
        } else {
            Err(CacheError::KeyNotFound(key.to_string()))
        }
    }
}

/// Batch and pattern operations.
#[async_trait]
pub trait EnhancedCache: Cache {
    /// Values for `keys`, in the same order.
    async fn get_many_bytes(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>>;

    /// Store every entry; atomic per key, not across keys.
    async fn set_many_bytes(&self, entries: Vec<(String, Bytes)>, ttl: Option<Duration>)
        -> Result<()>;

    /// Remove every key matching a glob; returns the number removed.
    async fn delete_pattern(&self, pattern: &str) -> Result<usize>;
}

/// Typed access for any [`Cache`].
#[async_trait]
pub trait CacheExt: Cache {
    async fn get<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        match self.get_bytes(key).await? {
            Some(bytes) => codec::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn set<T>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        let bytes = codec::encode(value)?;
        self.set_bytes(key, bytes, ttl).await
    }

    /// Return the cached value, or compute, store and return it on a miss.
    ///
    /// Concurrent callers may each compute; use a single-flight cache to
    /// collapse them.
    async fn get_or_compute<T, F, Fut>(&self, key: &str, compute: F, ttl: Option<Duration>) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<T>> + Send,
    {
        if let Some(value) = self.get::<T>(key).await? {
            return Ok(value);
        }
        let value = compute().await.map_err(CacheError::compute)?;
        self.set(key, &value, ttl).await?;
        Ok(value)
    }
}

impl<C: Cache + ?Sized> CacheExt for C {}

/// Typed batch access for any [`EnhancedCache`].
#[async_trait]
pub trait EnhancedCacheExt: EnhancedCache {
    async fn get_many<T>(&self, keys: &[String]) -> Result<Vec<Option<T>>>
    where
        T: DeserializeOwned + Send,
    {
        self.get_many_bytes(keys)
            .await?
            .into_iter()
            .map(|bytes| bytes.map(|b| codec::decode(&b)).transpose())
            .collect()
    }

    async fn set_many<T>(&self, entries: &[(String, T)], ttl: Option<Duration>) -> Result<()>
    where
        T: Serialize + Sync,
    {
        let encoded = entries
            .iter()
            .map(|(key, value)| Ok((key.clone(), codec::encode(value)?)))
            .collect::<Result<Vec<_>>>()?;
        self.set_many_bytes(encoded, ttl).await
    }
}

impl<C: EnhancedCache + ?Sized> EnhancedCacheExt for C {}
