//! Cache entry types.
//!
//! An entry is owned by exactly one [`EntryStore`](crate::cache::store::EntryStore)
//! and only mutated through it. Recency and frequency are tracked with atomics so
//! a hit needs only a shard read lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;

/// Fixed per-entry overhead added to the payload size estimate.
const ENTRY_OVERHEAD_BYTES: usize = 64;

/// A single cached value with its bookkeeping.
#[derive(Debug)]
pub struct CacheEntry {
    /// Key, unique within its store.
    pub key: String,

    /// Opaque payload.
    pub value: Bytes,

    /// When the entry was written.
    pub inserted_at: Instant,

    /// Past this instant the entry is unreadable.
    pub expires_at: Option<Instant>,

    /// Approximate memory footprint in bytes.
    pub size_estimate: usize,

    /// Logical insertion tick (FIFO order, LFU tie-break).
    pub(crate) insert_seq: u64,

    /// Number of hits served.
    access_count: AtomicU64,

    /// Logical tick of the last hit (LRU order).
    last_access_seq: AtomicU64,

    /// Nanoseconds after `inserted_at` of the last hit.
    last_access_offset_nanos: AtomicU64,
}

impl CacheEntry {
    /// Create an entry stamped with the given logical tick.
    pub fn new(key: String, value: Bytes, ttl: Option<Duration>, seq: u64) -> Self {
        let now = Instant::now();
        let size_estimate = key.len() + value.len() + ENTRY_OVERHEAD_BYTES;
        Self {
            key,
            value,
            inserted_at: now,
            // A deadline past what `Instant` can represent never arrives.
            expires_at: ttl.and_then(|ttl| now.checked_add(ttl)),
            size_estimate,
            insert_seq: seq,
            access_count: AtomicU64::new(0),
            last_access_seq: AtomicU64::new(seq),
            last_access_offset_nanos: AtomicU64::new(0),
        }
    }

    /// Whether the entry has expired as of `now`.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    /// Record a hit, updating recency and frequency.
    pub fn record_access(&self, seq: u64) {
        self.access_count.fetch_add(1, Ordering::Relaxed);
        self.last_access_seq.fetch_max(seq, Ordering::Relaxed);
        let offset = self.inserted_at.elapsed().as_nanos().min(u64::MAX as u128) as u64;
        self.last_access_offset_nanos
            .fetch_max(offset, Ordering::Relaxed);
    }

    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    pub fn last_access_seq(&self) -> u64 {
        self.last_access_seq.load(Ordering::Relaxed)
    }

    pub fn last_accessed_at(&self) -> Instant {
        self.inserted_at
            + Duration::from_nanos(self.last_access_offset_nanos.load(Ordering::Relaxed))
    }

    /// Time left before expiry, `None` when the entry never expires.
    pub fn ttl_remaining(&self) -> Option<Duration> {
        self.expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Metadata snapshot for inspection.
    pub fn info(&self) -> EntryInfo {
        EntryInfo {
            key: self.key.clone(),
            size_estimate: self.size_estimate,
            access_count: self.access_count(),
            age_ms: self.inserted_at.elapsed().as_millis() as u64,
            idle_ms: self.last_accessed_at().elapsed().as_millis() as u64,
            ttl_remaining_ms: self.ttl_remaining().map(|d| d.as_millis() as u64),
        }
    }
}

/// Serializable view of an entry's metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryInfo {
    pub key: String,
    pub size_estimate: usize,
    pub access_count: u64,
    pub age_ms: u64,
    pub idle_ms: u64,
    pub ttl_remaining_ms: Option<u64>,
}
