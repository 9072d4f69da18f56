//! Eviction policy: decides which entry leaves a full store.
//!
//! Candidates are ranked so that the greatest candidate is evicted first:
//! - expired entries always outrank live ones, regardless of policy
//! - LRU: oldest last hit
//! - LFU: fewest hits, ties broken by oldest insertion
//! - FIFO: oldest insertion

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::cache::entry::CacheEntry;

/// Eviction policy, selectable per store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    #[default]
    Lru,
    Lfu,
    Fifo,
}

impl std::fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvictionPolicy::Lru => write!(f, "lru"),
            EvictionPolicy::Lfu => write!(f, "lfu"),
            EvictionPolicy::Fifo => write!(f, "fifo"),
        }
    }
}

/// An eviction candidate with its policy rank.
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub key: String,
    /// Insertion tick, used to confirm the victim was not replaced meanwhile.
    pub insert_seq: u64,
    pub expired: bool,
    /// Smaller values are evicted first.
    rank: (u64, u64),
}

impl EvictionCandidate {
    fn priority(&self) -> (bool, Reverse<(u64, u64)>) {
        (self.expired, Reverse(self.rank))
    }
}

// Greater = higher eviction priority.
impl PartialEq for EvictionCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.priority() == other.priority()
    }
}

impl Eq for EvictionCandidate {}

impl PartialOrd for EvictionCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EvictionCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority().cmp(&other.priority())
    }
}

/// The eviction policy engine.
#[derive(Debug, Clone, Copy)]
pub struct Evictor {
    policy: EvictionPolicy,
}

impl Evictor {
    pub fn new(policy: EvictionPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    /// Rank a single entry.
    pub fn candidate(&self, entry: &CacheEntry, now: Instant) -> EvictionCandidate {
        let rank = match self.policy {
            EvictionPolicy::Lru => (entry.last_access_seq(), entry.insert_seq),
            EvictionPolicy::Lfu => (entry.access_count(), entry.insert_seq),
            EvictionPolicy::Fifo => (entry.insert_seq, 0),
        };
        EvictionCandidate {
            key: entry.key.clone(),
            insert_seq: entry.insert_seq,
            expired: entry.is_expired_at(now),
            rank,
        }
    }

    /// Select up to `count` entries to evict.
    ///
    /// Returns candidates ordered by eviction priority (highest first).
    /// Keys in `protected` are never selected.
    pub fn select_victims<'a>(
        &self,
        entries: impl Iterator<Item = &'a CacheEntry>,
        count: usize,
        protected: &[&str],
    ) -> Vec<EvictionCandidate> {
        let now = Instant::now();
        let mut heap = BinaryHeap::new();

        for entry in entries {
            if protected.contains(&entry.key.as_str()) {
                continue;
            }
            heap.push(self.candidate(entry, now));
        }

        let mut victims = Vec::with_capacity(count);
        while victims.len() < count {
            match heap.pop() {
                Some(candidate) => victims.push(candidate),
                None => break,
            }
        }
        victims
    }

    /// The single best victim, if any.
    pub fn select_victim<'a>(
        &self,
        entries: impl Iterator<Item = &'a CacheEntry>,
        protected: &[&str],
    ) -> Option<EvictionCandidate> {
        let now = Instant::now();
        entries
            .filter(|entry| !protected.contains(&entry.key.as_str()))
            .map(|entry| self.candidate(entry, now))
            .max()
    }
}
