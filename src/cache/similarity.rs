//! Similarity index over payload embeddings.
//!
//! Vectors are normalised on insert so similarity is a dot product. Search is
//! a linear scan: exact, O(n) per query.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;

use crate::error::{CacheError, Result};

/// Produces an embedding vector for a payload.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Fails with `Serialization` when the payload cannot be embedded.
    async fn embed(&self, payload: &[u8]) -> Result<Vec<f32>>;
}

/// Deterministic feature-hashing embedder.
///
/// Lowercased alphanumeric tokens are hashed into `dimensions` signed
/// buckets. Payloads sharing most tokens land close together, which is enough
/// for near-duplicate detection without a model.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, payload: &[u8]) -> Result<Vec<f32>> {
        let text = std::str::from_utf8(payload)
            .map_err(|e| CacheError::Serialization(format!("payload is not text: {e}")))?;

        let mut vector = vec![0.0f32; self.dimensions];
        let mut tokens = 0usize;
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let mut hasher = DefaultHasher::new();
            token.to_lowercase().hash(&mut hasher);
            let hash = hasher.finish();
            let bucket = (hash % self.dimensions as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
            tokens += 1;
        }

        if tokens == 0 {
            return Err(CacheError::Serialization(
                "payload has no embeddable tokens".into(),
            ));
        }
        Ok(vector)
    }
}

/// Cosine similarity; 0.0 for zero vectors or mismatched lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let norm_a = norm_a.sqrt();
    let norm_b = norm_b.sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

fn normalize(mut vector: Vec<f32>) -> Result<Vec<f32>> {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return Err(CacheError::Serialization(
            "embedding has no direction".into(),
        ));
    }
    for v in &mut vector {
        *v /= norm;
    }
    Ok(vector)
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// One indexed vector.
#[derive(Debug, Clone)]
pub struct SimilarityRecord {
    pub key: String,
    pub vector: Vec<f32>,
    /// Insertion order; larger is newer.
    pub seq: u64,
}

/// A search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarityHit {
    pub key: String,
    pub similarity: f32,
    #[serde(skip)]
    pub seq: u64,
}

#[derive(Debug, Default)]
pub struct SimilarityIndex {
    records: RwLock<HashMap<String, SimilarityRecord>>,
    seq: AtomicU64,
}

impl SimilarityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, key: &str, vector: Vec<f32>) -> SimilarityRecord {
        SimilarityRecord {
            key: key.to_string(),
            vector,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Index (or re-index) `key`.
    pub fn insert(&self, key: &str, vector: Vec<f32>) -> Result<()> {
        let record = self.record(key, normalize(vector)?);
        self.records.write().insert(key.to_string(), record);
        Ok(())
    }

    /// Index `key` unless another key is at least `threshold` similar.
    ///
    /// The check and the insert happen under one lock, so two concurrent
    /// near-duplicates cannot both get in. Returns the blocking match.
    pub fn insert_unless_similar(
        &self,
        key: &str,
        vector: Vec<f32>,
        threshold: f32,
    ) -> Result<Option<SimilarityHit>> {
        let vector = normalize(vector)?;
        let mut records = self.records.write();

        let best = records
            .values()
            .filter(|r| r.key != key)
            .map(|r| SimilarityHit {
                key: r.key.clone(),
                similarity: dot(&vector, &r.vector),
                seq: r.seq,
            })
            .filter(|hit| hit.similarity >= threshold)
            .max_by(|a, b| {
                a.similarity
                    .total_cmp(&b.similarity)
                    .then(a.seq.cmp(&b.seq))
            });
        if best.is_some() {
            return Ok(best);
        }

        let record = self.record(key, vector);
        records.insert(key.to_string(), record);
        Ok(None)
    }

    /// Keys at least `threshold` similar to `query`, most similar first; ties
    /// go to the most recently inserted.
    pub fn search(&self, query: &[f32], threshold: f32) -> Result<Vec<SimilarityHit>> {
        let query = normalize(query.to_vec())?;
        let records = self.records.read();

        let mut hits: Vec<SimilarityHit> = records
            .values()
            .map(|r| SimilarityHit {
                key: r.key.clone(),
                similarity: dot(&query, &r.vector),
                seq: r.seq,
            })
            .filter(|hit| hit.similarity >= threshold)
            .collect();
        hits.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then(b.seq.cmp(&a.seq))
        });
        Ok(hits)
    }

    pub fn remove(&self, key: &str) -> bool {
        self.records.write().remove(key).is_some()
    }

    /// Drop every record whose key fails `keep`.
    pub fn retain(&self, mut keep: impl FnMut(&str) -> bool) -> usize {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|key, _| keep(key));
        before - records.len()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records.read().contains_key(key)
    }

    pub fn clear(&self) {
        self.records.write().clear();
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
