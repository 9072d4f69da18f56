//! tiered-cache: a unified caching engine.
//!
//! One registry hands out named caches of four kinds:
//!   basic (in-process), multi-tier (memory + remote, with promotion),
//!   single-flight (collapsed compute-on-miss) and semantic (near-duplicate
//!   suppression over embeddings).

pub mod cache;
pub mod config;
pub mod error;
pub mod remote;
pub mod server;

pub use cache::registry::CacheRegistry;
pub use error::{CacheError, Result};
