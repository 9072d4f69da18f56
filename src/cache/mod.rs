//! Cache engine.
//!
//! - [`entry`]: CacheEntry and its access metadata
//! - [`evictor`]: LRU / LFU / FIFO victim selection
//! - [`store`]: sharded in-process Entry Store
//! - [`codec`]: payload encoding and zstd framing for remote tiers
//! - [`pattern`]: glob patterns for `delete_pattern`
//! - [`tiered`]: Tier coordinator (promotion, write policy, degraded mode)
//! - [`single_flight`]: collapses concurrent compute-on-miss calls
//! - [`similarity`]: embedding contract and similarity index
//! - [`semantic`]: near-duplicate suppressing cache
//! - [`registry`]: named instances and global statistics
//! - [`traits`]: capability interfaces shared by every variant

pub mod codec;
pub mod entry;
pub mod evictor;
pub mod pattern;
pub mod registry;
pub mod semantic;
pub mod similarity;
pub mod single_flight;
pub mod store;
pub mod tiered;
pub mod traits;

pub use registry::{CacheHandle, CacheRegistry, GlobalStats};
pub use semantic::{DedupOutcome, SemanticCache, SimilarMatch};
pub use single_flight::{FlightOptions, SingleFlightCache};
pub use store::{CacheStats, EntryStore};
pub use tiered::{PromotionStrategy, TieredCache, WritePolicy};
pub use traits::{Cache, CacheExt, EnhancedCache, EnhancedCacheExt};
