//! Error types for the cache engine.
//!
//! Expected outcomes such as a cache miss are never errors: `get` returns
//! `Ok(None)`. Everything here is a real failure of the specific operation.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Result type alias using [`CacheError`].
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors produced by cache operations.
///
/// `Clone` so a single-flight can deliver the very same failure to every waiter.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// Remote tier unreachable.
    #[error("Connection to {tier} failed: {reason}")]
    ConnectionFailed { tier: String, reason: String },

    /// Payload could not be encoded (or is over the size limit).
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Payload could not be decoded.
    #[error("Deserialization failed: {0}")]
    Deserialization(String),

    /// Key required to exist but absent.
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// An operation or a single-flight wait exceeded its bound.
    #[error("Operation {operation} timed out after {elapsed:?}")]
    Timeout { operation: String, elapsed: Duration },

    /// Insert would exceed a hard cap and nothing could be evicted.
    #[error("Capacity exceeded in {cache}: max {max_size} entries")]
    CapacityExceeded { cache: String, max_size: usize },

    /// Construction-time configuration problem.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The caller-supplied compute function failed.
    #[error("Computation failed: {0}")]
    Compute(Arc<anyhow::Error>),

    /// A single-flight leader stopped without producing a result.
    #[error("Single-flight for key {0} aborted before completion")]
    FlightAborted(String),
}

impl CacheError {
    /// Wrap a compute failure.
    pub fn compute(err: anyhow::Error) -> Self {
        CacheError::Compute(Arc::new(err))
    }

    /// Whether this failure came from an unreachable or slow remote tier.
    ///
    /// Multi-tier caches degrade on these instead of failing the caller.
    pub fn is_remote_failure(&self) -> bool {
        matches!(
            self,
            CacheError::ConnectionFailed { .. } | CacheError::Timeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_failure_classification() {
        let conn = CacheError::ConnectionFailed {
            tier: "remote".into(),
            reason: "refused".into(),
        };
        assert!(conn.is_remote_failure());
        assert!(!CacheError::KeyNotFound("k".into()).is_remote_failure());
    }

    #[test]
    fn test_compute_error_is_shared_on_clone() {
        let err = CacheError::compute(anyhow::anyhow!("boom"));
        let cloned = err.clone();
        match (&err, &cloned) {
            (CacheError::Compute(a), CacheError::Compute(b)) => assert!(Arc::ptr_eq(a, b)),
            _ => panic!("expected compute errors"),
        }
        assert_eq!(cloned.to_string(), "Computation failed: boom");
    }
}
