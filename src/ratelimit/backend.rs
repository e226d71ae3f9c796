//! Counting store trait for abstracting Redis and in-memory implementations.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// Inputs for an atomic sliding-window check.
///
/// All keys are fully namespaced; scores are epoch seconds.
#[derive(Debug, Clone)]
pub struct WindowCheck<'a> {
    pub log_key: &'a str,
    pub block_key: &'a str,
    pub now: f64,
    pub limit: u64,
    pub expiry_score: f64,
    pub member: &'a str,
    pub block_duration: Duration,
}

/// Result of an atomic sliding-window check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowOutcome {
    /// The block flag was already set
    Blocked,
    /// A marker was recorded
    Admitted,
    /// The log was full and the block flag has been set
    Exceeded,
}

/// Trait for counting store implementations.
///
/// This is the primitive set the limiter needs from a shared ordered-set and
/// key/value store. Every method is a single atomic store operation; failures
/// surface as `TollgateError::StoreUnavailable` and are never retried here.
#[async_trait]
pub trait CountingStore: Send + Sync {
    /// Add `member` with `score` to the ordered set at `key`. Returns the number added.
    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<u64>;

    /// Remove members scored within `[min, max]`. Returns the number removed.
    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64>;

    /// Cardinality of the ordered set at `key`; zero when absent.
    async fn zcard(&self, key: &str) -> Result<u64>;

    /// Set `key` to `value`, expiring after `ttl`.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Count how many of `keys` exist.
    async fn exists(&self, keys: &[&str]) -> Result<u64>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set `key` to `value` with no expiry.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Run block-check, prune, count and record/block as one atomic operation.
    ///
    /// Returns `None` when the store cannot do this, in which case the caller
    /// falls back to the individual primitives.
    async fn check_window_atomic(
        &self,
        _check: &WindowCheck<'_>,
    ) -> Result<Option<WindowOutcome>> {
        Ok(None)
    }
}
