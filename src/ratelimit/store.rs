//! Rate limit store adapter.
//!
//! Translates the limiter's counting and blocking operations into the
//! [`CountingStore`] primitives, and owns key naming and the token limit
//! record format.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use super::backend::{CountingStore, WindowCheck, WindowOutcome};
use super::identity::{token_record_key, Identity};
use crate::config::TokenLimitConfig;
use crate::error::{Result, TollgateError};

/// A personalized limit as stored under `token:<token>`.
///
/// Written as `{"token", "limitReq", "lockDurationSeconds"?, "blockDurationSeconds"?}`.
/// Records that use `maxRequestsPerSecond` instead of `limitReq`, or that
/// carry no `token` field, are read as well.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenLimitRecord {
    #[serde(default)]
    pub token: String,

    #[serde(rename = "limitReq", alias = "maxRequestsPerSecond")]
    pub limit: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_duration_seconds: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_duration_seconds: Option<u64>,
}

impl TokenLimitRecord {
    pub fn new(token: impl Into<String>, limit: u64) -> Self {
        Self {
            token: token.into(),
            limit,
            lock_duration_seconds: None,
            block_duration_seconds: None,
        }
    }

    pub fn lock_duration(&self) -> Option<Duration> {
        self.lock_duration_seconds.map(Duration::from_secs)
    }

    pub fn block_duration(&self) -> Option<Duration> {
        self.block_duration_seconds.map(Duration::from_secs)
    }
}

impl From<&TokenLimitConfig> for TokenLimitRecord {
    fn from(config: &TokenLimitConfig) -> Self {
        Self {
            token: config.token.clone(),
            limit: config.max_requests,
            lock_duration_seconds: config.lock_duration_secs,
            block_duration_seconds: config.block_duration_secs,
        }
    }
}

/// The limiter's view of the counting store.
#[derive(Clone)]
pub struct RateLimitStore {
    backend: Arc<dyn CountingStore>,
}

impl RateLimitStore {
    pub fn new(backend: Arc<dyn CountingStore>) -> Self {
        Self { backend }
    }

    /// Record one admitted request that stops counting at `expiry_score`.
    pub async fn add_request_marker(
        &self,
        identity: &Identity,
        expiry_score: f64,
        unique_member: &str,
    ) -> Result<u64> {
        self.backend
            .zadd(&identity.request_log_key(), expiry_score, unique_member)
            .await
    }

    /// Remove every marker whose expiry is at or before `now`.
    pub async fn prune_expired(&self, identity: &Identity, now: f64) -> Result<u64> {
        let removed = self
            .backend
            .zrem_range_by_score(&identity.request_log_key(), f64::NEG_INFINITY, now)
            .await?;
        trace!(identity = %identity, removed, "Pruned expired request markers");
        Ok(removed)
    }

    /// Number of markers in the identity's request log.
    pub async fn count_active(&self, identity: &Identity) -> Result<u64> {
        self.backend.zcard(&identity.request_log_key()).await
    }

    pub async fn is_blocked(&self, identity: &Identity) -> Result<bool> {
        let block_key = identity.block_key();
        Ok(self.backend.exists(&[block_key.as_str()]).await? > 0)
    }

    /// Set the block flag for `block_duration`; blocking again restarts the TTL.
    pub async fn block(&self, identity: &Identity, block_duration: Duration) -> Result<()> {
        self.backend
            .set_ex(&identity.block_key(), "", block_duration)
            .await
    }

    /// Read a token's personalized limit, `None` when none is registered.
    pub async fn get_token_limit(&self, token: &str) -> Result<Option<TokenLimitRecord>> {
        let Some(payload) = self.backend.get(&token_record_key(token)).await? else {
            return Ok(None);
        };

        let record = serde_json::from_str(&payload).map_err(|source| {
            TollgateError::MalformedRecord {
                token: token.to_string(),
                source,
            }
        })?;
        Ok(Some(record))
    }

    pub async fn set_token_limit(&self, record: &TokenLimitRecord) -> Result<()> {
        let payload = serde_json::to_string(record).map_err(|source| {
            TollgateError::MalformedRecord {
                token: record.token.clone(),
                source,
            }
        })?;
        self.backend
            .set(&token_record_key(&record.token), &payload)
            .await
    }

    /// Run the whole window check in one store operation, if the backend can.
    pub async fn check_window_atomic(
        &self,
        identity: &Identity,
        now: f64,
        limit: u64,
        expiry_score: f64,
        unique_member: &str,
        block_duration: Duration,
    ) -> Result<Option<WindowOutcome>> {
        let log_key = identity.request_log_key();
        let block_key = identity.block_key();
        let check = WindowCheck {
            log_key: &log_key,
            block_key: &block_key,
            now,
            limit,
            expiry_score,
            member: unique_member,
            block_duration,
        };
        self.backend.check_window_atomic(&check).await
    }
}
