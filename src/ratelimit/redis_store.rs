//! Redis-backed counting store.
//!
//! Uses a multiplexed [`ConnectionManager`], which reconnects on failure and
//! is cheap to clone, so one store can be shared by every request task.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::time::Duration;
use tracing::{debug, info};

use super::backend::{CountingStore, WindowCheck, WindowOutcome};
use crate::error::{Result, TollgateError};

/// ZADD that keeps the set's expiry at its highest score, so the log of an
/// identity that stops calling is reclaimed by Redis.
///
/// KEYS: ordered set. ARGV: score, member. Returns the number added.
const ZADD_SCRIPT: &str = r#"
local added = redis.call('ZADD', KEYS[1], ARGV[1], ARGV[2])
local top = redis.call('ZRANGE', KEYS[1], -1, -1, 'WITHSCORES')
redis.call('EXPIREAT', KEYS[1], math.ceil(tonumber(top[2])))
return added
"#;

/// Sliding-window check as a single server-side script.
///
/// KEYS: request log, block flag.
/// ARGV: now, limit, expiry score, member, block seconds.
/// Returns 0 when already blocked, 1 when admitted, 2 when the limit was hit.
const WINDOW_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[2]) == 1 then
    return 0
end
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
local count = redis.call('ZCARD', KEYS[1])
if count < tonumber(ARGV[2]) then
    redis.call('ZADD', KEYS[1], ARGV[3], ARGV[4])
    local top = redis.call('ZRANGE', KEYS[1], -1, -1, 'WITHSCORES')
    redis.call('EXPIREAT', KEYS[1], math.ceil(tonumber(top[2])))
    return 1
end
redis.call('SET', KEYS[2], '', 'EX', ARGV[5])
return 2
"#;

impl From<redis::RedisError> for TollgateError {
    fn from(err: redis::RedisError) -> Self {
        TollgateError::StoreUnavailable(err.to_string())
    }
}

/// Redis implementation of [`CountingStore`].
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    zadd_script: Script,
    window_script: Script,
}

impl RedisStore {
    /// Connect to the Redis instance at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!(url = %url, "Connected to Redis counting store");
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self {
            conn,
            zadd_script: Script::new(ZADD_SCRIPT),
            window_script: Script::new(WINDOW_SCRIPT),
        }
    }
}

/// Render a score bound the way Redis expects, including infinities.
fn score_bound(score: f64) -> String {
    if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else if score == f64::INFINITY {
        "+inf".to_string()
    } else {
        score.to_string()
    }
}

/// TTLs are whole seconds; round sub-second remainders up so a flag never
/// expires early or gets a zero TTL.
fn ttl_secs(ttl: Duration) -> u64 {
    let secs = ttl.as_secs();
    if ttl.subsec_nanos() > 0 || secs == 0 {
        secs + 1
    } else {
        secs
    }
}

#[async_trait]
impl CountingStore for RedisStore {
    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let added: u64 = self
            .zadd_script
            .key(key)
            .arg(score)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;
        Ok(added)
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64> {
        let mut conn = self.conn.clone();
        let removed: u64 = redis::cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg(score_bound(min))
            .arg(score_bound(max))
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let count: u64 = redis::cmd("ZCARD").arg(key).query_async(&mut conn).await?;
        Ok(count)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn exists(&self, keys: &[&str]) -> Result<u64> {
        let mut conn = self.conn.clone();
        let count: u64 = redis::cmd("EXISTS").arg(keys).query_async(&mut conn).await?;
        Ok(count)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn check_window_atomic(
        &self,
        check: &WindowCheck<'_>,
    ) -> Result<Option<WindowOutcome>> {
        let mut conn = self.conn.clone();
        let code: i64 = self
            .window_script
            .key(check.log_key)
            .key(check.block_key)
            .arg(check.now)
            .arg(check.limit)
            .arg(check.expiry_score)
            .arg(check.member)
            .arg(ttl_secs(check.block_duration))
            .invoke_async(&mut conn)
            .await?;

        debug!(key = check.log_key, code, "Window script finished");

        match code {
            0 => Ok(Some(WindowOutcome::Blocked)),
            1 => Ok(Some(WindowOutcome::Admitted)),
            2 => Ok(Some(WindowOutcome::Exceeded)),
            other => Err(TollgateError::StoreUnavailable(format!(
                "unexpected window script result {}",
                other
            ))),
        }
    }
}
