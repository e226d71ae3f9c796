//! Process-local counting store.
//!
//! Mirrors the Redis semantics the limiter relies on: empty ordered sets
//! disappear, keys with a TTL vanish once it elapses, and each method is
//! atomic with respect to the others. An ordered set expires at its highest
//! score, so the log of an identity that stops calling is reclaimed without
//! another check for it. State is not shared between processes, so this
//! backend only suits single-instance deployments and tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use super::backend::{CountingStore, WindowCheck, WindowOutcome};
use super::clock::{Clock, SystemClock};
use crate::error::{Result, TollgateError};

/// Expired keys are dropped from the map once every this many writes.
const SWEEP_INTERVAL: u64 = 1024;

#[derive(Debug, Clone)]
enum Value {
    Plain(String),
    /// member -> score
    Sorted(HashMap<String, f64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Duration>,
}

impl Entry {
    fn is_expired(&self, now: Duration) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory implementation of [`CountingStore`].
#[derive(Clone)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    writes: Arc<AtomicU64>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store whose TTLs are measured against `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            writes: Arc::new(AtomicU64::new(0)),
            clock,
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| !entry.is_expired(now));
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count a write, sweeping expired keys on every `SWEEP_INTERVAL`th one.
    fn record_write(&self, entries: &mut HashMap<String, Entry>, now: Duration) {
        if self.writes.fetch_add(1, Ordering::Relaxed) % SWEEP_INTERVAL != 0 {
            return;
        }
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        trace!(removed = before - entries.len(), "Swept expired keys");
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn wrong_type(key: &str) -> TollgateError {
    TollgateError::StoreUnavailable(format!(
        "WRONGTYPE operation against key {} holding the wrong kind of value",
        key
    ))
}

/// Drop `key` if its TTL has elapsed, then return it.
fn live<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
    now: Duration,
) -> Option<&'a mut Entry> {
    if entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

fn sorted_set<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
    now: Duration,
) -> Result<Option<&'a mut HashMap<String, f64>>> {
    match live(entries, key, now) {
        None => Ok(None),
        Some(Entry {
            value: Value::Sorted(members),
            ..
        }) => Ok(Some(members)),
        Some(_) => Err(wrong_type(key)),
    }
}

fn zadd_locked(
    entries: &mut HashMap<String, Entry>,
    key: &str,
    score: f64,
    member: &str,
    now: Duration,
) -> Result<u64> {
    if sorted_set(entries, key, now)?.is_none() {
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Sorted(HashMap::new()),
                expires_at: None,
            },
        );
    }
    let entry = live(entries, key, now).ok_or_else(|| wrong_type(key))?;

    // A set expires with its highest score. A score in the past, or one that
    // is not a valid time, expires it at once.
    let score_at = Duration::try_from_secs_f64(score).unwrap_or_default();
    entry.expires_at = Some(entry.expires_at.map_or(score_at, |at| at.max(score_at)));

    let Value::Sorted(members) = &mut entry.value else {
        return Err(wrong_type(key));
    };
    Ok(members.insert(member.to_string(), score).map_or(1, |_| 0))
}

fn zrem_range_locked(
    entries: &mut HashMap<String, Entry>,
    key: &str,
    min: f64,
    max: f64,
    now: Duration,
) -> Result<u64> {
    let Some(members) = sorted_set(entries, key, now)? else {
        return Ok(0);
    };
    let before = members.len();
    members.retain(|_, score| *score < min || *score > max);
    let removed = (before - members.len()) as u64;
    if members.is_empty() {
        entries.remove(key);
    }
    Ok(removed)
}

fn zcard_locked(entries: &mut HashMap<String, Entry>, key: &str, now: Duration) -> Result<u64> {
    Ok(sorted_set(entries, key, now)?.map_or(0, |members| members.len() as u64))
}

fn set_locked(
    entries: &mut HashMap<String, Entry>,
    key: &str,
    value: &str,
    expires_at: Option<Duration>,
) {
    entries.insert(
        key.to_string(),
        Entry {
            value: Value::Plain(value.to_string()),
            expires_at,
        },
    );
}

#[async_trait]
impl CountingStore for MemoryStore {
    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<u64> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        self.record_write(&mut entries, now);
        zadd_locked(&mut entries, key, score, member, now)
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64> {
        let now = self.clock.now();
        zrem_range_locked(&mut self.entries.lock(), key, min, max, now)
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let now = self.clock.now();
        zcard_locked(&mut self.entries.lock(), key, now)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        self.record_write(&mut entries, now);
        set_locked(&mut entries, key, value, Some(now + ttl));
        Ok(())
    }

    async fn exists(&self, keys: &[&str]) -> Result<u64> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        Ok(keys
            .iter()
            .filter(|key| live(&mut entries, key, now).is_some())
            .count() as u64)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        match live(&mut entries, key, now) {
            None => Ok(None),
            Some(Entry {
                value: Value::Plain(value),
                ..
            }) => Ok(Some(value.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        set_locked(&mut self.entries.lock(), key, value, None);
        Ok(())
    }

    async fn check_window_atomic(
        &self,
        check: &WindowCheck<'_>,
    ) -> Result<Option<WindowOutcome>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        self.record_write(&mut entries, now);

        if live(&mut entries, check.block_key, now).is_some() {
            return Ok(Some(WindowOutcome::Blocked));
        }

        zrem_range_locked(&mut entries, check.log_key, f64::NEG_INFINITY, check.now, now)?;
        let count = zcard_locked(&mut entries, check.log_key, now)?;
        trace!(key = check.log_key, count, limit = check.limit, "Atomic window check");

        if count < check.limit {
            zadd_locked(&mut entries, check.log_key, check.expiry_score, check.member, now)?;
            return Ok(Some(WindowOutcome::Admitted));
        }

        set_locked(&mut entries, check.block_key, "", Some(now + check.block_duration));
        Ok(Some(WindowOutcome::Exceeded))
    }
}
