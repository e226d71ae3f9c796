//! Core rate limiter implementation.
//!
//! A sliding-window log per identity: every admitted request leaves a marker
//! scored with the instant it stops counting, and each check prunes expired
//! markers before counting the rest. Breaching the limit sets a block flag
//! that denies the identity until its TTL runs out.
//!
//! The limiter keeps no mutable state of its own. Without `atomic_window`
//! the block-check, prune, count and record steps are separate store calls,
//! so concurrent requests for one identity can overshoot the limit by up to
//! the number of requests in flight.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::backend::WindowOutcome;
use super::clock::{Clock, SystemClock};
use super::identity::Identity;
use super::store::RateLimitStore;
use crate::config::{LimiterConfig, MissingTokenPolicy};
use crate::error::{Result, TollgateError};

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request was admitted and recorded
    Admitted,
    /// The identity was already blocked
    Blocked,
    /// The identity's log was full; it is now blocked
    LimitExceeded,
}

impl Decision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admitted)
    }
}

/// The limit that applies to one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedLimit {
    /// Requests allowed per lock window
    pub max_requests: u64,
    /// How long an admitted request counts against the budget
    pub lock_duration: Duration,
    /// How long a breaching identity stays blocked
    pub block_duration: Duration,
}

/// The admission decision engine.
///
/// Safe to share across tasks; all state lives in the store.
pub struct RateLimiter {
    store: RateLimitStore,
    config: LimiterConfig,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a rate limiter, rejecting invalid configuration.
    pub fn new(store: RateLimitStore, config: LimiterConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            clock: Arc::new(SystemClock),
        })
    }

    /// Replace the clock used for window scores.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &RateLimitStore {
        &self.store
    }

    /// Decide whether a request from `identity` is admitted.
    ///
    /// Store failures, missing token records (under the `reject` policy) and
    /// checks that exceed `check_timeout_ms` are returned as errors, never as
    /// an admit or deny. Dropping the returned future abandons the check.
    pub async fn check_rate_limit(&self, identity: &Identity) -> Result<Decision> {
        let timeout = self.config.check_timeout();
        match tokio::time::timeout(timeout, self.evaluate(identity)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(identity = %identity, timeout = ?timeout, "Rate limit check timed out");
                Err(TollgateError::StoreUnavailable(format!(
                    "rate limit check for {} timed out after {:?}",
                    identity, timeout
                )))
            }
        }
    }

    async fn evaluate(&self, identity: &Identity) -> Result<Decision> {
        if self.config.atomic_window {
            self.evaluate_atomic(identity).await
        } else {
            self.evaluate_stepwise(identity).await
        }
    }

    async fn evaluate_stepwise(&self, identity: &Identity) -> Result<Decision> {
        if self.store.is_blocked(identity).await? {
            debug!(identity = %identity, "Identity is blocked");
            return Ok(Decision::Blocked);
        }

        let now = self.clock.now_secs();
        self.store.prune_expired(identity, now).await?;
        let count = self.store.count_active(identity).await?;
        let limit = self.resolve_limit(identity).await?;

        trace!(
            identity = %identity,
            count = count,
            limit = limit.max_requests,
            "Checking rate limit"
        );

        if count < limit.max_requests {
            let expiry = now + limit.lock_duration.as_secs_f64();
            self.store
                .add_request_marker(identity, expiry, &self.unique_member())
                .await?;
            return Ok(Decision::Admitted);
        }

        self.store.block(identity, limit.block_duration).await?;
        warn!(
            identity = %identity,
            count = count,
            limit = limit.max_requests,
            block_secs = limit.block_duration.as_secs(),
            "Rate limit exceeded, identity blocked"
        );
        Ok(Decision::LimitExceeded)
    }

    async fn evaluate_atomic(&self, identity: &Identity) -> Result<Decision> {
        // Blocked identities never reach the token record lookup
        if self.store.is_blocked(identity).await? {
            debug!(identity = %identity, "Identity is blocked");
            return Ok(Decision::Blocked);
        }

        let limit = self.resolve_limit(identity).await?;
        let now = self.clock.now_secs();
        let expiry = now + limit.lock_duration.as_secs_f64();

        let outcome = self
            .store
            .check_window_atomic(
                identity,
                now,
                limit.max_requests,
                expiry,
                &self.unique_member(),
                limit.block_duration,
            )
            .await?;

        match outcome {
            Some(WindowOutcome::Admitted) => Ok(Decision::Admitted),
            Some(WindowOutcome::Blocked) => {
                debug!(identity = %identity, "Identity is blocked");
                Ok(Decision::Blocked)
            }
            Some(WindowOutcome::Exceeded) => {
                warn!(
                    identity = %identity,
                    limit = limit.max_requests,
                    block_secs = limit.block_duration.as_secs(),
                    "Rate limit exceeded, identity blocked"
                );
                Ok(Decision::LimitExceeded)
            }
            None => {
                debug!("Store has no atomic window check, using individual operations");
                self.evaluate_stepwise(identity).await
            }
        }
    }

    /// Resolve the limit for an identity.
    ///
    /// IPs get the configured default. Tokens get their personalized record,
    /// whose durations override the defaults when present; a token without a
    /// record is handled according to `missing_token_policy`.
    pub async fn resolve_limit(&self, identity: &Identity) -> Result<ResolvedLimit> {
        let defaults = ResolvedLimit {
            max_requests: self.config.ip_max_requests,
            lock_duration: self.config.lock_duration(),
            block_duration: self.config.block_duration(),
        };

        let token = match identity {
            Identity::Ip(_) => return Ok(defaults),
            Identity::Token(token) => token,
        };

        match self.store.get_token_limit(token).await? {
            Some(record) => Ok(ResolvedLimit {
                max_requests: record.limit,
                lock_duration: record
                    .lock_duration()
                    .filter(|d| !d.is_zero())
                    .unwrap_or(defaults.lock_duration),
                block_duration: record
                    .block_duration()
                    .filter(|d| !d.is_zero())
                    .unwrap_or(defaults.block_duration),
            }),
            None => match self.config.missing_token_policy {
                MissingTokenPolicy::Reject => Err(TollgateError::TokenNotFound(token.clone())),
                MissingTokenPolicy::DefaultLimit => Ok(ResolvedLimit {
                    max_requests: self.config.token_max_requests,
                    ..defaults
                }),
            },
        }
    }

    /// Marker member: nanosecond timestamp plus a random suffix, so requests
    /// landing in the same instant stay distinct.
    fn unique_member(&self) -> String {
        format!("{}-{}", self.clock.now().as_nanos(), Uuid::new_v4().simple())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::backend::CountingStore;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::memory::MemoryStore;
    use crate::ratelimit::store::TokenLimitRecord;
    use async_trait::async_trait;

    fn limiter_config(ip_max: u64, lock_secs: u64, block_secs: u64) -> LimiterConfig {
        LimiterConfig {
            ip_max_requests: ip_max,
            token_max_requests: 4,
            lock_duration_secs: lock_secs,
            block_duration_secs: block_secs,
            ..LimiterConfig::default()
        }
    }

    fn create_test_limiter(config: LimiterConfig) -> (RateLimiter, MemoryStore, ManualClock) {
        let clock = ManualClock::at_secs(1_700_000_000);
        let memory = MemoryStore::with_clock(Arc::new(clock.clone()));
        let store = RateLimitStore::new(Arc::new(memory.clone()));
        let limiter = RateLimiter::new(store, config)
            .unwrap()
            .with_clock(Arc::new(clock.clone()));
        (limiter, memory, clock)
    }

    fn ip(addr: &str) -> Identity {
        Identity::ip(addr).unwrap()
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let store = RateLimitStore::new(Arc::new(MemoryStore::new()));
        let result = RateLimiter::new(store, limiter_config(2, 1, 0));
        assert!(matches!(result, Err(TollgateError::Config(_))));
    }

    #[tokio::test]
    async fn test_admits_under_limit() {
        let (limiter, memory, _) = create_test_limiter(limiter_config(3, 1, 5));
        let identity = ip("10.0.0.1");

        let decision = limiter.check_rate_limit(&identity).await.unwrap();
        assert_eq!(decision, Decision::Admitted);
        assert_eq!(memory.zcard("limiter:ip:10.0.0.1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_limit_boundary() {
        let (limiter, _, _) = create_test_limiter(limiter_config(5, 10, 30));
        let identity = ip("10.0.0.1");

        // The 5th request brings the count to exactly the limit and is admitted
        for i in 1..=5 {
            let decision = limiter.check_rate_limit(&identity).await.unwrap();
            assert_eq!(decision, Decision::Admitted, "Request {} should be admitted", i);
        }

        // The 6th is denied and blocks the identity
        let decision = limiter.check_rate_limit(&identity).await.unwrap();
        assert_eq!(decision, Decision::LimitExceeded);
        assert!(limiter.store().is_blocked(&identity).await.unwrap());

        let decision = limiter.check_rate_limit(&identity).await.unwrap();
        assert_eq!(decision, Decision::Blocked);
    }

    #[tokio::test]
    async fn test_block_then_recover() {
        // limit=2, lock=1s, block=5s
        let (limiter, _, clock) = create_test_limiter(limiter_config(2, 1, 5));
        let identity = ip("10.0.0.1");

        assert!(limiter.check_rate_limit(&identity).await.unwrap().is_admitted());
        clock.advance(Duration::from_millis(300));
        assert!(limiter.check_rate_limit(&identity).await.unwrap().is_admitted());
        clock.advance(Duration::from_millis(300));

        let decision = limiter.check_rate_limit(&identity).await.unwrap();
        assert_eq!(decision, Decision::LimitExceeded);

        // Six seconds later the block has expired and the log has pruned
        clock.advance(Duration::from_secs(6));
        let decision = limiter.check_rate_limit(&identity).await.unwrap();
        assert_eq!(decision, Decision::Admitted);
    }

    #[tokio::test]
    async fn test_block_outlasts_window() {
        let (limiter, _, clock) = create_test_limiter(limiter_config(2, 1, 5));
        let identity = ip("10.0.0.1");

        for _ in 0..2 {
            limiter.check_rate_limit(&identity).await.unwrap();
        }
        assert_eq!(
            limiter.check_rate_limit(&identity).await.unwrap(),
            Decision::LimitExceeded
        );

        // Markers expire after 1s, but the block holds for the full 5s
        for _ in 0..4 {
            clock.advance(Duration::from_secs(1));
            assert_eq!(
                limiter.check_rate_limit(&identity).await.unwrap(),
                Decision::Blocked
            );
        }

        clock.advance(Duration::from_secs(1));
        assert!(limiter.check_rate_limit(&identity).await.unwrap().is_admitted());
    }

    #[tokio::test]
    async fn test_window_slides_per_request() {
        let (limiter, _, clock) = create_test_limiter(limiter_config(2, 10, 30));
        let identity = ip("10.0.0.1");

        assert!(limiter.check_rate_limit(&identity).await.unwrap().is_admitted());
        clock.advance(Duration::from_secs(6));
        assert!(limiter.check_rate_limit(&identity).await.unwrap().is_admitted());

        // Only the first marker has expired; one slot is free again
        clock.advance(Duration::from_millis(4500));
        assert!(limiter.check_rate_limit(&identity).await.unwrap().is_admitted());
        assert_eq!(
            limiter.check_rate_limit(&identity).await.unwrap(),
            Decision::LimitExceeded
        );
    }

    #[tokio::test]
    async fn test_identities_are_independent() {
        let (limiter, _, _) = create_test_limiter(limiter_config(1, 10, 30));

        assert!(limiter.check_rate_limit(&ip("10.0.0.1")).await.unwrap().is_admitted());
        assert!(limiter.check_rate_limit(&ip("10.0.0.2")).await.unwrap().is_admitted());
        assert!(!limiter.check_rate_limit(&ip("10.0.0.1")).await.unwrap().is_admitted());
        assert!(!limiter.check_rate_limit(&ip("10.0.0.2")).await.unwrap().is_admitted());
    }

    #[tokio::test]
    async fn test_token_uses_personalized_limit() {
        let (limiter, _, _) = create_test_limiter(limiter_config(1, 10, 30));
        limiter
            .store()
            .set_token_limit(&TokenLimitRecord::new("abc", 3))
            .await
            .unwrap();
        let identity = Identity::token("abc").unwrap();

        for _ in 0..3 {
            assert!(limiter.check_rate_limit(&identity).await.unwrap().is_admitted());
        }
        assert_eq!(
            limiter.check_rate_limit(&identity).await.unwrap(),
            Decision::LimitExceeded
        );
    }

    #[tokio::test]
    async fn test_token_record_overrides_durations() {
        let (limiter, _, _) = create_test_limiter(limiter_config(1, 10, 30));
        let mut record = TokenLimitRecord::new("abc", 2);
        record.lock_duration_seconds = Some(2);
        record.block_duration_seconds = Some(0);
        limiter.store().set_token_limit(&record).await.unwrap();

        let limit = limiter
            .resolve_limit(&Identity::token("abc").unwrap())
            .await
            .unwrap();
        assert_eq!(
            limit,
            ResolvedLimit {
                max_requests: 2,
                lock_duration: Duration::from_secs(2),
                // A zero override falls back to the default
                block_duration: Duration::from_secs(30),
            }
        );
    }

    #[tokio::test]
    async fn test_missing_token_rejected() {
        let (limiter, _, _) = create_test_limiter(limiter_config(1, 10, 30));
        let identity = Identity::token("unknown").unwrap();

        let result = limiter.check_rate_limit(&identity).await;
        assert!(matches!(result, Err(TollgateError::TokenNotFound(ref t)) if t == "unknown"));
    }

    #[tokio::test]
    async fn test_missing_token_falls_back_to_default() {
        let config = LimiterConfig {
            missing_token_policy: MissingTokenPolicy::DefaultLimit,
            ..limiter_config(1, 10, 30)
        };
        let (limiter, _, _) = create_test_limiter(config);
        let identity = Identity::token("unknown").unwrap();

        // token_max_requests is 4
        for _ in 0..4 {
            assert!(limiter.check_rate_limit(&identity).await.unwrap().is_admitted());
        }
        assert!(!limiter.check_rate_limit(&identity).await.unwrap().is_admitted());
    }

    #[tokio::test]
    async fn test_malformed_token_record_is_an_error() {
        let (limiter, memory, _) = create_test_limiter(limiter_config(1, 10, 30));
        memory.set("token:abc", "not json").await.unwrap();

        let result = limiter
            .check_rate_limit(&Identity::token("abc").unwrap())
            .await;
        assert!(matches!(result, Err(TollgateError::MalformedRecord { .. })));
    }

    /// Which primitive a [`FaultyStore`] fails on.
    #[derive(Clone, Copy, PartialEq)]
    enum Fault {
        Exists,
        Zcard,
        Zadd,
        Hang,
    }

    struct FaultyStore {
        inner: MemoryStore,
        fault: Fault,
    }

    impl FaultyStore {
        fn fail(&self, op: Fault) -> Result<()> {
            if self.fault == op {
                return Err(TollgateError::StoreUnavailable("connection refused".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl CountingStore for FaultyStore {
        async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<u64> {
            self.fail(Fault::Zadd)?;
            self.inner.zadd(key, score, member).await
        }
        async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64> {
            self.inner.zrem_range_by_score(key, min, max).await
        }
        async fn zcard(&self, key: &str) -> Result<u64> {
            self.fail(Fault::Zcard)?;
            self.inner.zcard(key).await
        }
        async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
            self.inner.set_ex(key, value, ttl).await
        }
        async fn exists(&self, keys: &[&str]) -> Result<u64> {
            self.fail(Fault::Exists)?;
            if self.fault == Fault::Hang {
                futures::future::pending::<()>().await;
            }
            self.inner.exists(keys).await
        }
        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: &str) -> Result<()> {
            self.inner.set(key, value).await
        }
    }

    fn faulty_limiter(fault: Fault) -> RateLimiter {
        let store = RateLimitStore::new(Arc::new(FaultyStore {
            inner: MemoryStore::new(),
            fault,
        }));
        RateLimiter::new(store, limiter_config(2, 1, 5)).unwrap()
    }

    #[tokio::test]
    async fn test_store_error_on_count_is_propagated() {
        let limiter = faulty_limiter(Fault::Zcard);
        let result = limiter.check_rate_limit(&ip("10.0.0.1")).await;
        assert!(matches!(result, Err(TollgateError::StoreUnavailable(_))));
    }

    #[tokio::test]
    async fn test_store_error_on_block_check_and_record_is_propagated() {
        for fault in [Fault::Exists, Fault::Zadd] {
            let limiter = faulty_limiter(fault);
            let result = limiter.check_rate_limit(&ip("10.0.0.1")).await;
            assert!(matches!(result, Err(TollgateError::StoreUnavailable(_))));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_store_times_out() {
        let limiter = faulty_limiter(Fault::Hang);
        let result = limiter.check_rate_limit(&ip("10.0.0.1")).await;
        assert!(matches!(
            result,
            Err(TollgateError::StoreUnavailable(ref msg)) if msg.contains("timed out")
        ));
    }

    #[tokio::test]
    async fn test_atomic_window_boundary() {
        let config = LimiterConfig {
            atomic_window: true,
            ..limiter_config(2, 1, 5)
        };
        let (limiter, _, clock) = create_test_limiter(config);
        let identity = ip("10.0.0.1");

        assert!(limiter.check_rate_limit(&identity).await.unwrap().is_admitted());
        assert!(limiter.check_rate_limit(&identity).await.unwrap().is_admitted());
        assert_eq!(
            limiter.check_rate_limit(&identity).await.unwrap(),
            Decision::LimitExceeded
        );
        assert_eq!(
            limiter.check_rate_limit(&identity).await.unwrap(),
            Decision::Blocked
        );

        clock.advance(Duration::from_secs(6));
        assert!(limiter.check_rate_limit(&identity).await.unwrap().is_admitted());
    }

    #[tokio::test]
    async fn test_atomic_window_blocked_token_skips_limit_lookup() {
        let config = LimiterConfig {
            atomic_window: true,
            ..limiter_config(2, 1, 5)
        };
        let (limiter, _, _) = create_test_limiter(config);
        let identity = Identity::token("revoked").unwrap();

        // Blocked while its record existed; the record has since been removed
        limiter
            .store()
            .block(&identity, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(
            limiter.check_rate_limit(&identity).await.unwrap(),
            Decision::Blocked
        );
    }

    #[tokio::test]
    async fn test_idle_identities_are_reclaimed() {
        let (limiter, memory, clock) = create_test_limiter(limiter_config(1, 1, 1));

        for i in 0..1000 {
            let identity = ip(&format!("10.{}.{}.1", i / 256, i % 256));
            assert!(limiter.check_rate_limit(&identity).await.unwrap().is_admitted());
        }
        assert_eq!(memory.len(), 1000);

        clock.advance(Duration::from_secs(3600));
        assert!(limiter.check_rate_limit(&ip("192.168.0.1")).await.unwrap().is_admitted());

        assert_eq!(memory.len(), 1);
    }

    #[tokio::test]
    async fn test_atomic_window_falls_back_without_script_support() {
        let store = RateLimitStore::new(Arc::new(FaultyStore {
            inner: MemoryStore::new(),
            fault: Fault::Zcard,
        }));
        let config = LimiterConfig {
            atomic_window: true,
            ..limiter_config(2, 1, 5)
        };
        let limiter = RateLimiter::new(store, config).unwrap();

        // FaultyStore keeps the default check_window_atomic, so the stepwise
        // path runs and hits the injected fault
        let result = limiter.check_rate_limit(&ip("10.0.0.1")).await;
        assert!(matches!(result, Err(TollgateError::StoreUnavailable(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_atomic_window_under_concurrency() {
        let config = LimiterConfig {
            atomic_window: true,
            ..limiter_config(5, 60, 60)
        };
        let (limiter, _, _) = create_test_limiter(config);
        let limiter = Arc::new(limiter);

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.check_rate_limit(&ip("10.0.0.1")).await })
            })
            .collect();

        let decisions = futures::future::join_all(handles).await;
        let admitted = decisions
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .filter(Decision::is_admitted)
            .count();
        assert_eq!(admitted, 5);
    }
}
