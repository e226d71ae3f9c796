//! Wall-clock abstraction so windows and TTLs can be driven manually in tests.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of "now" as time since the Unix epoch.
///
/// Request log scores are epoch seconds shared by every limiter instance, so
/// this is wall-clock time rather than a monotonic `Instant`.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;

    /// Current time as fractional epoch seconds, the unit of request log scores.
    fn now_secs(&self) -> f64 {
        self.now().as_secs_f64()
    }
}

/// Clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        // A clock set before 1970 reads as the epoch itself.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
    }
}

/// Manually advanced clock for tests.
///
/// Clones share the same underlying time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    current: Arc<RwLock<Duration>>,
}

impl ManualClock {
    pub fn new(start: Duration) -> Self {
        Self {
            current: Arc::new(RwLock::new(start)),
        }
    }

    /// Start at a whole number of epoch seconds.
    pub fn at_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    pub fn advance(&self, by: Duration) {
        *self.current.write() += by;
    }

    pub fn set(&self, to: Duration) {
        *self.current.write() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.current.read()
    }
}
