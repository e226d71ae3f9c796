//! Rate limiting logic and counting store access.

mod backend;
mod clock;
mod identity;
mod limiter;
mod memory;
mod redis_store;
mod store;
mod tokens;

pub use backend::{CountingStore, WindowCheck, WindowOutcome};
pub use clock::{Clock, ManualClock, SystemClock};
pub use identity::{token_record_key, Identity};
pub use limiter::{Decision, RateLimiter, ResolvedLimit};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use store::{RateLimitStore, TokenLimitRecord};
pub use tokens::register_tokens;
