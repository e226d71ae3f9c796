//! Startup registration of personalized token limits.

use tracing::{debug, info, warn};

use super::store::{RateLimitStore, TokenLimitRecord};
use crate::config::TokenLimitConfig;
use crate::error::Result;

/// Write a limit record for every configured token.
///
/// Stops at the first serialization or store error, leaving the tokens
/// before it registered; the caller is expected to abort startup. Each write
/// is read back and compared, and a mismatch is logged but not fatal.
pub async fn register_tokens(store: &RateLimitStore, tokens: &[TokenLimitConfig]) -> Result<usize> {
    for config in tokens {
        let record = TokenLimitRecord::from(config);
        store.set_token_limit(&record).await?;

        match store.get_token_limit(&record.token).await? {
            Some(stored) if stored == record => {
                debug!(token = %record.token, limit = record.limit, "Registered token limit");
            }
            stored => {
                warn!(
                    token = %record.token,
                    expected = ?record,
                    stored = ?stored,
                    "Token limit read back differs from what was written"
                );
            }
        }
    }

    info!(count = tokens.len(), "Personalized token limits registered");
    Ok(tokens.len())
}
