//! Rate-limited identities and store key naming.

use std::fmt;
use std::net::IpAddr;

use crate::error::{Result, TollgateError};

/// Key prefix for per-identity request logs.
pub const REQUEST_LOG_PREFIX: &str = "limiter:";
/// Key prefix for per-identity block flags.
pub const BLOCK_PREFIX: &str = "block:";
/// Key prefix for personalized token limit records.
pub const TOKEN_RECORD_PREFIX: &str = "token:";

/// The subject of a rate limit check: a client IP address or an API token.
///
/// Identities render as `ip:<addr>` or `token:<token>`, so an IP and a token
/// with the same text never share counters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    Ip(String),
    Token(String),
}

impl Identity {
    /// Create an IP identity, rejecting empty values.
    pub fn ip(addr: impl Into<String>) -> Result<Self> {
        let addr = addr.into();
        if addr.is_empty() {
            return Err(TollgateError::InvalidIdentity(
                "ip address must not be empty".to_string(),
            ));
        }
        Ok(Identity::Ip(addr))
    }

    /// Create a token identity, rejecting empty values.
    pub fn token(token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        if token.is_empty() {
            return Err(TollgateError::InvalidIdentity(
                "token must not be empty".to_string(),
            ));
        }
        Ok(Identity::Token(token))
    }

    pub fn from_ip_addr(addr: IpAddr) -> Self {
        Identity::Ip(addr.to_string())
    }

    pub fn is_token(&self) -> bool {
        matches!(self, Identity::Token(_))
    }

    /// The raw IP address or token, without the kind prefix.
    pub fn value(&self) -> &str {
        match self {
            Identity::Ip(addr) => addr,
            Identity::Token(token) => token,
        }
    }

    /// Store key of this identity's request log.
    pub fn request_log_key(&self) -> String {
        format!("{}{}", REQUEST_LOG_PREFIX, self)
    }

    /// Store key of this identity's block flag.
    pub fn block_key(&self) -> String {
        format!("{}{}", BLOCK_PREFIX, self)
    }
}

/// Store key of a token's personalized limit record.
pub fn token_record_key(token: &str) -> String {
    format!("{}{}", TOKEN_RECORD_PREFIX, token)
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Ip(addr) => write!(f, "ip:{}", addr),
            Identity::Token(token) => write!(f, "token:{}", token),
        }
    }
}
