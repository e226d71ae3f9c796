//! Admission middleware.
//!
//! Identifies the caller by API token header, falling back to the peer IP,
//! and asks the rate limiter whether to let the request through. Limiter
//! errors fail closed with a 500.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderName, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, instrument};

use crate::error::{Result, TollgateError};
use crate::ratelimit::{Identity, RateLimiter};

/// Shared state for [`admission_guard`].
#[derive(Clone)]
pub struct GuardState {
    limiter: Arc<RateLimiter>,
    token_header: HeaderName,
}

impl GuardState {
    pub fn new(limiter: Arc<RateLimiter>, token_header: HeaderName) -> Self {
        Self {
            limiter,
            token_header,
        }
    }
}

/// Parse a configured header name, lowercasing it as HTTP/2 requires.
pub fn parse_token_header(name: &str) -> Result<HeaderName> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| TollgateError::Config(format!("invalid token header {:?}: {}", name, e)))
}

/// Work out who is calling.
///
/// A non-empty token header wins; otherwise the peer's IP address (without
/// port) is used.
pub fn extract_identity(
    headers: &HeaderMap,
    token_header: &HeaderName,
    peer: Option<SocketAddr>,
) -> Result<Identity> {
    if let Some(token) = headers
        .get(token_header)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|token| !token.is_empty())
    {
        return Identity::token(token);
    }

    peer.map(|addr| Identity::from_ip_addr(addr.ip()))
        .ok_or_else(|| TollgateError::InvalidIdentity("no peer address on request".to_string()))
}

impl IntoResponse for TollgateError {
    fn into_response(self) -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Internal Server Error: {}", self),
        )
            .into_response()
    }
}

fn too_many_requests(identity: &Identity) -> Response {
    let message = if identity.is_token() {
        "Your Token is temporarily blocked for exceeding the request limit."
    } else {
        "Your IP is temporarily blocked for exceeding the request limit."
    };
    (StatusCode::TOO_MANY_REQUESTS, message).into_response()
}

/// Axum middleware admitting or rejecting each request.
#[instrument(
    skip_all,
    fields(
        method = %request.method(),
        path = %request.uri().path()
    )
)]
pub async fn admission_guard(
    State(state): State<GuardState>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    let identity = match extract_identity(request.headers(), &state.token_header, peer) {
        Ok(identity) => identity,
        Err(e) => {
            error!(error = %e, "Could not identify caller");
            return e.into_response();
        }
    };

    match state.limiter.check_rate_limit(&identity).await {
        Ok(decision) if decision.is_admitted() => next.run(request).await,
        Ok(decision) => {
            debug!(identity = %identity, decision = ?decision, "Request denied");
            too_many_requests(&identity)
        }
        Err(e) => {
            error!(identity = %identity, error = %e, "Rate limit check failed");
            e.into_response()
        }
    }
}
