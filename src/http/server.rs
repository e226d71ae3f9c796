//! HTTP server implementation.

use axum::http::HeaderName;
use axum::routing::get;
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::{admission_guard, parse_token_header, GuardState};
use crate::error::{Result, TollgateError};
use crate::ratelimit::RateLimiter;

/// HTTP server fronted by the admission guard.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The rate limiter instance
    rate_limiter: Arc<RateLimiter>,
    /// Header carrying the caller's token
    token_header: HeaderName,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(
        addr: SocketAddr,
        rate_limiter: Arc<RateLimiter>,
        token_header: &str,
    ) -> Result<Self> {
        Ok(Self {
            addr,
            rate_limiter,
            token_header: parse_token_header(token_header)?,
        })
    }

    /// Build the application router.
    pub fn router(&self) -> Router {
        router(self.rate_limiter.clone(), self.token_header.clone())
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let app = self.router();
        let listener = TcpListener::bind(self.addr).await?;

        info!(addr = %self.addr, "HTTP server listening");

        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                TollgateError::Io(e)
            })
    }
}

/// Application routes behind the admission guard, plus an unguarded health check.
pub fn router(rate_limiter: Arc<RateLimiter>, token_header: HeaderName) -> Router {
    let state = GuardState::new(rate_limiter, token_header);

    let guarded = Router::new()
        .route("/", get(index))
        .layer(middleware::from_fn_with_state(state, admission_guard));

    Router::new().route("/health", get(health)).merge(guarded)
}

async fn index() -> &'static str {
    "Hello, World!"
}

async fn health() -> &'static str {
    "OK"
}
