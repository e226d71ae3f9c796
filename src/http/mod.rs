//! HTTP server and admission middleware.

mod middleware;
mod server;

pub use middleware::{admission_guard, extract_identity, parse_token_header, GuardState};
pub use server::{router, HttpServer};
