//! Tollgate - HTTP Request-Admission Guard
//!
//! This crate decides, per incoming HTTP request, whether to admit it based
//! on a sliding-window request budget keyed by API token or client IP. All
//! counters and block flags live in a shared counting store (Redis in
//! production), so any number of instances can enforce the same limits.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
