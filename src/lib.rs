//! Tollgate - Rate Limiting over a Shared Counter Store
//!
//! This crate implements fixed window and token bucket rate limiting on top
//! of an atomic counter store (in-process or Redis), and plugs the limiter
//! into axum as an explicit middleware step that answers over-limit callers
//! with `429 Too Many Requests`.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
