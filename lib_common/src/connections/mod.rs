//! # Connections Module
//!
//! This module handles persistent connections to external services
//! including databases and the message broker. Every backing service is
//! reached through the same [`manager::connect`] routine: dial with capped
//! exponential backoff, verify liveness with a ping, hand ownership of the
//! live handle to the caller.

/// Retry policy and the capped-doubling backoff loop.
pub mod retry;

/// The generic connection manager and the `Dialer` capability.
pub mod manager;

/// Module for PostgreSQL database connection pooling and management.
pub mod db_postgres;

/// Module for Redis connection handling (used as the broker transport).
pub mod cache_redis;

pub use manager::{connect, ConnectError, Dialer, Endpoint, LiveConnection};
pub use retry::{retry_with_backoff, Exhausted, RetryPolicy};
