//! Pluggable TTL-based stores: rate limiter, verification cache, time
//! session. Each has a memory-backed and a shared (redis) variant with
//! equivalent atomicity semantics.

pub mod memory;
pub mod shared;

use async_trait::async_trait;

/// Result of a rate-limit `check`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: u32,
    pub limit: u32,
    pub reset_ms: u64,
}

#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Atomically increment `key`'s counter; arm the window TTL on the
    /// first increment. `allowed = count <= limit`.
    async fn check(&self, key: &str, limit: u32, window_ms: u64) -> RateLimitResult;
}

#[async_trait]
pub trait VerificationCacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<usize>;
    async fn set(&self, key: &str, requirement_index: usize, ttl_ms: u64);
}

#[async_trait]
pub trait TimeSessionStore: Send + Sync {
    /// Absolute expiry timestamp (unix millis), if an unexpired session exists.
    async fn get(&self, key: &str) -> Option<i64>;
    async fn set(&self, key: &str, expires_at_ms: i64);
}
