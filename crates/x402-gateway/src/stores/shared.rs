//! Redis-backed store variants for horizontal scaling. Same semantics as
//! the in-memory stores: atomic increment-with-TTL-on-first-write for the
//! rate limiter, last-write-wins-with-TTL for the cache and session store.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::{RateLimitResult, RateLimitStore, TimeSessionStore, VerificationCacheStore};

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[derive(Clone)]
pub struct RedisRateLimitStore {
    conn: ConnectionManager,
}

impl RedisRateLimitStore {
    pub async fn connect(url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    async fn check(&self, key: &str, limit: u32, window_ms: u64) -> RateLimitResult {
        let mut conn = self.conn.clone();
        let count: i64 = match conn.incr(key, 1).await {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(error = %e, "rate limit store incr failed");
                return RateLimitResult {
                    allowed: true,
                    remaining: limit,
                    limit,
                    reset_ms: window_ms,
                };
            }
        };
        if count == 1 {
            let _: Result<(), _> = conn.pexpire(key, window_ms as i64).await;
        } else {
            // Best-effort mitigation for a first-increment/TTL-set race: if
            // the key somehow has no TTL, arm one so it doesn't live forever.
            if let Ok(ttl) = conn.pttl::<_, i64>(key).await {
                if ttl <= 0 {
                    let _: Result<(), _> = conn.pexpire(key, window_ms as i64).await;
                }
            }
        }
        let reset_ms = conn.pttl::<_, i64>(key).await.unwrap_or(window_ms as i64).max(0) as u64;
        let count = count.max(0) as u32;
        RateLimitResult {
            allowed: count <= limit,
            remaining: limit.saturating_sub(count),
            limit,
            reset_ms,
        }
    }
}

#[derive(Clone)]
pub struct RedisVerificationCacheStore {
    conn: ConnectionManager,
}

impl RedisVerificationCacheStore {
    pub async fn connect(url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl VerificationCacheStore for RedisVerificationCacheStore {
    async fn get(&self, key: &str) -> Option<usize> {
        let mut conn = self.conn.clone();
        conn.get::<_, Option<usize>>(key).await.ok().flatten()
    }

    async fn set(&self, key: &str, requirement_index: usize, ttl_ms: u64) {
        let mut conn = self.conn.clone();
        let _: Result<(), _> = conn.set_ex(key, requirement_index, ttl_ms.max(1) / 1000 + 1).await;
    }
}

#[derive(Clone)]
pub struct RedisTimeSessionStore {
    conn: ConnectionManager,
}

impl RedisTimeSessionStore {
    pub async fn connect(url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl TimeSessionStore for RedisTimeSessionStore {
    async fn get(&self, key: &str) -> Option<i64> {
        let mut conn = self.conn.clone();
        conn.get::<_, Option<i64>>(key).await.ok().flatten()
    }

    async fn set(&self, key: &str, expires_at_ms: i64) {
        let mut conn = self.conn.clone();
        let ttl_ms = (expires_at_ms - now_ms()).max(1) as u64;
        let _: Result<(), _> = conn.set(key, expires_at_ms).await;
        let _: Result<(), _> = conn.pexpire(key, ttl_ms as i64).await;
    }
}
