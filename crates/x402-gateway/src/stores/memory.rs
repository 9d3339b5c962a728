//! In-memory store variants backed by `dashmap`. Authoritative only within
//! one process; entries are evicted lazily on read and by a periodic sweep.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{RateLimitResult, RateLimitStore, TimeSessionStore, VerificationCacheStore};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub struct MemoryRateLimitStore {
    counters: Arc<DashMap<String, (u32, i64)>>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        let counters: Arc<DashMap<String, (u32, i64)>> = Arc::new(DashMap::new());
        spawn_sweep(counters.clone(), |(_, expires_at)| *expires_at <= now_ms());
        Self { counters }
    }
}

impl Default for MemoryRateLimitStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn check(&self, key: &str, limit: u32, window_ms: u64) -> RateLimitResult {
        let now = now_ms();
        let mut entry = self.counters.entry(key.to_string()).or_insert((0, 0));
        if entry.1 <= now {
            *entry = (1, now + window_ms as i64);
        } else {
            entry.0 += 1;
        }
        let (count, expires_at) = *entry;
        RateLimitResult {
            allowed: count <= limit,
            remaining: limit.saturating_sub(count),
            limit,
            reset_ms: (expires_at - now).max(0) as u64,
        }
    }
}

pub struct MemoryVerificationCacheStore {
    entries: Arc<DashMap<String, (usize, i64)>>,
}

impl MemoryVerificationCacheStore {
    pub fn new() -> Self {
        let entries: Arc<DashMap<String, (usize, i64)>> = Arc::new(DashMap::new());
        spawn_sweep(entries.clone(), |(_, expires_at)| *expires_at <= now_ms());
        Self { entries }
    }
}

impl Default for MemoryVerificationCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VerificationCacheStore for MemoryVerificationCacheStore {
    async fn get(&self, key: &str) -> Option<usize> {
        let entry = self.entries.get(key)?;
        let (index, expires_at) = *entry;
        if expires_at <= now_ms() {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(index)
    }

    async fn set(&self, key: &str, requirement_index: usize, ttl_ms: u64) {
        self.entries
            .insert(key.to_string(), (requirement_index, now_ms() + ttl_ms as i64));
    }
}

pub struct MemoryTimeSessionStore {
    sessions: Arc<DashMap<String, i64>>,
}

impl MemoryTimeSessionStore {
    pub fn new() -> Self {
        let sessions: Arc<DashMap<String, i64>> = Arc::new(DashMap::new());
        spawn_sweep(sessions.clone(), |expires_at| *expires_at <= now_ms());
        Self { sessions }
    }
}

impl Default for MemoryTimeSessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TimeSessionStore for MemoryTimeSessionStore {
    async fn get(&self, key: &str) -> Option<i64> {
        let entry = self.sessions.get(key)?;
        let expires_at = *entry;
        if expires_at <= now_ms() {
            drop(entry);
            self.sessions.remove(key);
            return None;
        }
        Some(expires_at)
    }

    async fn set(&self, key: &str, expires_at_ms: i64) {
        self.sessions.insert(key.to_string(), expires_at_ms);
    }
}

/// Spawn a detached 60s sweep that removes entries matching `is_expired`.
/// Detached tasks are dropped on process exit, so this never blocks it.
fn spawn_sweep<V: Send + Sync + 'static>(
    map: Arc<DashMap<String, V>>,
    is_expired: impl Fn(&V) -> bool + Send + Sync + 'static,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            map.retain(|_, v| !is_expired(v));
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rate_limit_allows_up_to_limit_then_blocks() {
        let store = MemoryRateLimitStore::new();
        let r1 = store.check("k", 2, 60_000).await;
        let r2 = store.check("k", 2, 60_000).await;
        let r3 = store.check("k", 2, 60_000).await;
        assert!(r1.allowed && r2.allowed);
        assert!(!r3.allowed);
        assert_eq!(r3.remaining, 0);
    }

    #[tokio::test]
    async fn rate_limit_resets_after_window() {
        let store = MemoryRateLimitStore::new();
        let _ = store.check("k", 1, 1).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let r = store.check("k", 1, 1).await;
        assert!(r.allowed);
    }

    #[tokio::test]
    async fn verification_cache_hit_then_expiry() {
        let store = MemoryVerificationCacheStore::new();
        store.set("vc:route:payer", 1, 50).await;
        assert_eq!(store.get("vc:route:payer").await, Some(1));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.get("vc:route:payer").await, None);
    }

    #[tokio::test]
    async fn time_session_active_then_expired() {
        let store = MemoryTimeSessionStore::new();
        store.set("ts:route:payer", now_ms() + 50).await;
        assert!(store.get("ts:route:payer").await.is_some());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(store.get("ts:route:payer").await.is_none());
    }
}
