//! Shared application state: config, stores, hook/pricing-fn registries,
//! the settlement strategy, and the outbound HTTP client.

use std::sync::Arc;

use crate::config::{GlobalConfig, StoreBackend};
use crate::hooks::HookRegistry;
use crate::payment::{FacilitatorStrategy, SettlementStrategy};
use crate::pricing::PriceFnRegistry;
use crate::stores::memory::{MemoryRateLimitStore, MemoryTimeSessionStore, MemoryVerificationCacheStore};
use crate::stores::shared::{RedisRateLimitStore, RedisTimeSessionStore, RedisVerificationCacheStore};
use crate::stores::{RateLimitStore, TimeSessionStore, VerificationCacheStore};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GlobalConfig>,
    pub http_client: reqwest::Client,
    pub rate_limit_store: Arc<dyn RateLimitStore>,
    pub verification_cache: Arc<dyn VerificationCacheStore>,
    pub time_session_store: Arc<dyn TimeSessionStore>,
    pub settlement_strategy: Arc<dyn SettlementStrategy>,
    pub hooks: Arc<HookRegistry>,
    pub price_fns: Arc<PriceFnRegistry>,
}

impl AppState {
    pub async fn new(config: GlobalConfig) -> Result<Self, StateInitError> {
        let http_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| StateInitError(e.to_string()))?;

        let (rate_limit_store, verification_cache, time_session_store): (
            Arc<dyn RateLimitStore>,
            Arc<dyn VerificationCacheStore>,
            Arc<dyn TimeSessionStore>,
        ) = match config.stores.backend {
            StoreBackend::Memory => (
                Arc::new(MemoryRateLimitStore::new()),
                Arc::new(MemoryVerificationCacheStore::new()),
                Arc::new(MemoryTimeSessionStore::new()),
            ),
            StoreBackend::Redis => {
                let url = config
                    .stores
                    .redis_url
                    .as_deref()
                    .ok_or_else(|| StateInitError("stores.redis_url is required for the redis backend".to_string()))?;
                let rate_limit = RedisRateLimitStore::connect(url)
                    .await
                    .map_err(|e| StateInitError(e.to_string()))?;
                let cache = RedisVerificationCacheStore::connect(url)
                    .await
                    .map_err(|e| StateInitError(e.to_string()))?;
                let session = RedisTimeSessionStore::connect(url)
                    .await
                    .map_err(|e| StateInitError(e.to_string()))?;
                (Arc::new(rate_limit), Arc::new(cache), Arc::new(session))
            }
        };

        let settlement_strategy: Arc<dyn SettlementStrategy> =
            Arc::new(FacilitatorStrategy::new(http_client.clone()));

        Ok(Self {
            config: Arc::new(config),
            http_client,
            rate_limit_store,
            verification_cache,
            time_session_store,
            settlement_strategy,
            hooks: Arc::new(HookRegistry::new()),
            price_fns: Arc::new(PriceFnRegistry::new()),
        })
    }
}

#[derive(Debug)]
pub struct StateInitError(pub String);

impl std::fmt::Display for StateInitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to initialize gateway state: {}", self.0)
    }
}

impl std::error::Error for StateInitError {}
