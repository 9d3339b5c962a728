//! User hooks: route-level overrides global, loaded once and cached by
//! module path. Each pipeline stage interprets the hook's return value
//! according to its own semantics.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::error::GatewayError;

pub struct HookContext<'a> {
    pub route_key: &'a str,
    pub body: &'a Option<Value>,
    pub headers: &'a HashMap<String, String>,
    pub query: &'a HashMap<String, String>,
    pub params: &'a HashMap<String, String>,
    /// Stage-specific extra payload (e.g. the resolved price, upstream status).
    pub extra: Value,
}

/// What a hook asked the pipeline to do.
#[derive(Debug, Clone)]
pub enum HookOutcome {
    Continue,
    Reject {
        status: u16,
        body: Option<Value>,
    },
    /// `onResponse`-only: override the default settle-on-success rule.
    SettlementDecision {
        settle: bool,
        reason: Option<String>,
    },
    /// `onResponse`-only: replace the upstream response entirely.
    ResponseOverride {
        status: u16,
        headers: HashMap<String, String>,
        body: Vec<u8>,
    },
}

#[async_trait]
pub trait Hook: Send + Sync {
    async fn call(&self, ctx: &HookContext<'_>) -> Result<HookOutcome, GatewayError>;
}

/// Caches loaded hook implementations by module path, loaded once.
#[derive(Default)]
pub struct HookRegistry {
    loaded: DashMap<String, Arc<dyn Hook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, module: impl Into<String>, hook: Arc<dyn Hook>) {
        self.loaded.insert(module.into(), hook);
    }

    fn get(&self, module: &str) -> Option<Arc<dyn Hook>> {
        self.loaded.get(module).map(|e| e.clone())
    }
}

/// Run the route-level hook if configured, else the global one, else a
/// no-op `Continue`. Route precedence always wins outright — the two are
/// never both invoked for the same stage.
pub async fn run_hook(
    registry: &HookRegistry,
    route_module: Option<&str>,
    global_module: Option<&str>,
    ctx: &HookContext<'_>,
) -> Result<HookOutcome, GatewayError> {
    let module = route_module.or(global_module);
    let Some(module) = module else {
        return Ok(HookOutcome::Continue);
    };
    let hook = registry
        .get(module)
        .ok_or_else(|| GatewayError::HookError(format!("hook not loaded: {module}")))?;
    hook.call(ctx).await.map_err(|e| match e {
        GatewayError::HookError(msg) => GatewayError::HookError(msg),
        other => GatewayError::HookError(other.to_string()),
    })
}
