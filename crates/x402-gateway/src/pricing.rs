//! Price resolution: match rules, token-based lookup, dynamic functions,
//! and the static fallback chain.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use regex::Regex;
use serde_json::Value;

use crate::config::{Defaults, MatchRule, PricingConfig, RouteConfig};
use crate::error::GatewayError;

/// The request-scoped context visible to match rules and dynamic functions.
pub struct PriceContext<'a> {
    pub body: &'a Option<Value>,
    pub headers: &'a HashMap<String, String>,
    pub query: &'a HashMap<String, String>,
    pub params: &'a HashMap<String, String>,
}

/// A dynamically-loaded pricing function. Real deployments wire a concrete
/// implementation in here; the gateway only needs the stable call shape.
#[async_trait]
pub trait PriceFn: Send + Sync {
    async fn price(&self, ctx: &PriceContext<'_>) -> Result<String, GatewayError>;
}

/// Caches loaded dynamic pricing functions by module path, loaded once.
#[derive(Default)]
pub struct PriceFnRegistry {
    loaded: DashMap<String, Arc<dyn PriceFn>>,
}

impl PriceFnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or overwrite) the implementation backing a module path.
    pub fn register(&self, module: impl Into<String>, f: Arc<dyn PriceFn>) {
        self.loaded.insert(module.into(), f);
    }

    fn get(&self, module: &str) -> Option<Arc<dyn PriceFn>> {
        self.loaded.get(module).map(|e| e.clone())
    }
}

/// Resolve the price string for a route, given the ordered resolution
/// chain: match rules -> token-based -> dynamic fn -> static fallback.
/// Returns `(price_string, pay_to_override)`.
pub async fn resolve_price(
    route: &RouteConfig,
    defaults: &Defaults,
    ctx: &PriceContext<'_>,
    registry: &PriceFnRegistry,
) -> Result<(String, Option<String>), GatewayError> {
    match &route.pricing {
        Some(PricingConfig::Match { rules }) => {
            if let Some((price, pay_to)) = evaluate_match_rules(rules, ctx)? {
                return Ok((price, pay_to));
            }
        }
        Some(PricingConfig::Token { models }) => {
            let model = ctx
                .body
                .as_ref()
                .and_then(|b| b.get("model"))
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    GatewayError::BadRequest(
                        "token-based route requires a non-empty \"model\" field in the body"
                            .to_string(),
                    )
                })?;
            if let Some(price) = models.get(model) {
                return Ok((price.clone(), None));
            }
            // Falls through to step 4 per the global default table being
            // just `defaults.price` when no route-level default exists.
        }
        Some(PricingConfig::Dynamic { module }) => {
            let f = registry
                .get(module)
                .ok_or_else(|| GatewayError::Internal(format!("pricing fn not loaded: {module}")))?;
            let price = f.price(ctx).await?;
            return Ok((normalize_numeric_price(price), None));
        }
        Some(PricingConfig::Time { price, .. }) => {
            return Ok((price.clone(), None));
        }
        None => {}
    }

    if let Some(price) = &route.price {
        return Ok((price.clone(), None));
    }
    if let Some(fallback) = &route.fallback {
        return Ok((fallback.clone(), None));
    }
    Ok((defaults.price.clone(), None))
}

/// Numeric dynamic-fn returns are prefixed with `$`; string returns pass
/// through unchanged.
fn normalize_numeric_price(raw: String) -> String {
    if raw.chars().all(|c| c.is_ascii_digit() || c == '.') && !raw.starts_with('$') {
        format!("${raw}")
    } else {
        raw
    }
}

fn evaluate_match_rules(
    rules: &[MatchRule],
    ctx: &PriceContext<'_>,
) -> Result<Option<(String, Option<String>)>, GatewayError> {
    for rule in rules {
        if rule_matches(rule, ctx)? {
            return Ok(Some((rule.price.clone(), rule.pay_to.clone())));
        }
    }
    Ok(None)
}

fn rule_matches(rule: &MatchRule, ctx: &PriceContext<'_>) -> Result<bool, GatewayError> {
    for (path, expected) in &rule.where_clause {
        let actual = resolve_dot_path(path, ctx);
        if !value_matches(expected, actual.as_ref()) {
            return Ok(false);
        }
    }
    Ok(true)
}

fn resolve_dot_path(path: &str, ctx: &PriceContext<'_>) -> Option<Value> {
    let mut parts = path.splitn(2, '.');
    let root = parts.next()?;
    let rest = parts.next().unwrap_or("");
    match root {
        "body" => dig(ctx.body.as_ref()?, rest),
        "headers" => ctx.headers.get(rest).map(|v| Value::String(v.clone())),
        "query" => ctx.query.get(rest).map(|v| Value::String(v.clone())),
        "params" => ctx.params.get(rest).map(|v| Value::String(v.clone())),
        _ => None,
    }
}

fn dig(value: &Value, path: &str) -> Option<Value> {
    if path.is_empty() {
        return Some(value.clone());
    }
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current.clone())
}

fn value_matches(expected: &Value, actual: Option<&Value>) -> bool {
    let Some(actual) = actual else { return false };
    match (expected, actual) {
        (Value::String(pattern), Value::String(s)) if pattern.contains('*') => {
            glob_matches(pattern, s)
        }
        _ => expected == actual,
    }
}

/// Compile a `*`-glob string value as an escaped regex with `.*`.
fn glob_matches(pattern: &str, value: &str) -> bool {
    let escaped = regex::escape(pattern).replace(r"\*", ".*");
    let full = format!("^{escaped}$");
    Regex::new(&full).map(|re| re.is_match(value)).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> Defaults {
        Defaults {
            price: "$0.01".into(),
            timeout_seconds: 30,
            rate_limit: None,
            verification_cache: None,
        }
    }

    fn route_with(pricing: Option<PricingConfig>) -> RouteConfig {
        RouteConfig {
            upstream: "api".into(),
            upstream_path: None,
            pricing,
            price: None,
            fallback: None,
            accepts: None,
            pay_to: None,
            facilitator: None,
            rate_limit: None,
            verification_cache: None,
            hooks: Default::default(),
            settlement: Default::default(),
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn match_rule_glob_fires_on_model_prefix() {
        let rules = vec![MatchRule {
            where_clause: HashMap::from([(
                "body.model".to_string(),
                Value::String("claude-haiku-*".to_string()),
            )]),
            price: "$0.005".into(),
            pay_to: None,
        }];
        let route = route_with(Some(PricingConfig::Match { rules }));
        let body = Some(serde_json::json!({"model": "claude-haiku-4-5-20251001"}));
        let headers = HashMap::new();
        let query = HashMap::new();
        let params = HashMap::new();
        let ctx = PriceContext {
            body: &body,
            headers: &headers,
            query: &query,
            params: &params,
        };
        let (price, pay_to) = resolve_price(&route, &defaults(), &ctx, &PriceFnRegistry::new())
            .await
            .unwrap();
        assert_eq!(price, "$0.005");
        assert!(pay_to.is_none());
    }

    #[tokio::test]
    async fn token_based_missing_model_is_bad_request() {
        let route = route_with(Some(PricingConfig::Token {
            models: HashMap::new(),
        }));
        let body = Some(serde_json::json!({}));
        let headers = HashMap::new();
        let query = HashMap::new();
        let params = HashMap::new();
        let ctx = PriceContext {
            body: &body,
            headers: &headers,
            query: &query,
            params: &params,
        };
        let err = resolve_price(&route, &defaults(), &ctx, &PriceFnRegistry::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::BadRequest(_)));
    }

    #[tokio::test]
    async fn token_based_looks_up_model_table() {
        let route = route_with(Some(PricingConfig::Token {
            models: HashMap::from([("gpt-4o".to_string(), "$0.02".to_string())]),
        }));
        let body = Some(serde_json::json!({"model": "gpt-4o"}));
        let headers = HashMap::new();
        let query = HashMap::new();
        let params = HashMap::new();
        let ctx = PriceContext {
            body: &body,
            headers: &headers,
            query: &query,
            params: &params,
        };
        let (price, _) = resolve_price(&route, &defaults(), &ctx, &PriceFnRegistry::new())
            .await
            .unwrap();
        assert_eq!(price, "$0.02");
    }

    #[tokio::test]
    async fn falls_back_to_global_default_price() {
        let route = route_with(None);
        let body = None;
        let headers = HashMap::new();
        let query = HashMap::new();
        let params = HashMap::new();
        let ctx = PriceContext {
            body: &body,
            headers: &headers,
            query: &query,
            params: &params,
        };
        let (price, _) = resolve_price(&route, &defaults(), &ctx, &PriceFnRegistry::new())
            .await
            .unwrap();
        assert_eq!(price, "$0.01");
    }

    #[test]
    fn glob_pattern_matches_prefix() {
        assert!(glob_matches("claude-haiku-*", "claude-haiku-4-5-20251001"));
        assert!(!glob_matches("claude-haiku-*", "claude-opus-4-1"));
    }
}
