//! Built-in endpoints that bypass paid-route logic entirely: discovery,
//! health, and metrics.

use actix_web::{web, HttpRequest, HttpResponse};

use crate::config::{resolve_facilitator_url, PricingConfig};
use crate::payment::resolve_accepts;
use crate::state::AppState;
use x402_core::security::constant_time_eq;

fn build_endpoints(state: &AppState) -> Vec<serde_json::Value> {
    state
        .config
        .routes
        .iter()
        .filter_map(|(key, route)| {
            let mut parts = key.splitn(2, ' ');
            let method = parts.next()?;
            let path = parts.next()?;

            let pricing_type = match &route.pricing {
                Some(PricingConfig::Match { .. }) => "match",
                Some(PricingConfig::Dynamic { .. }) => "dynamic",
                Some(PricingConfig::Token { .. }) => "dynamic",
                Some(PricingConfig::Time { .. }) => "static",
                None => "static",
            };
            let default_price = route
                .price
                .clone()
                .or_else(|| route.fallback.clone())
                .unwrap_or_else(|| state.config.defaults.price.clone());

            let accepts = resolve_accepts(route, &state.config);
            let accepts_json: Vec<serde_json::Value> = accepts
                .iter()
                .map(|a| {
                    let facilitator = resolve_facilitator_url(
                        &a.network,
                        &a.asset,
                        route.facilitator.as_ref(),
                        state.config.facilitator.as_ref(),
                    );
                    serde_json::json!({"asset": a.asset, "network": a.network, "facilitator": facilitator})
                })
                .collect();

            Some(serde_json::json!({
                "method": method,
                "path": path,
                "pricing": {"type": pricing_type, "defaultPrice": default_price},
                "accepts": accepts_json,
                "metadata": route.metadata,
            }))
        })
        .collect()
}

pub async fn discovery(state: web::Data<AppState>) -> HttpResponse {
    if !state.config.gateway.discovery.enabled {
        return HttpResponse::NotFound().finish();
    }

    HttpResponse::Ok().json(serde_json::json!({
        "x402Version": 2,
        "provider": "tollbooth",
        "endpoints": build_endpoints(&state),
    }))
}

/// A thin JSON transform of the discovery payload into an OpenAPI 3.1.0
/// skeleton: one path item per configured route, no request/response schemas.
pub async fn openapi(state: web::Data<AppState>) -> HttpResponse {
    if !state.config.gateway.discovery.enabled {
        return HttpResponse::NotFound().finish();
    }

    let mut paths = serde_json::Map::new();
    for endpoint in build_endpoints(&state) {
        let path = endpoint["path"].as_str().unwrap_or_default().to_string();
        let method = endpoint["method"]
            .as_str()
            .unwrap_or_default()
            .to_ascii_lowercase();
        let entry = paths.entry(path).or_insert_with(|| serde_json::json!({}));
        entry[method] = serde_json::json!({
            "summary": format!("{} (x402-priced)", endpoint["pricing"]["type"]),
            "responses": {
                "200": {"description": "success"},
                "402": {"description": "payment required"},
            },
        });
    }

    HttpResponse::Ok().json(serde_json::json!({
        "openapi": "3.1.0",
        "info": {"title": "tollbooth", "version": "1.0.0"},
        "paths": paths,
    }))
}

pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({"status": "ok"}))
}

pub async fn metrics(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    if let Some(expected) = &state.config.gateway.metrics_token {
        let provided = req
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        match provided {
            Some(token) if constant_time_eq(token.as_bytes(), expected.as_bytes()) => {}
            _ => return HttpResponse::Unauthorized().finish(),
        }
    }

    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4; charset=utf-8")
        .body(crate::metrics::render())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AcceptEntry, GlobalConfig, RouteConfig};
    use indexmap::IndexMap;

    fn route() -> RouteConfig {
        RouteConfig {
            upstream: "weather-api".into(),
            upstream_path: None,
            pricing: None,
            price: Some("$0.01".into()),
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

    #[actix_web::test]
    async fn discovery_lists_configured_routes() {
        let mut config = GlobalConfig {
            gateway: Default::default(),
            wallets: Default::default(),
            accepts: vec![AcceptEntry {
                asset: "USDC".into(),
                network: "base".into(),
            }],
            defaults: Default::default(),
            facilitator: None,
            settlement: None,
            stores: Default::default(),
            upstreams: Default::default(),
            routes: IndexMap::new(),
            hooks: Default::default(),
        };
        config.routes.insert("GET /weather".to_string(), route());
        let state = AppState::new(config).await.unwrap();
        let resp = discovery(web::Data::new(state)).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::OK);
    }

    #[actix_web::test]
    async fn health_reports_ok() {
        let resp = health().await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::OK);
    }
}
