//! The per-request gateway pipeline: route match through settlement,
//! wiring the router, price resolver, payment coordinator, stores, proxy,
//! client-IP resolution, and hooks together.

use std::collections::HashMap;
use std::time::Duration;

use actix_web::{web, HttpRequest, HttpResponse};
use bytes::Bytes;
use serde_json::Value;

use crate::client_ip::resolve_client_ip;
use crate::config::{FacilitatorConfig, PricingConfig, SettlementTiming};
use crate::error::GatewayError;
use crate::hooks::{run_hook, HookContext, HookOutcome};
use crate::payment::{
    build_requirements, decode_payment_signature, encode_settlement_header, resolve_accepts,
    resolve_pay_to, settle_payment, time_session_key, verification_cache_key, verify_payment,
    SettlementOutcome, SettlementStrategy, Verification,
};
use crate::pricing::{resolve_price, PriceContext};
use crate::proxy::{build_target_url, method_from_request, proxy_request, ProxyRequestSpec};
use crate::router::{match_route, rewrite_path};
use crate::state::AppState;
use x402_core::price::{is_free, parse_price};
use x402_core::{PaymentPayload, PaymentRequirements};

/// Entry point: runs the pipeline and fires `onError` (observational only)
/// on any error path before the taxonomy response is surfaced.
pub async fn handle_request(
    req: HttpRequest,
    body: Bytes,
    state: web::Data<AppState>,
) -> Result<HttpResponse, GatewayError> {
    let result = run_pipeline(&req, body, &state).await;
    if let Err(error) = &result {
        fire_on_error_hook(&req, &state, error).await;
    }
    result
}

async fn fire_on_error_hook(req: &HttpRequest, state: &AppState, error: &GatewayError) {
    let path = req.path();
    let method = req.method().as_str();
    let route_module = match_route(&state.config.routes, method, path)
        .ok()
        .and_then(|m| m.route.hooks.on_error.clone());
    if route_module.is_none() && state.config.hooks.on_error.is_none() {
        return;
    }
    let empty_body: Option<Value> = None;
    let empty_map: HashMap<String, String> = HashMap::new();
    let ctx = HookContext {
        route_key: path,
        body: &empty_body,
        headers: &empty_map,
        query: &empty_map,
        params: &empty_map,
        extra: serde_json::json!({"error": error.to_string()}),
    };
    // Observational only: the hook's return value and any error it raises
    // are discarded, it never changes what the caller sees.
    let _ = run_hook(
        &state.hooks,
        route_module.as_deref(),
        state.config.hooks.on_error.as_deref(),
        &ctx,
    )
    .await;
}

async fn run_pipeline(
    req: &HttpRequest,
    body: Bytes,
    state: &AppState,
) -> Result<HttpResponse, GatewayError> {
    let path = req.path().to_string();
    let method = req.method().as_str().to_string();

    // S1: match route.
    let matched = match_route(&state.config.routes, &method, &path)?;
    let route_key = matched.pattern_key.to_string();
    let route = matched.route.clone();
    let params = matched.params.clone();

    let query: HashMap<String, String> = req
        .query_string()
        .split('&')
        .filter(|s| !s.is_empty())
        .filter_map(|pair| {
            let mut kv = pair.splitn(2, '=');
            Some((
                urlencoding::decode(kv.next()?).ok()?.into_owned(),
                urlencoding::decode(kv.next().unwrap_or("")).ok()?.into_owned(),
            ))
        })
        .collect();

    let headers: HashMap<String, String> = req
        .headers()
        .iter()
        .filter_map(|(n, v)| Some((n.as_str().to_ascii_lowercase(), v.to_str().ok()?.to_string())))
        .collect();

    // S2: body buffer (parse failures leave body=None, never an error).
    let parsed_body: Option<Value> = if body.is_empty() {
        None
    } else {
        serde_json::from_slice(&body).ok()
    };

    // S3: identity.
    let signature_header = headers.get("payment-signature").cloned();
    let payload = signature_header
        .as_deref()
        .map(decode_payment_signature)
        .transpose()?;
    let identity = match payload.as_ref().and_then(|p| p.payer()) {
        Some(addr) => format!("payer:{addr}"),
        None => {
            let socket_addr = req
                .peer_addr()
                .map(|a| a.ip())
                .unwrap_or_else(|| "0.0.0.0".parse().unwrap());
            let header_lookup = |name: &str| headers.get(name).cloned();
            let ip = resolve_client_ip(&state.config.gateway.trust_proxy, socket_addr, &header_lookup);
            format!("ip:{ip}")
        }
    };

    // S4: rate limit.
    let rate_limit_cfg = route.rate_limit.as_ref().or(state.config.defaults.rate_limit.as_ref());
    if let Some(rl) = rate_limit_cfg {
        let window_ms = crate::config::parse_window_ms(&rl.window)
            .map_err(|e| GatewayError::Internal(e.to_string()))?;
        let key = format!("{route_key}:{identity}");
        let result = state.rate_limit_store.check(&key, rl.requests, window_ms).await;
        if !result.allowed {
            crate::metrics::RATE_LIMIT_BLOCKS
                .with_label_values(&[route_key.as_str()])
                .inc();
            return Err(GatewayError::RateLimited {
                retry_after_secs: result.reset_ms / 1000,
            });
        }
    }

    // S5: onRequest hook.
    let hook_ctx = HookContext {
        route_key: &route_key,
        body: &parsed_body,
        headers: &headers,
        query: &query,
        params: &params,
        extra: Value::Null,
    };
    if let HookOutcome::Reject { status, body } = run_hook(
        &state.hooks,
        route.hooks.on_request.as_deref(),
        state.config.hooks.on_request.as_deref(),
        &hook_ctx,
    )
    .await?
    {
        return Ok(terminal_response(status, body));
    }

    // S6: resolve price.
    let price_ctx = PriceContext {
        body: &parsed_body,
        headers: &headers,
        query: &query,
        params: &params,
    };
    let (price_str, rule_pay_to) =
        resolve_price(&route, &state.config.defaults, &price_ctx, &state.price_fns).await?;

    let accepts = resolve_accepts(&route, &state.config);
    let primary_asset = accepts
        .first()
        .map(|a| a.asset.clone())
        .unwrap_or_else(|| "USDC".to_string());
    let primary_network = accepts
        .first()
        .map(|a| a.network.clone())
        .unwrap_or_else(|| "base".to_string());
    let amount = parse_price(&price_str, &primary_asset)
        .map_err(|e| GatewayError::Internal(e.to_string()))?;

    let upstream = state
        .config
        .upstreams
        .get(&route.upstream)
        .ok_or_else(|| GatewayError::Internal(format!("unknown upstream {:?}", route.upstream)))?;
    let upstream_path_template = route.upstream_path.clone().unwrap_or_else(|| path.clone());
    let upstream_path = rewrite_path(&upstream_path_template, &params, &query)?;
    let query_string = req.query_string().to_string();
    let target_url = build_target_url(&upstream.url, &upstream_path, &query_string);
    let timeout = Duration::from_secs(
        upstream
            .timeout_seconds
            .unwrap_or(state.config.defaults.timeout_seconds),
    );

    if is_free(&amount) {
        // Zero-priced routes bypass S7-S9 and proxy without a signature.
        return proxy_only(state, req, &route_key, &target_url, body, &upstream.headers, timeout).await;
    }

    // S7: onPriceResolved hook.
    let hook_ctx = HookContext {
        route_key: &route_key,
        body: &parsed_body,
        headers: &headers,
        query: &query,
        params: &params,
        extra: serde_json::json!({"price": price_str}),
    };
    if let HookOutcome::Reject { status, body } = run_hook(
        &state.hooks,
        route.hooks.on_price_resolved.as_deref(),
        state.config.hooks.on_price_resolved.as_deref(),
        &hook_ctx,
    )
    .await?
    {
        return Ok(terminal_response(status, body));
    }

    // S8: build requirements.
    let pay_to = resolve_pay_to(
        rule_pay_to.as_deref(),
        route.pay_to.as_deref(),
        &state.config,
        &primary_network,
    )
    .ok_or_else(|| GatewayError::Internal("no payTo wallet configured".to_string()))?;
    let requirements = build_requirements(
        accepts,
        &amount,
        &pay_to,
        &path,
        &route_key,
        state.config.defaults.timeout_seconds,
    );

    let Some(payload) = payload else {
        crate::metrics::PAYMENT_OUTCOMES.with_label_values(&["missing"]).inc();
        return Err(GatewayError::PaymentMissing(requirements));
    };

    let is_time_based = matches!(route.pricing, Some(PricingConfig::Time { .. }));
    let session_key = time_session_key(&route_key, &identity);
    let active_session = if is_time_based {
        state.time_session_store.get(&session_key).await
    } else {
        None
    };

    // Verify (cache-aware).
    let cache_key = verification_cache_key(&route_key, &identity);
    let is_payer_identity = identity.starts_with("payer:");
    let vc_config = route
        .verification_cache
        .as_ref()
        .or(state.config.defaults.verification_cache.as_ref());
    let vc_enabled = vc_config.map(|c| c.enabled).unwrap_or(false) && is_payer_identity;

    let (requirement_index, facilitator_url_for_settle) = if vc_enabled {
        if let Some(cached_index) = state.verification_cache.get(&cache_key).await {
            crate::metrics::VERIFICATION_CACHE.with_label_values(&["hit"]).inc();
            let index = if cached_index < requirements.len() {
                cached_index
            } else {
                tracing::warn!(
                    route = %route_key,
                    "verification cache index {} is stale relative to {} configured requirements; falling back to 0",
                    cached_index,
                    requirements.len()
                );
                0
            };
            let facilitator_url = crate::config::resolve_facilitator_url(
                &requirements[index].network,
                &requirements[index].asset,
                route.facilitator.as_ref(),
                state.config.facilitator.as_ref(),
            );
            (index, facilitator_url)
        } else {
            crate::metrics::VERIFICATION_CACHE.with_label_values(&["miss"]).inc();
            let (verification, facilitator_url) = verify_with_metrics(
                state.settlement_strategy.as_ref(),
                &payload,
                &requirements,
                route.facilitator.as_ref(),
                state.config.facilitator.as_ref(),
            )
            .await?;
            state
                .verification_cache
                .set(
                    &cache_key,
                    verification.requirement_index,
                    vc_config
                        .and_then(|c| crate::config::parse_window_ms(&c.ttl).ok())
                        .unwrap_or(60_000),
                )
                .await;
            (verification.requirement_index, facilitator_url)
        }
    } else {
        let (verification, facilitator_url) = verify_with_metrics(
            state.settlement_strategy.as_ref(),
            &payload,
            &requirements,
            route.facilitator.as_ref(),
            state.config.facilitator.as_ref(),
        )
        .await?;
        (verification.requirement_index, facilitator_url)
    };
    let requirement = requirements[requirement_index].clone();

    let skip_settlement_for_session = active_session.is_some();

    match route.settlement {
        SettlementTiming::BeforeResponse => {
            let settlement = if skip_settlement_for_session {
                None
            } else {
                let outcome = settle_with_metrics(
                    state.settlement_strategy.as_ref(),
                    &facilitator_url_for_settle,
                    &payload,
                    &requirement,
                )
                .await?;
                crate::metrics::SETTLEMENT_OUTCOMES.with_label_values(&["success"]).inc();

                // Settle, then onSettled, then proxy.
                let hook_ctx = HookContext {
                    route_key: &route_key,
                    body: &parsed_body,
                    headers: &headers,
                    query: &query,
                    params: &params,
                    extra: settlement_outcome_json(&outcome),
                };
                if let HookOutcome::Reject { status, body } = run_hook(
                    &state.hooks,
                    route.hooks.on_settled.as_deref(),
                    state.config.hooks.on_settled.as_deref(),
                    &hook_ctx,
                )
                .await?
                {
                    return Ok(terminal_response(status, body));
                }

                Some(outcome)
            };

            if is_time_based && !skip_settlement_for_session {
                if let Some(PricingConfig::Time { duration, .. }) = &route.pricing {
                    if let Ok(duration_ms) = crate::config::parse_window_ms(duration) {
                        let expires_at = now_ms() + duration_ms as i64;
                        state.time_session_store.set(&session_key, expires_at).await;
                    }
                }
            }

            crate::metrics::PAYMENT_OUTCOMES.with_label_values(&["success"]).inc();
            let mut response =
                proxy_only(state, req, &route_key, &target_url, body, &upstream.headers, timeout).await?;
            if let Some(outcome) = &settlement {
                response.headers_mut().insert(
                    actix_web::http::header::HeaderName::from_static("payment-response"),
                    actix_web::http::header::HeaderValue::from_str(&encode_settlement_header(outcome))
                        .unwrap(),
                );
            }
            Ok(response)
        }
        SettlementTiming::AfterResponse => {
            let response =
                proxy_only(state, req, &route_key, &target_url, body, &upstream.headers, timeout).await;

            match response {
                Err(GatewayError::UpstreamUnreachable(msg)) => {
                    Ok(settlement_skipped_response(
                        actix_web::http::StatusCode::BAD_GATEWAY,
                        serde_json::json!({
                            "error": msg,
                            "hint": "check that the route's upstream URL is reachable from the gateway",
                        }),
                        "upstream_unreachable",
                    ))
                }
                Err(other) => Err(other),
                Ok(mut resp) => {
                    let status = resp.status().as_u16();
                    let hook_ctx = HookContext {
                        route_key: &route_key,
                        body: &parsed_body,
                        headers: &headers,
                        query: &query,
                        params: &params,
                        extra: serde_json::json!({"upstreamStatus": status}),
                    };
                    let hook_outcome = run_hook(
                        &state.hooks,
                        route.hooks.on_response.as_deref(),
                        state.config.hooks.on_response.as_deref(),
                        &hook_ctx,
                    )
                    .await?;

                    // A response override replaces resp outright; the default
                    // settle-on-success rule is then applied to its status.
                    let status = if let HookOutcome::ResponseOverride {
                        status: new_status,
                        headers: new_headers,
                        body: new_body,
                    } = &hook_outcome
                    {
                        resp = build_override_response(*new_status, new_headers, new_body.clone());
                        *new_status
                    } else {
                        status
                    };

                    let (should_settle, skip_reason) = match hook_outcome {
                        HookOutcome::SettlementDecision { settle, reason } => (settle, reason),
                        _ if status >= 500 => (false, Some("upstream_5xx".to_string())),
                        _ => (true, None),
                    };

                    if skip_settlement_for_session {
                        return Ok(resp);
                    }

                    if should_settle {
                        let outcome = settle_with_metrics(
                            state.settlement_strategy.as_ref(),
                            &facilitator_url_for_settle,
                            &payload,
                            &requirement,
                        )
                        .await?;
                        crate::metrics::SETTLEMENT_OUTCOMES.with_label_values(&["success"]).inc();
                        crate::metrics::PAYMENT_OUTCOMES.with_label_values(&["success"]).inc();

                        let settled_ctx = HookContext {
                            route_key: &route_key,
                            body: &parsed_body,
                            headers: &headers,
                            query: &query,
                            params: &params,
                            extra: settlement_outcome_json(&outcome),
                        };
                        if let HookOutcome::Reject { status, body } = run_hook(
                            &state.hooks,
                            route.hooks.on_settled.as_deref(),
                            state.config.hooks.on_settled.as_deref(),
                            &settled_ctx,
                        )
                        .await?
                        {
                            return Ok(terminal_response(status, body));
                        }

                        resp.headers_mut().insert(
                            actix_web::http::header::HeaderName::from_static("payment-response"),
                            actix_web::http::header::HeaderValue::from_str(&encode_settlement_header(
                                &outcome,
                            ))
                            .unwrap(),
                        );
                    } else if let Some(reason) = skip_reason {
                        resp.headers_mut().insert(
                            actix_web::http::header::HeaderName::from_static(
                                "x-tollbooth-settlement-skipped",
                            ),
                            actix_web::http::header::HeaderValue::from_str(
                                &serde_json::json!({"reason": reason}).to_string(),
                            )
                            .unwrap(),
                        );
                    }
                    Ok(resp)
                }
            }
        }
    }
}

/// Verify, incrementing `payment_outcomes{rejected}` when the facilitator
/// (or every facilitator in the fallback chain) rejects the payment.
async fn verify_with_metrics(
    strategy: &dyn SettlementStrategy,
    payload: &PaymentPayload,
    requirements: &[PaymentRequirements],
    route_facilitator: Option<&FacilitatorConfig>,
    global_facilitator: Option<&FacilitatorConfig>,
) -> Result<(Verification, String), GatewayError> {
    verify_payment(strategy, payload, requirements, route_facilitator, global_facilitator)
        .await
        .map_err(|e| {
            if matches!(e, GatewayError::PaymentInvalid { .. }) {
                crate::metrics::PAYMENT_OUTCOMES.with_label_values(&["rejected"]).inc();
            }
            e
        })
}

/// Settle, incrementing `settlement_outcomes{failure}` when the facilitator
/// reports `success: false`.
async fn settle_with_metrics(
    strategy: &dyn SettlementStrategy,
    facilitator_url: &str,
    payload: &PaymentPayload,
    requirement: &PaymentRequirements,
) -> Result<SettlementOutcome, GatewayError> {
    settle_payment(strategy, facilitator_url, payload, requirement)
        .await
        .map_err(|e| {
            if matches!(e, GatewayError::PaymentSettleFailed(_)) {
                crate::metrics::SETTLEMENT_OUTCOMES.with_label_values(&["failure"]).inc();
            }
            e
        })
}

async fn proxy_only(
    state: &AppState,
    req: &HttpRequest,
    route_key: &str,
    target_url: &str,
    body: Bytes,
    upstream_headers: &HashMap<String, String>,
    timeout: Duration,
) -> Result<HttpResponse, GatewayError> {
    let method = method_from_request(req)?;
    let method_label = req.method().as_str().to_string();

    if let Some(host) = url::Url::parse(target_url).ok().and_then(|u| u.host_str().map(str::to_string)) {
        crate::validation::validate_resolved_ip(&host).await?;
    }

    let start = std::time::Instant::now();
    let result = proxy_request(
        &state.http_client,
        ProxyRequestSpec {
            method,
            url: target_url.to_string(),
            client_headers: req.headers(),
            extra_headers: upstream_headers,
            body,
        },
        timeout,
    )
    .await;
    crate::metrics::PROXY_LATENCY.observe(start.elapsed().as_secs_f64());

    let status_label = match &result {
        Ok(resp) => resp.status().as_u16().to_string(),
        Err(GatewayError::UpstreamTimeout(_)) | Err(GatewayError::UpstreamUnreachable(_)) => {
            "502".to_string()
        }
        Err(_) => "500".to_string(),
    };
    crate::metrics::REQUESTS_TOTAL
        .with_label_values(&[&method_label, route_key, &status_label])
        .inc();

    result
}

fn terminal_response(status: u16, body: Option<Value>) -> HttpResponse {
    let status_code =
        actix_web::http::StatusCode::from_u16(status).unwrap_or(actix_web::http::StatusCode::FORBIDDEN);
    match body {
        Some(b) => HttpResponse::build(status_code).json(b),
        None => HttpResponse::build(status_code).finish(),
    }
}

fn settlement_outcome_json(outcome: &SettlementOutcome) -> Value {
    serde_json::json!({"settlement": {
        "payer": outcome.payer,
        "amount": outcome.amount,
        "transaction": outcome.transaction,
        "network": outcome.network,
    }})
}

/// Build a response from an `onResponse` hook's `ResponseOverride` outcome.
fn build_override_response(status: u16, headers: &HashMap<String, String>, body: Vec<u8>) -> HttpResponse {
    let status_code =
        actix_web::http::StatusCode::from_u16(status).unwrap_or(actix_web::http::StatusCode::BAD_GATEWAY);
    let mut builder = HttpResponse::build(status_code);
    for (name, value) in headers {
        builder.insert_header((name.as_str(), value.as_str()));
    }
    builder.body(body)
}

/// A 502 carrying the `x-tollbooth-settlement-skipped` header (after-response
/// mode only), for upstream failures that short-circuit before settlement.
fn settlement_skipped_response(status: actix_web::http::StatusCode, body: Value, reason: &str) -> HttpResponse {
    let mut resp = HttpResponse::build(status).json(body);
    resp.headers_mut().insert(
        actix_web::http::header::HeaderName::from_static("x-tollbooth-settlement-skipped"),
        actix_web::http::header::HeaderValue::from_str(&serde_json::json!({"reason": reason}).to_string())
            .unwrap(),
    );
    resp
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AcceptEntry, Defaults, GlobalConfig, RouteConfig, UpstreamConfig};
    use indexmap::IndexMap;

    fn base_config() -> GlobalConfig {
        let mut upstreams = HashMap::new();
        upstreams.insert(
            "weather-api".to_string(),
            UpstreamConfig {
                url: "https://weather.example.com".to_string(),
                headers: HashMap::new(),
                timeout_seconds: None,
            },
        );
        let mut routes = IndexMap::new();
        routes.insert(
            "GET /weather".to_string(),
            RouteConfig {
                upstream: "weather-api".to_string(),
                upstream_path: None,
                pricing: None,
                price: Some("$0.01".to_string()),
                fallback: None,
                accepts: None,
                pay_to: None,
                facilitator: None,
                rate_limit: None,
                verification_cache: None,
                hooks: Default::default(),
                settlement: Default::default(),
                metadata: Default::default(),
            },
        );
        GlobalConfig {
            gateway: Default::default(),
            wallets: HashMap::from([("base".to_string(), "0x111".to_string())]),
            accepts: vec![AcceptEntry {
                asset: "USDC".to_string(),
                network: "base".to_string(),
            }],
            defaults: Defaults {
                price: "$0.01".into(),
                timeout_seconds: 5,
                rate_limit: None,
                verification_cache: None,
            },
            facilitator: None,
            settlement: None,
            stores: Default::default(),
            upstreams,
            routes,
            hooks: Default::default(),
        }
    }

    #[actix_web::test]
    async fn missing_route_returns_route_not_found() {
        let state = AppState::new(base_config()).await.unwrap();
        let req = actix_web::test::TestRequest::get().uri("/nope").to_http_request();
        let err = handle_request(req, Bytes::new(), web::Data::new(state))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::RouteNotFound { .. }));
    }

    #[actix_web::test]
    async fn missing_signature_on_priced_route_is_payment_missing() {
        let state = AppState::new(base_config()).await.unwrap();
        let req = actix_web::test::TestRequest::get().uri("/weather").to_http_request();
        let err = handle_request(req, Bytes::new(), web::Data::new(state))
            .await
            .unwrap_err();
        match err {
            GatewayError::PaymentMissing(reqs) => {
                assert_eq!(reqs.len(), 1);
                assert_eq!(reqs[0].max_amount_required, "10000");
            }
            _ => panic!("expected PaymentMissing"),
        }
    }
}
