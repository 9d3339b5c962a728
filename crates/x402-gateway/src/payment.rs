//! Payment coordinator: builds requirements, drives the pluggable
//! verify/settle strategy, and applies the verification-cache and
//! time-session short-circuits.

use actix_web::HttpResponse;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use x402_core::{PaymentPayload, PaymentRequirements, RequirementsExtra, SettleResponse, VerifyResponse};

use crate::config::{AcceptEntry, FacilitatorConfig, GlobalConfig, RouteConfig, resolve_facilitator_url};
use crate::error::GatewayError;

/// A successful verification: the matched requirement and (if known) payer.
#[derive(Debug, Clone)]
pub struct Verification {
    pub requirement_index: usize,
    pub payer: Option<String>,
}

/// A completed settlement, augmented with the requirement's amount.
#[derive(Debug, Clone)]
pub struct SettlementOutcome {
    pub payer: Option<String>,
    pub amount: String,
    pub transaction: Option<String>,
    pub network: String,
}

/// Stable extension point for verify/settle: the built-in strategy talks to
/// an HTTP facilitator, but this seam is where a custom strategy attaches.
#[async_trait]
pub trait SettlementStrategy: Send + Sync {
    async fn verify_one(
        &self,
        facilitator_url: &str,
        payload: &PaymentPayload,
        requirement: &PaymentRequirements,
    ) -> Result<VerifyResponse, GatewayError>;

    async fn settle_one(
        &self,
        facilitator_url: &str,
        payload: &PaymentPayload,
        requirement: &PaymentRequirements,
    ) -> Result<SettleResponse, GatewayError>;
}

pub struct FacilitatorStrategy {
    client: reqwest::Client,
}

impl FacilitatorStrategy {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SettlementStrategy for FacilitatorStrategy {
    async fn verify_one(
        &self,
        facilitator_url: &str,
        payload: &PaymentPayload,
        requirement: &PaymentRequirements,
    ) -> Result<VerifyResponse, GatewayError> {
        let url = format!("{}/verify", facilitator_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "paymentPayload": payload,
                "paymentRequirements": requirement,
            }))
            .send()
            .await
            .map_err(|e| GatewayError::FacilitatorUnreachable(e.to_string()))?;
        resp.json::<VerifyResponse>()
            .await
            .map_err(|e| GatewayError::FacilitatorUnreachable(e.to_string()))
    }

    async fn settle_one(
        &self,
        facilitator_url: &str,
        payload: &PaymentPayload,
        requirement: &PaymentRequirements,
    ) -> Result<SettleResponse, GatewayError> {
        let url = format!("{}/settle", facilitator_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "paymentPayload": payload,
                "paymentRequirements": requirement,
            }))
            .send()
            .await
            .map_err(|e| GatewayError::FacilitatorUnreachable(e.to_string()))?;
        resp.json::<SettleResponse>()
            .await
            .map_err(|e| GatewayError::FacilitatorUnreachable(e.to_string()))
    }
}

/// Try each requirement in order, resolving its facilitator URL via the
/// fallback chain; the first successful verify wins, all failures are
/// collected and the last one surfaces as the error.
pub async fn verify_payment(
    strategy: &dyn SettlementStrategy,
    payload: &PaymentPayload,
    requirements: &[PaymentRequirements],
    route_facilitator: Option<&FacilitatorConfig>,
    global_facilitator: Option<&FacilitatorConfig>,
) -> Result<(Verification, String), GatewayError> {
    let mut last_reason = "no accepted payment methods configured".to_string();
    for (index, requirement) in requirements.iter().enumerate() {
        let facilitator_url = resolve_facilitator_url(
            &requirement.network,
            &requirement.asset,
            route_facilitator,
            global_facilitator,
        );
        match strategy
            .verify_one(&facilitator_url, payload, requirement)
            .await
        {
            Ok(resp) if resp.is_valid => {
                return Ok((
                    Verification {
                        requirement_index: index,
                        payer: resp.payer.or_else(|| payload.payer()),
                    },
                    facilitator_url,
                ));
            }
            Ok(resp) => {
                last_reason = resp
                    .invalid_reason
                    .unwrap_or_else(|| "payment rejected".to_string());
            }
            Err(GatewayError::FacilitatorUnreachable(msg)) => {
                last_reason = msg;
            }
            Err(other) => return Err(other),
        }
    }
    Err(GatewayError::PaymentInvalid {
        requirements: requirements.to_vec(),
        reason: last_reason,
    })
}

/// Settle a verified requirement exactly once against its facilitator.
pub async fn settle_payment(
    strategy: &dyn SettlementStrategy,
    facilitator_url: &str,
    payload: &PaymentPayload,
    requirement: &PaymentRequirements,
) -> Result<SettlementOutcome, GatewayError> {
    let resp = strategy
        .settle_one(facilitator_url, payload, requirement)
        .await?;
    if !resp.success {
        return Err(GatewayError::PaymentSettleFailed(
            resp.error_reason.unwrap_or_else(|| "settlement failed".to_string()),
        ));
    }
    Ok(SettlementOutcome {
        payer: resp.payer,
        amount: requirement.max_amount_required.clone(),
        transaction: resp.transaction,
        network: resp.network,
    })
}

/// Build one [`PaymentRequirements`] per accepted payment method.
#[allow(clippy::too_many_arguments)]
pub fn build_requirements(
    accepts: &[AcceptEntry],
    amount: &str,
    pay_to: &str,
    resource: &str,
    description: &str,
    max_timeout_seconds: u64,
) -> Vec<PaymentRequirements> {
    accepts
        .iter()
        .map(|accept| {
            let (asset, extra) = substitute_known_asset(&accept.asset, &accept.network);
            PaymentRequirements {
                scheme: "exact".to_string(),
                network: accept.network.clone(),
                max_amount_required: amount.to_string(),
                resource: resource.to_string(),
                description: Some(description.to_string()),
                pay_to: pay_to.to_string(),
                max_timeout_seconds,
                asset,
                extra,
            }
        })
        .collect()
}

/// Substitute a known human asset name for its on-chain contract address
/// and attach the signing-domain metadata the facilitator expects.
fn substitute_known_asset(asset: &str, network: &str) -> (String, Option<RequirementsExtra>) {
    match (asset.to_ascii_uppercase().as_str(), network) {
        ("USDC", "base") => (
            "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913".to_string(),
            Some(RequirementsExtra {
                name: "USD Coin".to_string(),
                version: "2".to_string(),
            }),
        ),
        ("USDC", "base-sepolia") => (
            "0x036CbD53842c5426634e7929541eC2318f3dCF7e".to_string(),
            Some(RequirementsExtra {
                name: "USD Coin".to_string(),
                version: "2".to_string(),
            }),
        ),
        _ => (asset.to_string(), None),
    }
}

/// Resolve the effective `payTo` for a route: per-rule override wins over
/// the route's own, which wins over the wallet configured for the network.
pub fn resolve_pay_to<'a>(
    rule_pay_to: Option<&'a str>,
    route_pay_to: Option<&'a str>,
    config: &'a GlobalConfig,
    network: &str,
) -> Option<String> {
    rule_pay_to
        .or(route_pay_to)
        .map(str::to_string)
        .or_else(|| config.wallets.get(network).cloned())
        .or_else(|| config.wallets.values().next().cloned())
}

/// Resolve the effective accepts list: route override, else global.
pub fn resolve_accepts<'a>(route: &'a RouteConfig, config: &'a GlobalConfig) -> &'a [AcceptEntry] {
    route
        .accepts
        .as_deref()
        .unwrap_or(config.accepts.as_slice())
}

pub fn encode_requirements_header(requirements: &[PaymentRequirements]) -> String {
    BASE64.encode(serde_json::to_vec(requirements).unwrap_or_default())
}

pub fn encode_settlement_header(outcome: &SettlementOutcome) -> String {
    let body = serde_json::json!({
        "payer": outcome.payer,
        "amount": outcome.amount,
        "transaction": outcome.transaction,
        "network": outcome.network,
    });
    BASE64.encode(serde_json::to_vec(&body).unwrap_or_default())
}

/// Decode the `payment-signature` header into a [`PaymentPayload`].
pub fn decode_payment_signature(header: &str) -> Result<PaymentPayload, GatewayError> {
    let raw = BASE64
        .decode(header)
        .map_err(|e| GatewayError::BadRequest(format!("invalid payment-signature encoding: {e}")))?;
    serde_json::from_slice(&raw)
        .map_err(|e| GatewayError::BadRequest(format!("invalid payment-signature payload: {e}")))
}

/// Build the 402 response: JSON body `{"accepts":[...]}` plus the
/// `payment-required` header carrying the same list base64-encoded.
pub fn payment_required_response(requirements: &[PaymentRequirements]) -> HttpResponse {
    HttpResponse::PaymentRequired()
        .insert_header(("payment-required", encode_requirements_header(requirements)))
        .json(serde_json::json!({ "accepts": requirements }))
}

pub fn verification_cache_key(route_key: &str, identity: &str) -> String {
    format!("vc:{route_key}:{identity}")
}

pub fn time_session_key(route_key: &str, identity: &str) -> String {
    format!("ts:{route_key}:{identity}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubStrategy {
        valid_index: Option<usize>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SettlementStrategy for StubStrategy {
        async fn verify_one(
            &self,
            _facilitator_url: &str,
            _payload: &PaymentPayload,
            requirement: &PaymentRequirements,
        ) -> Result<VerifyResponse, GatewayError> {
            let idx = self.calls.fetch_add(1, Ordering::SeqCst);
            let is_valid = self.valid_index == Some(idx);
            let _ = requirement;
            Ok(VerifyResponse {
                is_valid,
                invalid_reason: if is_valid {
                    None
                } else {
                    Some("rejected".to_string())
                },
                payer: if is_valid {
                    Some("0xabc".to_string())
                } else {
                    None
                },
            })
        }

        async fn settle_one(
            &self,
            _facilitator_url: &str,
            _payload: &PaymentPayload,
            requirement: &PaymentRequirements,
        ) -> Result<SettleResponse, GatewayError> {
            Ok(SettleResponse {
                success: true,
                error_reason: None,
                payer: Some("0xabc".to_string()),
                transaction: Some("0xdeadbeef".to_string()),
                network: requirement.network.clone(),
            })
        }
    }

    fn sample_payload() -> PaymentPayload {
        serde_json::from_value(serde_json::json!({
            "payload": {"authorization": {"from": "0xabc"}}
        }))
        .unwrap()
    }

    fn sample_requirements() -> Vec<PaymentRequirements> {
        build_requirements(
            &[AcceptEntry {
                asset: "USDC".into(),
                network: "base".into(),
            }],
            "10000",
            "0x111",
            "/weather",
            "GET /weather",
            60,
        )
    }

    #[tokio::test]
    async fn verify_returns_first_success() {
        let strategy = StubStrategy {
            valid_index: Some(0),
            calls: AtomicUsize::new(0),
        };
        let reqs = sample_requirements();
        let (verification, _url) =
            verify_payment(&strategy, &sample_payload(), &reqs, None, None)
                .await
                .unwrap();
        assert_eq!(verification.requirement_index, 0);
    }

    #[tokio::test]
    async fn verify_fails_with_last_reason_when_all_reject() {
        let strategy = StubStrategy {
            valid_index: None,
            calls: AtomicUsize::new(0),
        };
        let reqs = sample_requirements();
        let err = verify_payment(&strategy, &sample_payload(), &reqs, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::PaymentInvalid { .. }));
    }

    #[test]
    fn known_usdc_base_substitutes_contract_and_domain() {
        let (asset, extra) = substitute_known_asset("USDC", "base");
        assert_eq!(asset, "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913");
        assert_eq!(extra.unwrap().name, "USD Coin");
    }

    #[test]
    fn unknown_asset_passes_through_unchanged() {
        let (asset, extra) = substitute_known_asset("WXYZ", "base");
        assert_eq!(asset, "WXYZ");
        assert!(extra.is_none());
    }

    #[test]
    fn requirements_header_round_trips() {
        let reqs = sample_requirements();
        let encoded = encode_requirements_header(&reqs);
        let raw = BASE64.decode(encoded).unwrap();
        let decoded: Vec<PaymentRequirements> = serde_json::from_slice(&raw).unwrap();
        assert_eq!(decoded, reqs);
    }
}
