//! The gateway's error taxonomy.
//!
//! Every variant maps to exactly one HTTP surface via [`ResponseError`].
//! `RouteNotFound`/`RateLimited` carry their own body shape; everything
//! else renders as `{"error": <message>}`.

use actix_web::{HttpResponse, ResponseError};
use std::fmt;
use x402_core::PaymentRequirements;

#[derive(Debug)]
pub enum GatewayError {
    /// No pattern matched `(method, path)`; folds in MethodNotAllowed.
    RouteNotFound {
        checked: Vec<String>,
        suggestion: Option<String>,
    },
    /// Token-based route without a `model` field in the body.
    BadRequest(String),
    /// No `payment-signature` header was present.
    PaymentMissing(Vec<PaymentRequirements>),
    /// All facilitator attempts rejected verification.
    PaymentInvalid {
        requirements: Vec<PaymentRequirements>,
        reason: String,
    },
    /// Facilitator settle returned `success: false`.
    PaymentSettleFailed(String),
    /// Network failure talking to the facilitator.
    FacilitatorUnreachable(String),
    /// Two-phase deadline tripped before upstream headers arrived.
    UpstreamTimeout(String),
    /// Upstream connect refused or DNS failure.
    UpstreamUnreachable(String),
    /// Rate-limit counter exceeded; carries `Retry-After` seconds.
    RateLimited { retry_after_secs: u64 },
    /// A user hook rejected the request, or threw.
    HookError(String),
    /// Anything else: config-time path rewrite failures, internal bugs.
    Internal(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::RouteNotFound { .. } => write!(f, "no route matched"),
            GatewayError::BadRequest(msg) => write!(f, "bad request: {msg}"),
            GatewayError::PaymentMissing(_) => write!(f, "payment required"),
            GatewayError::PaymentInvalid { reason, .. } => {
                write!(f, "payment invalid: {reason}")
            }
            GatewayError::PaymentSettleFailed(msg) => write!(f, "settlement failed: {msg}"),
            GatewayError::FacilitatorUnreachable(msg) => {
                write!(f, "facilitator unreachable: {msg}")
            }
            GatewayError::UpstreamTimeout(msg) => write!(f, "upstream timeout: {msg}"),
            GatewayError::UpstreamUnreachable(msg) => write!(f, "upstream unreachable: {msg}"),
            GatewayError::RateLimited { .. } => write!(f, "rate limited"),
            GatewayError::HookError(msg) => write!(f, "hook error: {msg}"),
            GatewayError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for GatewayError {}

impl ResponseError for GatewayError {
    fn error_response(&self) -> HttpResponse {
        match self {
            GatewayError::RouteNotFound {
                checked,
                suggestion,
            } => HttpResponse::NotFound().json(serde_json::json!({
                "error": "route_not_found",
                "checked": checked,
                "suggestion": suggestion,
            })),
            GatewayError::BadRequest(msg) => HttpResponse::BadRequest().json(serde_json::json!({
                "error": msg,
            })),
            GatewayError::PaymentMissing(requirements) => {
                crate::payment::payment_required_response(requirements)
            }
            GatewayError::PaymentInvalid {
                requirements,
                reason,
            } => HttpResponse::PaymentRequired()
                .insert_header((
                    "payment-required",
                    crate::payment::encode_requirements_header(requirements),
                ))
                .json(serde_json::json!({
                    "error": reason,
                    "accepts": requirements,
                })),
            GatewayError::PaymentSettleFailed(msg) => {
                tracing::error!(error = %msg, "settlement failed");
                HttpResponse::BadGateway().json(serde_json::json!({ "error": msg }))
            }
            GatewayError::FacilitatorUnreachable(msg) => {
                tracing::error!(error = %msg, "facilitator unreachable");
                HttpResponse::BadGateway().json(serde_json::json!({ "error": msg }))
            }
            GatewayError::UpstreamTimeout(msg) => {
                HttpResponse::BadGateway().json(serde_json::json!({ "error": msg }))
            }
            GatewayError::UpstreamUnreachable(msg) => {
                HttpResponse::BadGateway().json(serde_json::json!({
                    "error": msg,
                    "hint": "check that the route's upstream URL is reachable from the gateway",
                }))
            }
            GatewayError::RateLimited { retry_after_secs } => HttpResponse::TooManyRequests()
                .insert_header(("Retry-After", retry_after_secs.to_string()))
                .json(serde_json::json!({ "error": "rate_limited" })),
            GatewayError::HookError(msg) => {
                tracing::error!(error = %msg, "hook error");
                HttpResponse::BadGateway().json(serde_json::json!({ "error": msg }))
            }
            GatewayError::Internal(msg) => {
                tracing::error!(error = %msg, "internal error");
                HttpResponse::InternalServerError().json(serde_json::json!({ "error": msg }))
            }
        }
    }
}
