//! Wire-format payment types.
//!
//! Addresses and asset identifiers are opaque strings from the gateway's
//! point of view — it never inspects or signs them, only forwards them to
//! the facilitator and echoes them back in headers. Cryptographic
//! primitives are the facilitator's concern.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The signed payload a client attaches via the `payment-signature` header
/// (base64(JSON(..))). The gateway only needs the payer identity for
/// logging/rate-limiting; everything else is opaque and forwarded verbatim
/// to the settlement strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentPayload {
    #[serde(default, rename = "x402Version")]
    pub x402_version: Option<u32>,
    pub scheme: Option<String>,
    pub network: Option<String>,
    /// Scheme-specific payload. The gateway reads `payload.authorization.from`
    /// or a top-level `from` to recover the payer identity and otherwise
    /// treats this as opaque.
    pub payload: Value,
}

impl PaymentPayload {
    /// Recover the payer address for identity/logging purposes: read
    /// `payload.authorization.from`, falling back to a top-level `from`
    /// field on the payload.
    pub fn payer(&self) -> Option<String> {
        self.payload
            .get("authorization")
            .and_then(|a| a.get("from"))
            .or_else(|| self.payload.get("from"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

/// One entry the route will accept as payment: an asset on a network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptedPayment {
    pub asset: String,
    pub network: String,
}

/// A single `{scheme, network, maxAmountRequired, ...}` entry in the
/// `accepts` array of a 402 response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    pub scheme: String,
    pub network: String,
    pub max_amount_required: String,
    pub resource: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub pay_to: String,
    pub max_timeout_seconds: u64,
    pub asset: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<RequirementsExtra>,
}

/// Signing-domain metadata attached when a human asset name (e.g. `USDC`)
/// is substituted for its contract address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequirementsExtra {
    pub name: String,
    pub version: String,
}

/// The 402 response body: `{"accepts": [...]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequiredBody {
    pub accepts: Vec<PaymentRequirements>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payer_from_authorization() {
        let p: PaymentPayload = serde_json::from_value(serde_json::json!({
            "payload": {"authorization": {"from": "0xabc"}}
        }))
        .unwrap();
        assert_eq!(p.payer().as_deref(), Some("0xabc"));
    }

    #[test]
    fn payer_from_top_level() {
        let p: PaymentPayload = serde_json::from_value(serde_json::json!({
            "payload": {"from": "0xdef"}
        }))
        .unwrap();
        assert_eq!(p.payer().as_deref(), Some("0xdef"));
    }

    #[test]
    fn payer_absent() {
        let p: PaymentPayload = serde_json::from_value(serde_json::json!({
            "payload": {}
        }))
        .unwrap();
        assert_eq!(p.payer(), None);
    }

    #[test]
    fn requirements_round_trip_through_required_body() {
        let reqs = PaymentRequirements {
            scheme: "exact".into(),
            network: "base".into(),
            max_amount_required: "10000".into(),
            resource: "/weather".into(),
            description: Some("GET /weather".into()),
            pay_to: "0x111".into(),
            max_timeout_seconds: 60,
            asset: "USDC".into(),
            extra: None,
        };
        let body = PaymentRequiredBody {
            accepts: vec![reqs.clone()],
        };
        let encoded = base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            serde_json::to_vec(&body.accepts).unwrap(),
        );
        let raw = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded)
            .unwrap();
        let decoded: Vec<PaymentRequirements> = serde_json::from_slice(&raw).unwrap();
        assert_eq!(decoded, vec![reqs]);
    }
}
