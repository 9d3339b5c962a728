//! Wire types for the x402 payment-required protocol.
//!
//! This crate describes only the HTTP-visible shapes the gateway
//! constructs and exchanges with a facilitator: payment requirements,
//! the signed payload a client attaches to its retried request, and the
//! facilitator's verify/settle responses. Cryptographic verification,
//! on-chain settlement, and client-side signing are delegated to the
//! facilitator and are out of scope here.
//!
//! # Modules
//!
//! - [`payment`] — `PaymentPayload`, `PaymentRequirements`, `PaymentRequiredBody`
//! - [`response`] — `VerifyResponse`, `SettleResponse`
//! - [`price`] — price-string parsing into integer smallest-unit amounts
//! - [`error`] — [`X402Error`]
//! - [`security`] — constant-time comparison helpers

pub mod error;
pub mod payment;
pub mod price;
pub mod response;
pub mod security;

pub use error::X402Error;
pub use payment::*;
pub use price::parse_price;
pub use response::*;
