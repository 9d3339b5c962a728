//! Error types for x402 payment operations.
//!
//! [`X402Error`] covers invalid payments, price-string parsing failures,
//! and the facilitator/HTTP/serialization errors that cross the wire.

use thiserror::Error;

/// Errors returned by x402 wire-type and price-parsing operations.
#[derive(Debug, Error)]
pub enum X402Error {
    #[error("invalid payment: {0}")]
    InvalidPayment(String),

    #[error("invalid price: {0}")]
    InvalidPrice(String),

    #[error("facilitator error: {0}")]
    FacilitatorError(String),

    #[error("http error: {0}")]
    HttpError(String),

    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
}
