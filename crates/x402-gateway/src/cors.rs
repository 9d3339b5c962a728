//! CORS configuration: preflight is accepted only when the origin is on
//! the gateway's configured allowlist.

use actix_cors::Cors;

/// Build the gateway's CORS middleware from the configured origin allowlist.
pub fn build_cors(allowed_origins: &[String]) -> Cors {
    let allowed = allowed_origins.to_vec();
    Cors::default()
        .allowed_origin_fn(move |origin, _req_head| {
            let origin_str = origin.to_str().unwrap_or("");
            allowed.iter().any(|a| a == "*" || a == origin_str)
        })
        .allowed_methods(vec!["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"])
        .allowed_headers(vec![
            actix_web::http::header::AUTHORIZATION,
            actix_web::http::header::ACCEPT,
            actix_web::http::header::CONTENT_TYPE,
            actix_web::http::header::HeaderName::from_static("payment-signature"),
        ])
        .expose_headers(vec![
            actix_web::http::header::HeaderName::from_static("payment-required"),
            actix_web::http::header::HeaderName::from_static("payment-response"),
            actix_web::http::header::HeaderName::from_static("x-tollbooth-settlement-skipped"),
        ])
        .max_age(3600)
}
