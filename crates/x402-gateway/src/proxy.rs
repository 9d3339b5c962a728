//! Streaming reverse proxy: header scrub, two-phase timeout, body
//! pass-through. The response headers deadline is cleared as soon as they
//! arrive — body streaming afterward is unbounded so long SSE streams
//! survive past the connect timeout.

use std::time::Duration;

use actix_web::http::header::{HeaderName, HeaderValue};
use actix_web::{HttpRequest, HttpResponse};
use bytes::Bytes;
use futures::TryStreamExt;

use crate::error::GatewayError;

/// Headers stripped before forwarding to the upstream: hop-by-hop,
/// x402-protocol headers (consumed by the gateway, not the upstream's
/// business), and credential headers that must never leak outward.
const HEADERS_TO_STRIP: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "transfer-encoding",
    "content-length",
    "payment-signature",
    "payment-required",
    "payment-response",
    "authorization",
    "cookie",
    "proxy-authorization",
    "x-api-key",
    "x-tollbooth-settlement-skipped",
];

/// Hop-by-hop headers stripped from the upstream's response before it is
/// relayed downstream.
const RESPONSE_HEADERS_TO_STRIP: &[&str] = &["connection", "transfer-encoding", "content-length"];

pub struct ProxyRequestSpec<'a> {
    pub method: reqwest::Method,
    pub url: String,
    pub client_headers: &'a actix_web::http::header::HeaderMap,
    pub extra_headers: &'a std::collections::HashMap<String, String>,
    pub body: Bytes,
}

/// Forward one request, returning the upstream's response streamed
/// through. Errors only for connect failure/timeout before headers arrive;
/// any upstream HTTP status (including 5xx) is a normal `Ok`.
pub async fn proxy_request(
    client: &reqwest::Client,
    spec: ProxyRequestSpec<'_>,
    headers_timeout: Duration,
) -> Result<HttpResponse, GatewayError> {
    let mut builder = client.request(spec.method, &spec.url);

    for (name, value) in spec.client_headers.iter() {
        let name_lower = name.as_str().to_ascii_lowercase();
        if HEADERS_TO_STRIP.contains(&name_lower.as_str()) {
            continue;
        }
        if let Ok(value_str) = value.to_str() {
            builder = builder.header(name.as_str(), value_str);
        }
    }
    for (name, value) in spec.extra_headers {
        builder = builder.header(name, value);
    }
    if !spec.body.is_empty() {
        builder = builder.body(spec.body.to_vec());
    }

    let response = match tokio::time::timeout(headers_timeout, builder.send()).await {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) if e.is_connect() || e.is_request() => {
            return Err(GatewayError::UpstreamUnreachable(e.to_string()));
        }
        Ok(Err(e)) => return Err(GatewayError::UpstreamUnreachable(e.to_string())),
        Err(_) => {
            return Err(GatewayError::UpstreamTimeout(format!(
                "timed out after {}s",
                headers_timeout.as_secs()
            )));
        }
    };

    let status = response.status();
    let is_sse = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("text/event-stream"))
        .unwrap_or(false);
    let has_cache_control = response.headers().contains_key("cache-control");

    let mut builder = HttpResponse::build(
        actix_web::http::StatusCode::from_u16(status.as_u16())
            .unwrap_or(actix_web::http::StatusCode::BAD_GATEWAY),
    );
    for (name, value) in response.headers().iter() {
        let name_lower = name.as_str().to_ascii_lowercase();
        if RESPONSE_HEADERS_TO_STRIP.contains(&name_lower.as_str()) {
            continue;
        }
        if let (Ok(header_name), Ok(header_value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            builder.append_header((header_name, header_value));
        }
    }
    if is_sse && !has_cache_control {
        builder.insert_header(("cache-control", "no-cache"));
    }

    let stream = response
        .bytes_stream()
        .map_err(|e| actix_web::error::ErrorBadGateway(e.to_string()));
    Ok(builder.streaming(stream))
}

/// Build the upstream target URL: upstream base joined with the rewritten
/// path, query string copied verbatim.
pub fn build_target_url(upstream_base: &str, upstream_path: &str, query: &str) -> String {
    let base = upstream_base.trim_end_matches('/');
    let path = if upstream_path.starts_with('/') {
        upstream_path.to_string()
    } else {
        format!("/{upstream_path}")
    };
    if query.is_empty() {
        format!("{base}{path}")
    } else {
        format!("{base}{path}?{query}")
    }
}

pub fn method_from_request(req: &HttpRequest) -> Result<reqwest::Method, GatewayError> {
    reqwest::Method::from_bytes(req.method().as_str().as_bytes())
        .map_err(|_| GatewayError::BadRequest(format!("unsupported HTTP method: {}", req.method())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_url_joins_base_and_path() {
        assert_eq!(
            build_target_url("https://api.example.com", "/v1/data", ""),
            "https://api.example.com/v1/data"
        );
    }

    #[test]
    fn target_url_preserves_query_string() {
        assert_eq!(
            build_target_url("https://api.example.com/", "/v1/data", "a=1&b=2"),
            "https://api.example.com/v1/data?a=1&b=2"
        );
    }

    #[test]
    fn strip_list_includes_hop_by_hop_and_x402_headers() {
        assert!(HEADERS_TO_STRIP.contains(&"payment-signature"));
        assert!(HEADERS_TO_STRIP.contains(&"authorization"));
        assert!(!HEADERS_TO_STRIP.contains(&"content-type"));
    }
}
