//! Route pattern matching, parameter extraction, and upstream path rewrite.

use std::collections::HashMap;

use indexmap::IndexMap;
use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};

use crate::config::RouteConfig;
use crate::error::GatewayError;

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Param(String),
}

#[derive(Debug, Clone)]
struct Pattern {
    key: String,
    method: String,
    segments: Vec<Segment>,
}

impl Pattern {
    fn parse(key: &str) -> Option<Self> {
        let mut parts = key.splitn(2, ' ');
        let method = parts.next()?.to_ascii_uppercase();
        let path = parts.next()?;
        let segments = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| {
                if let Some(name) = s.strip_prefix(':') {
                    Segment::Param(name.to_string())
                } else {
                    Segment::Literal(s.to_string())
                }
            })
            .collect();
        Some(Self {
            key: key.to_string(),
            method,
            segments,
        })
    }

    fn matches(&self, method: &str, path_segments: &[&str]) -> Option<HashMap<String, String>> {
        if self.method != method.to_ascii_uppercase() {
            return None;
        }
        if self.segments.len() != path_segments.len() {
            return None;
        }
        let mut params = HashMap::new();
        for (seg, actual) in self.segments.iter().zip(path_segments.iter()) {
            match seg {
                Segment::Literal(lit) => {
                    if lit != actual {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    let decoded = percent_decode_str(actual)
                        .decode_utf8()
                        .ok()?
                        .into_owned();
                    params.insert(name.clone(), decoded);
                }
            }
        }
        Some(params)
    }
}

pub struct MatchedRoute<'a> {
    pub pattern_key: &'a str,
    pub route: &'a RouteConfig,
    pub params: HashMap<String, String>,
}

/// Find the first pattern (in insertion order) matching `(method, path)`.
pub fn match_route<'a>(
    routes: &'a IndexMap<String, RouteConfig>,
    method: &str,
    path: &str,
) -> Result<MatchedRoute<'a>, GatewayError> {
    let path_segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let mut checked = Vec::new();
    for (key, route) in routes {
        checked.push(key.clone());
        let Some(pattern) = Pattern::parse(key) else {
            continue;
        };
        if let Some(params) = pattern.matches(method, &path_segments) {
            return Ok(MatchedRoute {
                pattern_key: key,
                route,
                params,
            });
        }
    }

    let requested = format!("{} {}", method.to_ascii_uppercase(), path);
    let suggestion = closest_match(&requested, checked.iter().map(String::as_str));
    Err(GatewayError::RouteNotFound {
        checked,
        suggestion,
    })
}

/// Rewrite the upstream path template with `${params.*}`/`${query.*}`
/// placeholders. An unknown-prefixed `${...}` is left untouched; a
/// referenced-but-absent variable is fatal.
pub fn rewrite_path(
    template: &str,
    params: &HashMap<String, String>,
    query: &HashMap<String, String>,
) -> Result<String, GatewayError> {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && bytes.get(i + 1) == Some(&b'{') {
            if let Some(end) = template[i..].find('}') {
                let inner = &template[i + 2..i + end];
                if let Some(name) = inner.strip_prefix("params.") {
                    let value = params.get(name).ok_or_else(|| {
                        GatewayError::Internal(format!(
                            "path rewrite references unknown param {name:?}"
                        ))
                    })?;
                    out.push_str(&utf8_percent_encode(value, NON_ALPHANUMERIC).to_string());
                    i += end + 1;
                    continue;
                } else if let Some(name) = inner.strip_prefix("query.") {
                    let value = query.get(name).ok_or_else(|| {
                        GatewayError::Internal(format!(
                            "path rewrite references unknown query variable {name:?}"
                        ))
                    })?;
                    out.push_str(&utf8_percent_encode(value, NON_ALPHANUMERIC).to_string());
                    i += end + 1;
                    continue;
                } else {
                    // Unknown prefix: leave the whole placeholder untouched.
                    out.push_str(&template[i..=i + end]);
                    i += end + 1;
                    continue;
                }
            }
        }
        let ch = template[i..].chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }
    Ok(out)
}

/// Propose the closest `"METHOD /path"` candidate by Levenshtein distance,
/// gated to `distance <= 0.4 * max(|requested|, |candidate|)`.
fn closest_match<'a>(requested: &str, candidates: impl Iterator<Item = &'a str>) -> Option<String> {
    let mut best: Option<(usize, &str)> = None;
    for candidate in candidates {
        let distance = levenshtein(requested, candidate);
        let max_len = requested.chars().count().max(candidate.chars().count());
        if max_len == 0 {
            continue;
        }
        if (distance as f64) > 0.4 * max_len as f64 {
            continue;
        }
        if best.map(|(d, _)| distance < d).unwrap_or(true) {
            best = Some((distance, candidate));
        }
    }
    best.map(|(_, c)| c.to_string())
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];
    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=b.len() {
            let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
            curr[j] = (prev[j] + 1)
                .min(curr[j - 1] + 1)
                .min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouteConfig;

    fn route(upstream: &str) -> RouteConfig {
        RouteConfig {
            upstream: upstream.to_string(),
            upstream_path: None,
            pricing: None,
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

    #[test]
    fn matches_literal_path() {
        let mut routes = IndexMap::new();
        routes.insert("GET /weather".to_string(), route("weather-api"));
        let matched = match_route(&routes, "get", "/weather").unwrap();
        assert_eq!(matched.pattern_key, "GET /weather");
    }

    #[test]
    fn extracts_url_decoded_param() {
        let mut routes = IndexMap::new();
        routes.insert("GET /data/:id".to_string(), route("data-api"));
        let matched = match_route(&routes, "GET", "/data/hello%20world").unwrap();
        assert_eq!(matched.params.get("id").unwrap(), "hello world");
    }

    #[test]
    fn insertion_order_wins_on_ambiguity() {
        let mut routes = IndexMap::new();
        routes.insert("GET /data/:id".to_string(), route("first"));
        routes.insert("GET /data/:slug".to_string(), route("second"));
        let matched = match_route(&routes, "GET", "/data/42").unwrap();
        assert_eq!(matched.route.upstream, "first");
    }

    #[test]
    fn no_match_returns_checked_list_and_suggestion() {
        let mut routes = IndexMap::new();
        routes.insert("GET /weather".to_string(), route("weather-api"));
        let err = match_route(&routes, "GET", "/wether").unwrap_err();
        match err {
            GatewayError::RouteNotFound {
                checked,
                suggestion,
            } => {
                assert_eq!(checked, vec!["GET /weather".to_string()]);
                assert_eq!(suggestion.as_deref(), Some("GET /weather"));
            }
            _ => panic!("expected RouteNotFound"),
        }
    }

    #[test]
    fn distant_candidate_is_not_suggested() {
        let mut routes = IndexMap::new();
        routes.insert("GET /weather".to_string(), route("weather-api"));
        let err = match_route(&routes, "GET", "/completely-unrelated-path").unwrap_err();
        match err {
            GatewayError::RouteNotFound { suggestion, .. } => assert!(suggestion.is_none()),
            _ => panic!("expected RouteNotFound"),
        }
    }

    #[test]
    fn rewrite_substitutes_params_and_query() {
        let mut params = HashMap::new();
        params.insert("query_id".to_string(), "abc 123".to_string());
        let query = HashMap::new();
        let out = rewrite_path("/v1/query/${params.query_id}/results", &params, &query).unwrap();
        assert_eq!(out, "/v1/query/abc%20123/results");
    }

    #[test]
    fn rewrite_is_idempotent() {
        let mut params = HashMap::new();
        params.insert("id".to_string(), "42".to_string());
        let query = HashMap::new();
        let once = rewrite_path("/v1/${params.id}", &params, &query).unwrap();
        let twice = rewrite_path("/v1/${params.id}", &params, &query).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn rewrite_fails_on_unknown_param() {
        let params = HashMap::new();
        let query = HashMap::new();
        assert!(rewrite_path("/v1/${params.missing}", &params, &query).is_err());
    }

    #[test]
    fn rewrite_leaves_unknown_prefix_untouched() {
        let params = HashMap::new();
        let query = HashMap::new();
        let out = rewrite_path("/v1/${env.FOO}", &params, &query).unwrap();
        assert_eq!(out, "/v1/${env.FOO}");
    }
}
