//! Global configuration: route table, upstreams, wallets, store backends.
//!
//! Loaded once at startup from a YAML or JSON file (by extension). String
//! values may reference `${NAME}` environment variables, interpolated at
//! load time; `${params.*}` and `${query.*}` are left untouched for the
//! router's runtime path rewrite.

use std::collections::HashMap;
use std::env;
use std::path::Path;

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};

const DEFAULT_PORT: u16 = 4021;
const DEFAULT_HOSTNAME: &str = "0.0.0.0";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_TIMEOUT_SECS: u64 = 60;
const HARDCODED_FACILITATOR: &str = "https://x402.org/facilitator";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub gateway: GatewaySettings,
    #[serde(default)]
    pub wallets: HashMap<String, String>,
    #[serde(default)]
    pub accepts: Vec<AcceptEntry>,
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub facilitator: Option<FacilitatorConfig>,
    #[serde(default)]
    pub settlement: Option<SettlementConfig>,
    #[serde(default)]
    pub stores: StoresConfig,
    #[serde(default)]
    pub upstreams: HashMap<String, UpstreamConfig>,
    #[serde(default)]
    pub routes: IndexMap<String, RouteConfig>,
    #[serde(default)]
    pub hooks: RouteHooks,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewaySettings {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default)]
    pub trust_proxy: TrustProxyConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    /// Bearer token required for `/metrics`; `None` leaves it public.
    #[serde(default)]
    pub metrics_token: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_hostname() -> String {
    DEFAULT_HOSTNAME.to_string()
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            hostname: DEFAULT_HOSTNAME.to_string(),
            trust_proxy: TrustProxyConfig::default(),
            cors: CorsConfig::default(),
            discovery: DiscoveryConfig::default(),
            metrics_token: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum TrustProxyConfig {
    Bool(bool),
    Hops(u32),
    Detailed {
        #[serde(default)]
        hops: Option<u32>,
        #[serde(default)]
        cidrs: Vec<String>,
    },
}

impl Default for TrustProxyConfig {
    fn default() -> Self {
        TrustProxyConfig::Bool(false)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CorsConfig {
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AcceptEntry {
    pub asset: String,
    pub network: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Defaults {
    #[serde(default = "default_price")]
    pub price: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default)]
    pub verification_cache: Option<VerificationCacheConfig>,
}

fn default_price() -> String {
    "$0.01".to_string()
}
fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            price: default_price(),
            timeout_seconds: DEFAULT_TIMEOUT_SECS,
            rate_limit: None,
            verification_cache: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    pub requests: u32,
    /// Window string like `"1m"`, `"5m"`, `"1h"`; see [`parse_window_ms`].
    pub window: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VerificationCacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub ttl: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum FacilitatorConfig {
    Url(String),
    Chains {
        #[serde(default)]
        default: Option<String>,
        #[serde(default)]
        chains: HashMap<String, String>,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SettlementConfig {
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub module: Option<String>,
}

fn default_strategy() -> String {
    "facilitator".to_string()
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StoresConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default)]
    pub redis_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    pub upstream: String,
    #[serde(default)]
    pub upstream_path: Option<String>,
    #[serde(default)]
    pub pricing: Option<PricingConfig>,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub fallback: Option<String>,
    #[serde(default)]
    pub accepts: Option<Vec<AcceptEntry>>,
    #[serde(default)]
    pub pay_to: Option<String>,
    #[serde(default)]
    pub facilitator: Option<FacilitatorConfig>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default)]
    pub verification_cache: Option<VerificationCacheConfig>,
    #[serde(default)]
    pub hooks: RouteHooks,
    #[serde(default)]
    pub settlement: SettlementTiming,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RouteHooks {
    #[serde(default)]
    pub on_request: Option<String>,
    #[serde(default)]
    pub on_price_resolved: Option<String>,
    #[serde(default)]
    pub on_settled: Option<String>,
    #[serde(default)]
    pub on_response: Option<String>,
    #[serde(default)]
    pub on_error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SettlementTiming {
    #[default]
    BeforeResponse,
    AfterResponse,
}

/// One `where`-clause pricing rule, or a token-based/time-based model.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PricingConfig {
    Match {
        rules: Vec<MatchRule>,
    },
    Token {
        #[serde(default)]
        models: HashMap<String, String>,
    },
    Dynamic {
        #[serde(rename = "fn")]
        module: String,
    },
    Time {
        price: String,
        /// Session duration string, same grammar as rate-limit windows.
        duration: String,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MatchRule {
    #[serde(rename = "where")]
    pub where_clause: HashMap<String, serde_json::Value>,
    pub price: String,
    #[serde(default)]
    pub pay_to: Option<String>,
}

impl GlobalConfig {
    /// Load and parse a config file, substituting `${NAME}` env references.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.display().to_string(), e.to_string()))?;
        let interpolated = interpolate_env(&raw)?;

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        let config: GlobalConfig = match ext {
            "json" => serde_json::from_str(&interpolated)
                .map_err(|e| ConfigError::Parse(e.to_string()))?,
            _ => serde_yaml::from_str(&interpolated)
                .map_err(|e| ConfigError::Parse(e.to_string()))?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (pattern, route) in &self.routes {
            if !self.upstreams.contains_key(&route.upstream) {
                return Err(ConfigError::Schema(format!(
                    "route {pattern:?} references unknown upstream {:?}",
                    route.upstream
                )));
            }
            if let Some(rl) = &route.rate_limit {
                parse_window_ms(&rl.window)?;
            }
            if let Some(vc) = &route.verification_cache {
                parse_window_ms(&vc.ttl)?;
            }
        }
        if let Some(rl) = &self.defaults.rate_limit {
            parse_window_ms(&rl.window)?;
        }
        Ok(())
    }
}

/// Resolve `(network, asset)` to a facilitator base URL via the five-level
/// fallback chain: route chain-specific → route default → global
/// chain-specific → global default → hardcoded public facilitator.
pub fn resolve_facilitator_url(
    network: &str,
    asset: &str,
    route: Option<&FacilitatorConfig>,
    global: Option<&FacilitatorConfig>,
) -> String {
    let chain_key = format!("{network}/{asset}").to_lowercase();
    if let Some(FacilitatorConfig::Chains { default, chains }) = route {
        if let Some(url) = chains
            .iter()
            .find(|(k, _)| k.to_lowercase() == chain_key)
            .map(|(_, v)| v.clone())
        {
            return url;
        }
        if let Some(url) = default {
            return url.clone();
        }
    }
    if let Some(FacilitatorConfig::Url(url)) = route {
        return url.clone();
    }
    if let Some(FacilitatorConfig::Chains { default, chains }) = global {
        if let Some(url) = chains
            .iter()
            .find(|(k, _)| k.to_lowercase() == chain_key)
            .map(|(_, v)| v.clone())
        {
            return url;
        }
        if let Some(url) = default {
            return url.clone();
        }
    }
    if let Some(FacilitatorConfig::Url(url)) = global {
        return url.clone();
    }
    HARDCODED_FACILITATOR.to_string()
}

/// Parse a window string like `"1s"`, `"5m"`, `"1h"`, `"1d"` into milliseconds.
pub fn parse_window_ms(window: &str) -> Result<u64, ConfigError> {
    let re = Regex::new(r"^(\d+)([smhd])$").unwrap();
    let caps = re
        .captures(window)
        .ok_or_else(|| ConfigError::Schema(format!("invalid window string: {window:?}")))?;
    let n: u64 = caps[1].parse().unwrap();
    let unit_ms = match &caps[2] {
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        _ => unreachable!(),
    };
    Ok(n * unit_ms)
}

fn interpolate_env(raw: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();
    let mut err = None;
    let result = re.replace_all(raw, |caps: &regex::Captures| {
        let name = &caps[1];
        match env::var(name) {
            Ok(v) => v,
            Err(_) => {
                err.get_or_insert(name.to_string());
                String::new()
            }
        }
    });
    if let Some(name) = err {
        return Err(ConfigError::MissingEnv(name));
    }
    Ok(result.into_owned())
}

pub const fn default_max_timeout_seconds() -> u64 {
    DEFAULT_MAX_TIMEOUT_SECS
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(String, String),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("config schema error: {0}")]
    Schema(String),
    #[error("missing environment variable referenced in config: {0}")]
    MissingEnv(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_window_strings() {
        assert_eq!(parse_window_ms("1s").unwrap(), 1_000);
        assert_eq!(parse_window_ms("5m").unwrap(), 300_000);
        assert_eq!(parse_window_ms("1h").unwrap(), 3_600_000);
        assert_eq!(parse_window_ms("1d").unwrap(), 86_400_000);
    }

    #[test]
    fn rejects_malformed_window() {
        assert!(parse_window_ms("1w").is_err());
        assert!(parse_window_ms("abc").is_err());
    }

    #[test]
    fn facilitator_fallback_chain_prefers_route_chain_specific() {
        let route = FacilitatorConfig::Chains {
            default: Some("https://route-default".into()),
            chains: HashMap::from([("base/usdc".to_string(), "https://route-chain".to_string())]),
        };
        let url = resolve_facilitator_url("base", "USDC", Some(&route), None);
        assert_eq!(url, "https://route-chain");
    }

    #[test]
    fn facilitator_fallback_chain_falls_back_to_hardcoded() {
        let url = resolve_facilitator_url("base", "USDC", None, None);
        assert_eq!(url, HARDCODED_FACILITATOR);
    }

    #[test]
    fn interpolates_env_vars() {
        std::env::set_var("TOLLBOOTH_TEST_VAR", "hello");
        let out = interpolate_env("value: ${TOLLBOOTH_TEST_VAR}").unwrap();
        assert_eq!(out, "value: hello");
        std::env::remove_var("TOLLBOOTH_TEST_VAR");
    }

    #[test]
    fn leaves_params_and_query_placeholders_untouched() {
        let out = interpolate_env("path: /v1/${params.id}?x=${query.y}").unwrap();
        assert_eq!(out, "path: /v1/${params.id}?x=${query.y}");
    }
}
