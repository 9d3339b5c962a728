//! Client-IP resolution behind trust-proxy configuration: `Forwarded`,
//! `X-Forwarded-For`, `X-Real-IP` parsing with CIDR-gated hop selection.

use std::net::IpAddr;

use crate::config::TrustProxyConfig;

/// Resolve the identity-relevant client IP for one request.
pub fn resolve_client_ip(
    trust_proxy: &TrustProxyConfig,
    socket_addr: IpAddr,
    headers: &dyn Fn(&str) -> Option<String>,
) -> IpAddr {
    match trust_proxy {
        TrustProxyConfig::Bool(false) => socket_addr,
        TrustProxyConfig::Bool(true) => {
            resolve_with_hops(socket_addr, headers, None, &[])
        }
        TrustProxyConfig::Hops(n) => resolve_with_hops(socket_addr, headers, Some(*n), &[]),
        TrustProxyConfig::Detailed { hops, cidrs } => {
            let parsed_cidrs: Vec<Cidr> = cidrs.iter().filter_map(|c| Cidr::parse(c)).collect();
            resolve_with_hops(socket_addr, headers, *hops, &parsed_cidrs)
        }
    }
}

fn resolve_with_hops(
    socket_addr: IpAddr,
    headers: &dyn Fn(&str) -> Option<String>,
    hops: Option<u32>,
    cidrs: &[Cidr],
) -> IpAddr {
    if !cidrs.is_empty() && !cidrs.iter().any(|c| c.contains(socket_addr)) {
        return socket_addr;
    }

    let Some(chain) = parse_chain(headers) else {
        return socket_addr;
    };
    if chain.is_empty() {
        return socket_addr;
    }

    if !cidrs.is_empty() {
        let checked_hops = hops.map(|n| (n.saturating_sub(1)) as usize).unwrap_or(chain.len());
        let intermediates = &chain[chain.len().saturating_sub(checked_hops)..];
        if intermediates.iter().any(|ip| !cidrs.iter().any(|c| c.contains(*ip))) {
            return socket_addr;
        }
    }

    match hops {
        None => chain[0],
        Some(n) => {
            let idx = chain.len().saturating_sub(n as usize);
            chain[idx.min(chain.len() - 1)]
        }
    }
}

/// Parse the client-first IP chain, preferring `Forwarded`, then
/// `X-Forwarded-For`, then `X-Real-IP`.
fn parse_chain(headers: &dyn Fn(&str) -> Option<String>) -> Option<Vec<IpAddr>> {
    if let Some(forwarded) = headers("forwarded") {
        let chain = parse_forwarded(&forwarded);
        if !chain.is_empty() {
            return Some(chain);
        }
    }
    if let Some(xff) = headers("x-forwarded-for") {
        let chain: Vec<IpAddr> = xff
            .split(',')
            .filter_map(|s| strip_port(s.trim()).parse().ok())
            .collect();
        if !chain.is_empty() {
            return Some(chain);
        }
    }
    if let Some(real_ip) = headers("x-real-ip") {
        if let Ok(ip) = strip_port(real_ip.trim()).parse() {
            return Some(vec![ip]);
        }
    }
    None
}

fn parse_forwarded(value: &str) -> Vec<IpAddr> {
    value
        .split(',')
        .filter_map(|entry| {
            entry.split(';').find_map(|pair| {
                let mut kv = pair.trim().splitn(2, '=');
                let key = kv.next()?.trim();
                let val = kv.next()?.trim().trim_matches('"');
                if key.eq_ignore_ascii_case("for") {
                    strip_port(val).parse().ok()
                } else {
                    None
                }
            })
        })
        .collect()
}

/// Strip an IPv4 port suffix or IPv6 brackets/port from a `for=` value.
fn strip_port(raw: &str) -> String {
    if let Some(stripped) = raw.strip_prefix('[') {
        if let Some(end) = stripped.find(']') {
            return stripped[..end].to_string();
        }
    }
    if raw.matches(':').count() == 1 {
        if let Some((host, _port)) = raw.rsplit_once(':') {
            return host.to_string();
        }
    }
    raw.to_string()
}

struct Cidr {
    network: IpAddr,
    prefix: u8,
}

impl Cidr {
    fn parse(s: &str) -> Option<Self> {
        let (addr, prefix) = s.split_once('/')?;
        Some(Self {
            network: addr.parse().ok()?,
            prefix: prefix.parse().ok()?,
        })
    }

    fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u32::MAX << (32 - self.prefix.min(32))
                };
                u32::from(net) & mask == u32::from(addr) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - self.prefix.min(128))
                };
                u128::from(net) & mask == u128::from(addr) & mask
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn headers_from(map: HashMap<&'static str, &'static str>) -> impl Fn(&str) -> Option<String> {
        move |name| map.get(name).map(|v| v.to_string())
    }

    #[test]
    fn disabled_trust_proxy_uses_socket_addr() {
        let socket: IpAddr = "203.0.113.5".parse().unwrap();
        let headers = headers_from(HashMap::from([("x-forwarded-for", "9.9.9.9")]));
        let ip = resolve_client_ip(&TrustProxyConfig::Bool(false), socket, &headers);
        assert_eq!(ip, socket);
    }

    #[test]
    fn trust_proxy_true_selects_leftmost_client() {
        let socket: IpAddr = "127.0.0.1".parse().unwrap();
        let headers = headers_from(HashMap::from([(
            "x-forwarded-for",
            "1.2.3.4, 10.0.0.1, 10.0.0.2",
        )]));
        let ip = resolve_client_ip(&TrustProxyConfig::Bool(true), socket, &headers);
        assert_eq!(ip, "1.2.3.4".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn hops_selects_from_the_right() {
        let socket: IpAddr = "127.0.0.1".parse().unwrap();
        let headers = headers_from(HashMap::from([(
            "x-forwarded-for",
            "1.2.3.4, 10.0.0.1, 10.0.0.2",
        )]));
        // hops=1 -> trust the single nearest proxy -> client is chain[len-1]=10.0.0.2
        let ip = resolve_client_ip(&TrustProxyConfig::Hops(1), socket, &headers);
        assert_eq!(ip, "10.0.0.2".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn forwarded_header_takes_precedence_over_xff() {
        let socket: IpAddr = "127.0.0.1".parse().unwrap();
        let headers = headers_from(HashMap::from([
            ("forwarded", "for=9.9.9.9"),
            ("x-forwarded-for", "1.1.1.1"),
        ]));
        let ip = resolve_client_ip(&TrustProxyConfig::Bool(true), socket, &headers);
        assert_eq!(ip, "9.9.9.9".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn cidr_mismatch_on_direct_socket_falls_back() {
        let socket: IpAddr = "8.8.8.8".parse().unwrap();
        let headers = headers_from(HashMap::from([("x-forwarded-for", "1.2.3.4")]));
        let config = TrustProxyConfig::Detailed {
            hops: None,
            cidrs: vec!["10.0.0.0/8".to_string()],
        };
        let ip = resolve_client_ip(&config, socket, &headers);
        assert_eq!(ip, socket);
    }

    #[test]
    fn ipv4_cidr_contains_works() {
        let cidr = Cidr::parse("10.0.0.0/8").unwrap();
        assert!(cidr.contains("10.1.2.3".parse().unwrap()));
        assert!(!cidr.contains("11.1.2.3".parse().unwrap()));
    }
}
