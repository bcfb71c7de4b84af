//! Best-effort client IP resolution from untrusted request headers.
//!
//! Lookup order: `X-Forwarded-For`, a fixed list of proxy/CDN headers, the
//! RFC 7239 `Forwarded` header, and finally the transport-level peer address.
//! Header names are matched case-insensitively by [`HeaderMap`].

use http::HeaderMap;
use regex::Regex;
use std::net::{IpAddr, SocketAddr};
use std::sync::OnceLock;

/// Proxy and CDN headers checked after `X-Forwarded-For`, in priority order
pub const PROXY_HEADERS: &[&str] = &[
    "cf-connecting-ip",
    "x-client-ip",
    "x-real-ip",
    "x-forwarded",
    "forwarded-for",
    "true-client-ip",
    "x-cluster-client-ip",
    "fastly-client-ip",
    "x-forwarded-host",
    "x-original-forwarded-for",
    "x-coming-from",
    "via",
    "x-real-forwarded-for",
];

/// Key shared by every caller whose address could not be resolved
pub const UNKNOWN_CLIENT: &str = "unknown";

fn forwarded_regex() -> &'static Regex {
    static FORWARDED: OnceLock<Regex> = OnceLock::new();
    FORWARDED.get_or_init(|| {
        Regex::new(r#"(?i)(?:^|[;,]\s*)for=([^;,\s]+)"#).expect("static regex is valid")
    })
}

/// Resolve the caller's IP from request headers, falling back to the peer address
///
/// Returns `None` when nothing usable is present; callers bucket those requests
/// under [`UNKNOWN_CLIENT`].
pub fn client_ip(headers: &HeaderMap, remote_addr: Option<IpAddr>) -> Option<String> {
    if let Some(ip) = header_first_value(headers, "x-forwarded-for") {
        return Some(ip);
    }

    for name in PROXY_HEADERS {
        if let Some(ip) = header_first_value(headers, name) {
            return Some(ip);
        }
    }

    if let Some(ip) = headers
        .get_all("forwarded")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(parse_forwarded)
    {
        return Some(ip);
    }

    remote_addr.map(|addr| addr.to_string())
}

/// Same as [`client_ip`] for a socket address, as handed out by `ConnectInfo`
pub fn client_ip_from_socket(headers: &HeaderMap, remote: Option<SocketAddr>) -> Option<String> {
    client_ip(headers, remote.map(|addr| addr.ip()))
}

/// First non-empty comma-separated value of the first header instance
fn header_first_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let value = headers.get(name)?.to_str().ok()?;
    extract_first_ip(value)
}

fn extract_first_ip(value: &str) -> Option<String> {
    let first = value.split(',').next()?.trim();
    if first.is_empty() {
        None
    } else {
        Some(first.to_string())
    }
}

/// Extract the `for=` token of an RFC 7239 `Forwarded` header
fn parse_forwarded(value: &str) -> Option<String> {
    let captures = forwarded_regex().captures(value)?;
    let token = captures.get(1)?.as_str();
    let cleaned: String = token
        .chars()
        .filter(|c| !matches!(c, '"' | '[' | ']'))
        .collect();
    let cleaned = cleaned.trim();

    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_x_forwarded_for_first_value() {
        let h = headers(&[("X-Forwarded-For", " 1.1.1.1 , 10.0.0.1, 10.0.0.2")]);
        assert_eq!(client_ip(&h, None), Some("1.1.1.1".to_string()));
    }

    #[test]
    fn test_x_forwarded_for_wins_over_proxy_headers() {
        let h = headers(&[
            ("cf-connecting-ip", "2.2.2.2"),
            ("x-forwarded-for", "1.1.1.1"),
        ]);
        assert_eq!(client_ip(&h, None), Some("1.1.1.1".to_string()));
    }

    #[test]
    fn test_proxy_header_priority() {
        let h = headers(&[
            ("X-Real-IP", "3.3.3.3"),
            ("CF-Connecting-IP", "2.2.2.2"),
            ("True-Client-IP", "4.4.4.4"),
        ]);
        assert_eq!(client_ip(&h, None), Some("2.2.2.2".to_string()));

        let h = headers(&[("True-Client-IP", "4.4.4.4"), ("X-Real-IP", "3.3.3.3")]);
        assert_eq!(client_ip(&h, None), Some("3.3.3.3".to_string()));
    }

    #[test]
    fn test_empty_header_is_skipped() {
        let h = headers(&[("x-forwarded-for", " , "), ("x-real-ip", "5.5.5.5")]);
        assert_eq!(client_ip(&h, None), Some("5.5.5.5".to_string()));
    }

    #[test]
    fn test_forwarded_header() {
        let h = headers(&[("Forwarded", "proto=https; for=\"[2001:db8::1]\";by=proxy")]);
        assert_eq!(client_ip(&h, None), Some("2001:db8::1".to_string()));

        let h = headers(&[("forwarded", "for=192.0.2.60;proto=http, for=198.51.100.17")]);
        assert_eq!(client_ip(&h, None), Some("192.0.2.60".to_string()));
    }

    #[test]
    fn test_forwarded_without_for_falls_through() {
        let h = headers(&[("forwarded", "proto=https;by=proxy")]);
        let remote: IpAddr = "9.9.9.9".parse().unwrap();
        assert_eq!(client_ip(&h, Some(remote)), Some("9.9.9.9".to_string()));
    }

    #[test]
    fn test_remote_address_fallback() {
        let remote: SocketAddr = "10.1.2.3:4567".parse().unwrap();
        assert_eq!(
            client_ip_from_socket(&HeaderMap::new(), Some(remote)),
            Some("10.1.2.3".to_string())
        );
    }

    #[test]
    fn test_nothing_resolvable() {
        assert_eq!(client_ip(&HeaderMap::new(), None), None);
    }
}
