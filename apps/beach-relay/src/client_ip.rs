use std::net::SocketAddr;

use axum::http::HeaderMap;

const CDN_DOMAIN_HEADER: &str = "tencent-acceleration-domain-name";

/// Best-effort client address for admission checks and logs.
///
/// Proxy headers win over the socket address. Behind the CDN the forwarded
/// chain is kept whole (with the CDN domain appended) so the allow-list can
/// match any hop.
pub fn client_ip(headers: &HeaderMap, remote_addr: Option<SocketAddr>) -> String {
    if let Some(cdn) = header_str(headers, CDN_DOMAIN_HEADER) {
        let forwarded = header_str(headers, "x-forwarded-for").unwrap_or_default();
        return format!("{forwarded}, {cdn}");
    }

    let raw = header_str(headers, "x-forwarded-for")
        .or_else(|| header_str(headers, "x-real-ip"))
        .map(str::to_string)
        .or_else(|| remote_addr.map(|addr| addr.to_string()))
        .unwrap_or_default();

    let ip = strip_port(&raw);
    if ip == "[::1]" || ip == "::1" {
        return "127.0.0.1".to_string();
    }
    ip.to_string()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn strip_port(raw: &str) -> &str {
    // A bare IPv6 address has several colons and no brackets: leave it alone.
    if raw.starts_with('[') {
        return match raw.rfind("]:") {
            Some(idx) => &raw[..=idx],
            None => raw,
        };
    }
    match raw.rsplit_once(':') {
        Some((host, _)) if !host.contains(':') => host,
        _ => raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test_timeout::timeout]
    fn prefers_forwarded_for_then_real_ip_then_socket() {
        let remote: SocketAddr = "192.0.2.1:5000".parse().unwrap();

        let forwarded = headers(&[("x-forwarded-for", "198.51.100.7"), ("x-real-ip", "10.0.0.1")]);
        assert_eq!(client_ip(&forwarded, Some(remote)), "198.51.100.7");

        let real_ip = headers(&[("x-real-ip", "10.0.0.1")]);
        assert_eq!(client_ip(&real_ip, Some(remote)), "10.0.0.1");

        assert_eq!(client_ip(&HeaderMap::new(), Some(remote)), "192.0.2.1");
        assert_eq!(client_ip(&HeaderMap::new(), None), "");
    }

    #[test_timeout::timeout]
    fn cdn_requests_keep_the_whole_chain() {
        let map = headers(&[
            ("tencent-acceleration-domain-name", "cdn.example.com"),
            ("x-forwarded-for", "198.51.100.7, 10.0.0.2"),
        ]);
        assert_eq!(
            client_ip(&map, None),
            "198.51.100.7, 10.0.0.2, cdn.example.com"
        );
    }

    #[test_timeout::timeout]
    fn loopback_v6_maps_to_v4() {
        let remote: SocketAddr = "[::1]:8080".parse().unwrap();
        assert_eq!(client_ip(&HeaderMap::new(), Some(remote)), "127.0.0.1");
    }

    #[test_timeout::timeout]
    fn strips_ports_without_mangling_v6() {
        assert_eq!(strip_port("10.0.0.1:80"), "10.0.0.1");
        assert_eq!(strip_port("[2001:db8::1]:443"), "[2001:db8::1]");
        assert_eq!(strip_port("2001:db8::1"), "2001:db8::1");
        assert_eq!(strip_port("10.0.0.1"), "10.0.0.1");
    }
}
