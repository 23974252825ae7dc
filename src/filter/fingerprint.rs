//! Client IP resolution.
//!
//! The filter resolves the client address once per request and stashes it
//! as a [`ClientIp`] extension; IP-based rules and application extractors
//! read it from there.

use axum::extract::{ConnectInfo, Request};
use std::net::SocketAddr;

/// The resolved client address for this request.
#[derive(Debug, Clone)]
pub struct ClientIp(pub Option<String>);

/// Read the client IP for a request: the filter's resolved extension if
/// present, otherwise the direct connection address.
pub fn client_ip(req: &Request) -> Option<String> {
    if let Some(ClientIp(ip)) = req.extensions().get::<ClientIp>() {
        return ip.clone();
    }
    connection_ip(req)
}

fn connection_ip(req: &Request) -> Option<String> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|addr| addr.ip().to_string())
}

/// Resolve the client address.
///
/// SECURITY: proxy headers are only consulted when `trust_proxy` is set.
/// Trusting `X-Forwarded-For` without a proxy in front lets clients spoof
/// their address and bypass per-IP rules.
pub(crate) fn resolve_client_ip(req: &Request, trust_proxy: bool) -> Option<String> {
    if trust_proxy {
        req.headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            // May contain "client, proxy1, proxy2"; the leftmost entry is
            // the original client when the proxy chain is trusted.
            .map(|s| s.split(',').next().unwrap_or(s).trim().to_string())
            .filter(|s| !s.is_empty())
            .or_else(|| {
                req.headers()
                    .get("x-real-ip")
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
            })
            .or_else(|| connection_ip(req))
    } else {
        connection_ip(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request_from(addr: &str) -> Request {
        let mut req = Request::builder().uri("/").body(Body::empty()).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo::<SocketAddr>(addr.parse().unwrap()));
        req
    }

    #[test]
    fn test_direct_connection_ip() {
        let req = request_from("1.2.3.4:5678");
        assert_eq!(resolve_client_ip(&req, false), Some("1.2.3.4".to_string()));
    }

    #[test]
    fn test_forwarded_header_ignored_without_trust() {
        let mut req = request_from("10.0.0.1:80");
        req.headers_mut()
            .insert("x-forwarded-for", "1.2.3.4".parse().unwrap());
        assert_eq!(resolve_client_ip(&req, false), Some("10.0.0.1".to_string()));
    }

    #[test]
    fn test_forwarded_header_leftmost_when_trusted() {
        let mut req = request_from("10.0.0.1:80");
        req.headers_mut()
            .insert("x-forwarded-for", "1.2.3.4, 10.0.0.2".parse().unwrap());
        assert_eq!(resolve_client_ip(&req, true), Some("1.2.3.4".to_string()));
    }

    #[test]
    fn test_real_ip_fallback_when_trusted() {
        let mut req = request_from("10.0.0.1:80");
        req.headers_mut()
            .insert("x-real-ip", "5.6.7.8".parse().unwrap());
        assert_eq!(resolve_client_ip(&req, true), Some("5.6.7.8".to_string()));
    }

    #[test]
    fn test_client_ip_prefers_resolved_extension() {
        let mut req = request_from("10.0.0.1:80");
        req.extensions_mut()
            .insert(ClientIp(Some("1.2.3.4".to_string())));
        assert_eq!(client_ip(&req), Some("1.2.3.4".to_string()));
    }
}
