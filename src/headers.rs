//! Header rewriting for the proxy hop.
//!
//! Covers the hop-by-hop requirements of RFC 7230 Section 6.1 and the
//! de-facto `X-Forwarded-*` convention. Applied to requests on the way
//! to a backend and, for the hop-by-hop set, to responses on the way
//! back.

use std::net::IpAddr;

use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::http::uri::Authority;

/// Connection-scoped headers that must not cross a proxy hop.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Removes all hop-by-hop headers: the RFC 7230 §6.1 standard set plus
/// any additional names declared in the `Connection` header value.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let declared: Vec<HeaderName> = headers
        .get("connection")
        .and_then(|value| value.to_str().ok())
        .into_iter()
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in declared {
        headers.remove(&name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Injects the standard forwarding headers before the request leaves
/// for a backend.
///
/// `X-Forwarded-For` appends the client IP to any existing chain;
/// `X-Forwarded-Proto` records the client-facing scheme; and
/// `X-Forwarded-Host` preserves the original `Host` value when present.
pub fn inject_forwarding_headers(headers: &mut HeaderMap, client_ip: IpAddr) {
    let chain = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{existing}, {client_ip}"),
        None => client_ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&chain) {
        headers.insert("x-forwarded-for", value);
    }

    headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));

    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert("x-forwarded-host", host);
    }
}

/// Rewrites `Host` to the backend's authority so the origin sees the
/// address it is actually serving.
pub fn rewrite_host(headers: &mut HeaderMap, backend: &Authority) {
    if let Ok(value) = HeaderValue::from_str(backend.as_str()) {
        headers.insert(hyper::header::HOST, value);
    }
}
