// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Client IP resolution and request/response header tags.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use lazy_static::lazy_static;
use regex::Regex;

use crate::instrumentation::{normalize_headers, Multimap};
use crate::trace::{TagSetter, TagValue};

/// Headers searched for the client IP when none is configured, by priority.
pub const DEFAULT_IP_HEADERS: &[&str] = &[
    "x-forwarded-for",
    "x-real-ip",
    "true-client-ip",
    "x-client-ip",
    "forwarded",
    "forwarded-for",
    "x-cluster-client-ip",
    "fastly-client-ip",
    "cf-connecting-ip",
    "cf-connecting-ipv6",
];

/// Request headers reported as span tags, besides the IP headers.
pub const COLLECTED_REQUEST_HEADERS: &[&str] = &[
    "accept-encoding",
    "accept-language",
    "accept",
    "akamai-user-risk",
    "cf-ray",
    "cloudfront-viewer-ja3-fingerprint",
    "content-encoding",
    "content-language",
    "content-length",
    "content-type",
    "host",
    "user-agent",
    "via",
    "x-amzn-trace-id",
    "x-appgw-trace-id",
    "x-cloud-trace-context",
    "x-forwarded",
    "x-sigsci-requestid",
    "x-sigsci-tags",
];

pub const COLLECTED_RESPONSE_HEADERS: &[&str] = &[
    "content-encoding",
    "content-language",
    "content-length",
    "content-type",
];

pub const TAG_NETWORK_CLIENT_IP: &str = "network.client.ip";
pub const TAG_HTTP_CLIENT_IP: &str = "http.client_ip";

lazy_static! {
    static ref FORWARDED_FOR_REGEX: Regex =
        Regex::new(r"^(?:\[([a-f0-9:]+)\]|(\d+\.\d+\.\d+\.\d+))(?::\d+)?$")
            .expect("failed creating regex");
}

/// The IPs of a request: the peer of the connection, and the client as
/// resolved from the forwarding headers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientIps {
    pub remote_ip: Option<IpAddr>,
    pub client_ip: Option<IpAddr>,
}

impl ClientIps {
    /// Sets `network.client.ip` and `http.client_ip`, for the IPs that are
    /// known.
    pub fn set_tags(&self, span: &dyn TagSetter) {
        if let Some(ip) = self.remote_ip {
            span.set_tag(TAG_NETWORK_CLIENT_IP, TagValue::from(ip.to_string()));
        }
        if let Some(ip) = self.client_ip {
            span.set_tag(TAG_HTTP_CLIENT_IP, TagValue::from(ip.to_string()));
        }
    }
}

/// Resolves the client IP of a request.
///
/// `configured` replaces the default header list when set. Header names of
/// `headers` may use any case. The first global IP found in the headers
/// wins. A non-global one is only used when the remote address is not global
/// either.
#[must_use]
pub fn resolve_client_ip(
    configured: Option<&str>,
    headers: &Multimap,
    remote_addr: Option<&str>,
) -> ClientIps {
    let headers = normalize_headers(headers);
    let remote_ip = remote_addr.and_then(parse_remote_addr);

    let monitored: Vec<&str> = match configured {
        Some(name) => vec![name],
        None => DEFAULT_IP_HEADERS.to_vec(),
    };
    let found = find_header_ip(&headers, &monitored);

    let client_ip = match (found, remote_ip) {
        (Some(found), _) if is_global(found) => Some(found),
        (Some(found), Some(remote)) if !is_global(remote) => Some(found),
        (Some(found), None) => Some(found),
        (_, remote) => remote,
    };
    ClientIps {
        remote_ip,
        client_ip,
    }
}

/// The first global IP of the headers, else the first valid one.
fn find_header_ip(headers: &Multimap, monitored: &[&str]) -> Option<IpAddr> {
    let mut fallback = None;
    for name in monitored {
        let Some(values) = headers.get(&name.to_ascii_lowercase()) else {
            continue;
        };
        for value in values {
            let candidates = if name.eq_ignore_ascii_case("forwarded") {
                parse_forwarded(value)
            } else {
                value.split(',').filter_map(|ip| parse_ip(ip.trim())).collect()
            };
            for ip in candidates {
                if is_global(ip) {
                    return Some(ip);
                }
                fallback.get_or_insert(ip);
            }
        }
    }
    fallback
}

/// The `for=` IPs of a `Forwarded` header value.
fn parse_forwarded(value: &str) -> Vec<IpAddr> {
    value
        .split(',')
        .flat_map(|element| element.split(';'))
        .filter_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            if !key.trim().eq_ignore_ascii_case("for") {
                return None;
            }
            let value = value.trim().trim_matches('"').to_ascii_lowercase();
            let captures = FORWARDED_FOR_REGEX.captures(&value)?;
            captures
                .get(1)
                .or_else(|| captures.get(2))
                .and_then(|ip| ip.as_str().parse().ok())
        })
        .collect()
}

fn parse_ip(value: &str) -> Option<IpAddr> {
    let ip: IpAddr = value.parse().ok()?;
    Some(unmap(ip))
}

/// Parses a peer address, with or without a port.
fn parse_remote_addr(addr: &str) -> Option<IpAddr> {
    let addr = addr.trim();
    if let Some(ip) = parse_ip(addr) {
        return Some(ip);
    }
    if let Ok(socket) = addr.parse::<SocketAddr>() {
        return Some(unmap(socket.ip()));
    }
    let host = addr.rsplit_once(':').map_or(addr, |(host, _)| host);
    parse_ip(host.trim_start_matches('[').trim_end_matches(']'))
}

fn unmap(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(ip, IpAddr::V4),
        IpAddr::V4(_) => ip,
    }
}

/// Whether `ip` is a public unicast address.
#[must_use]
pub fn is_global(ip: IpAddr) -> bool {
    match unmap(ip) {
        IpAddr::V4(v4) => is_global_v4(v4),
        IpAddr::V6(v6) => is_global_v6(v6),
    }
}

fn is_global_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    // 100.64.0.0/10
    let shared = a == 100 && (b & 0xc0) == 64;
    !(ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_multicast()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || shared)
}

fn is_global_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    let unique_local = (first & 0xfe00) == 0xfc00;
    let link_local = (first & 0xffc0) == 0xfe80;
    let site_local = (first & 0xffc0) == 0xfec0;
    !(ip.is_loopback() || ip.is_multicast() || ip.is_unspecified() || unique_local || link_local || site_local)
}

/// Sets `http.request.headers.<name>` for the collected request headers and
/// the IP headers. Values of a repeated header are joined with commas.
pub fn set_request_header_tags(span: &dyn TagSetter, headers: &Multimap, configured: Option<&str>) {
    let headers = normalize_headers(headers);
    let configured = configured.map(str::to_ascii_lowercase);
    let names = COLLECTED_REQUEST_HEADERS
        .iter()
        .chain(DEFAULT_IP_HEADERS)
        .copied()
        .chain(configured.as_deref());
    set_header_tags(span, "http.request.headers", &headers, names);
}

/// Sets `http.response.headers.<name>` for the collected response headers.
pub fn set_response_header_tags(span: &dyn TagSetter, headers: &Multimap) {
    let headers = normalize_headers(headers);
    set_header_tags(
        span,
        "http.response.headers",
        &headers,
        COLLECTED_RESPONSE_HEADERS.iter().copied(),
    );
}

fn set_header_tags<'a>(
    span: &dyn TagSetter,
    prefix: &str,
    headers: &Multimap,
    names: impl Iterator<Item = &'a str>,
) {
    for name in names {
        let Some(values) = headers.get(name).filter(|v| !v.is_empty()) else {
            continue;
        };
        span.set_tag(&format!("{prefix}.{name}"), TagValue::from(values.join(",")));
    }
}
