//! Client IP resolution shared by the rate limiters, the brute-force tracker
//! and request logging.
//!
//! The IP is resolved once per request by [`resolve_client_ip`] and stored as
//! a [`ClientIp`] request extension; later layers read it with
//! [`ClientIp::of`].
//!
//! # Resolution Order
//!
//! 1. `X-Forwarded-For` (first entry), then `X-Real-IP`, **if** the headers
//!    are trusted (see below)
//! 2. The socket peer address from Axum's `ConnectInfo`
//! 3. [`UNKNOWN_IP`]
//!
//! # Security Warning: IP Spoofing Risk
//!
//! Outside production, an empty `TRUSTED_PROXIES` trusts forwarding headers
//! from any peer. That is convenient in development but lets a directly
//! connected client pick its own rate-limit key, so production runs the
//! config in [strict](TrustedProxyConfig::strict) mode: with no ranges set,
//! forwarding headers are ignored and the socket peer is used. With ranges
//! set, headers are honoured only when the socket peer falls inside one of
//! them.
//!
//! ## The "unknown" Fallback
//!
//! When no address can be determined, all such requests share the
//! `"unknown"` key and are limited collectively.

use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use tracing::{debug, warn};

/// Fallback IP value when no client IP can be determined.
pub const UNKNOWN_IP: &str = "unknown";

// =============================================================================
// Trusted Proxy CIDR Matching
// =============================================================================

/// Parsed CIDR network range for trusted proxy validation.
#[derive(Debug, Clone)]
pub struct CidrRange {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrRange {
    /// Parse a CIDR notation string (e.g., "10.0.0.0/8" or "::1/128").
    /// A bare address is treated as a /32 or /128.
    ///
    /// Returns `None` if the format is invalid.
    pub fn parse(cidr: &str) -> Option<Self> {
        let cidr = cidr.trim();
        let (addr, prefix) = match cidr.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (cidr, None),
        };

        let network: IpAddr = addr.parse().ok()?;
        let max_prefix = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let prefix_len = match prefix {
            Some(p) => p.parse::<u8>().ok().filter(|p| *p <= max_prefix)?,
            None => max_prefix,
        };

        Some(Self {
            network,
            prefix_len,
        })
    }

    /// Check if an IP address is contained within this CIDR range.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (&self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = u32::MAX
                    .checked_shl(32 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                (u32::from(*net) & mask) == (u32::from(*addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = u128::MAX
                    .checked_shl(128 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                (u128::from(*net) & mask) == (u128::from(*addr) & mask)
            }
            _ => false,
        }
    }
}

/// Which peers may set forwarding headers.
#[derive(Debug, Clone)]
pub struct TrustedProxyConfig {
    ranges: Vec<CidrRange>,
    trust_any_peer: bool,
}

impl Default for TrustedProxyConfig {
    fn default() -> Self {
        Self {
            ranges: Vec::new(),
            trust_any_peer: true,
        }
    }
}

impl TrustedProxyConfig {
    /// Build from CIDR strings. Invalid entries are logged and skipped.
    ///
    /// With no valid ranges every peer is trusted until [`strict`](Self::strict)
    /// is applied.
    pub fn new(cidrs: &[String]) -> Self {
        let ranges: Vec<CidrRange> = cidrs
            .iter()
            .filter_map(|cidr| {
                let parsed = CidrRange::parse(cidr);
                if parsed.is_none() {
                    warn!(cidr = %cidr, "Invalid CIDR range in TRUSTED_PROXIES, skipping");
                }
                parsed
            })
            .collect();

        if !ranges.is_empty() {
            debug!(count = ranges.len(), "Trusted proxy validation enabled");
        }

        let trust_any_peer = ranges.is_empty();
        Self {
            ranges,
            trust_any_peer,
        }
    }

    /// Only peers inside a configured range are trusted. With no ranges,
    /// forwarding headers are ignored entirely.
    #[must_use]
    pub fn strict(mut self) -> Self {
        self.trust_any_peer = false;
        self
    }

    pub fn is_enabled(&self) -> bool {
        !self.ranges.is_empty()
    }

    pub fn trusts_any_peer(&self) -> bool {
        self.trust_any_peer
    }

    /// Whether forwarding headers from `peer` should be believed.
    pub fn trusts(&self, peer: Option<IpAddr>) -> bool {
        if self.trust_any_peer {
            return true;
        }
        peer.is_some_and(|ip| self.ranges.iter().any(|range| range.contains(&ip)))
    }
}

// =============================================================================
// Resolution
// =============================================================================

/// The resolved client address for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp(pub Cow<'static, str>);

impl ClientIp {
    /// The resolved IP of `req`, or [`UNKNOWN_IP`] if the resolver did not run.
    pub fn of<B>(req: &axum::http::Request<B>) -> &str {
        req.extensions()
            .get::<ClientIp>()
            .map_or(UNKNOWN_IP, |ip| ip.0.as_ref())
    }
}

/// Forwarding header value, first hop only.
fn forwarded_ip<B>(req: &axum::http::Request<B>) -> Option<&str> {
    if let Some(forwarded) = req.headers().get("x-forwarded-for")
        && let Ok(value) = forwarded.to_str()
        && let Some(first_ip) = value.split(',').next().map(str::trim)
        && !first_ip.is_empty()
    {
        return Some(first_ip);
    }

    req.headers()
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Determine the client IP of `req` under `trusted`.
pub fn extract_client_ip<B>(
    req: &axum::http::Request<B>,
    trusted: &TrustedProxyConfig,
) -> Cow<'static, str> {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    if let Some(ip) = forwarded_ip(req) {
        if trusted.trusts(peer) {
            return Cow::Owned(ip.to_string());
        }
        debug!(
            forwarded = %ip,
            peer = ?peer,
            "Ignoring forwarding header from untrusted peer"
        );
    }

    match peer {
        Some(ip) => Cow::Owned(ip.to_string()),
        None => Cow::Borrowed(UNKNOWN_IP),
    }
}

/// Middleware storing the resolved [`ClientIp`] in request extensions.
pub async fn resolve_client_ip(
    State(trusted): State<Arc<TrustedProxyConfig>>,
    mut req: Request,
    next: Next,
) -> Response {
    let ip = extract_client_ip(&req, &trusted);
    req.extensions_mut().insert(ClientIp(ip));
    next.run(req).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;

    fn with_peer(builder: axum::http::request::Builder, peer: &str) -> Request<Body> {
        let mut req = builder.body(Body::empty()).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(peer.parse::<SocketAddr>().unwrap()));
        req
    }

    #[test]
    fn test_xff_first_hop_when_trusting_all() {
        let req = Request::builder()
            .header("x-forwarded-for", "  192.168.1.1  , 10.0.0.1")
            .body(Body::empty())
            .unwrap();
        let ip = extract_client_ip(&req, &TrustedProxyConfig::default());
        assert_eq!(ip, "192.168.1.1");
    }

    #[test]
    fn test_xff_priority_over_real_ip() {
        let req = Request::builder()
            .header("x-forwarded-for", "10.0.0.1")
            .header("x-real-ip", "192.168.1.1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(
            extract_client_ip(&req, &TrustedProxyConfig::default()),
            "10.0.0.1"
        );
    }

    #[test]
    fn test_empty_xff_falls_back_to_real_ip() {
        let req = Request::builder()
            .header("x-forwarded-for", "   ")
            .header("x-real-ip", "::1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_client_ip(&req, &TrustedProxyConfig::default()), "::1");
    }

    #[test]
    fn test_unknown_is_borrowed() {
        let req = Request::builder().body(Body::empty()).unwrap();
        let ip = extract_client_ip(&req, &TrustedProxyConfig::default());
        assert_eq!(ip, UNKNOWN_IP);
        assert!(matches!(ip, Cow::Borrowed(_)));
    }

    #[test]
    fn test_peer_address_used_without_headers() {
        let req = with_peer(Request::builder(), "203.0.113.9:51234");
        assert_eq!(
            extract_client_ip(&req, &TrustedProxyConfig::default()),
            "203.0.113.9"
        );
    }

    #[test]
    fn test_headers_ignored_from_untrusted_peer() {
        let trusted = TrustedProxyConfig::new(&["10.0.0.0/8".to_string()]);
        let req = with_peer(
            Request::builder().header("x-forwarded-for", "1.2.3.4"),
            "198.51.100.7:443",
        );
        assert_eq!(extract_client_ip(&req, &trusted), "198.51.100.7");
    }

    #[test]
    fn test_headers_honoured_from_trusted_peer() {
        let trusted = TrustedProxyConfig::new(&["10.0.0.0/8".to_string()]);
        let req = with_peer(
            Request::builder().header("x-forwarded-for", "1.2.3.4, 10.1.1.1"),
            "10.1.1.1:443",
        );
        assert_eq!(extract_client_ip(&req, &trusted), "1.2.3.4");
    }

    #[test]
    fn test_headers_ignored_without_peer_when_ranges_set() {
        let trusted = TrustedProxyConfig::new(&["10.0.0.0/8".to_string()]);
        let req = Request::builder()
            .header("x-forwarded-for", "1.2.3.4")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_client_ip(&req, &trusted), UNKNOWN_IP);
    }

    #[test]
    fn test_strict_without_ranges_ignores_headers() {
        let trusted = TrustedProxyConfig::new(&[]).strict();
        assert!(!trusted.trusts_any_peer());

        let req = with_peer(
            Request::builder()
                .header("x-forwarded-for", "1.2.3.4")
                .header("x-real-ip", "5.6.7.8"),
            "198.51.100.7:443",
        );
        assert_eq!(extract_client_ip(&req, &trusted), "198.51.100.7");

        let req = Request::builder()
            .header("x-forwarded-for", "1.2.3.4")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_client_ip(&req, &trusted), UNKNOWN_IP);
    }

    #[test]
    fn test_strict_keeps_configured_ranges() {
        let trusted = TrustedProxyConfig::new(&["10.0.0.0/8".to_string()]).strict();
        let req = with_peer(
            Request::builder().header("x-forwarded-for", "1.2.3.4"),
            "10.1.1.1:443",
        );
        assert_eq!(extract_client_ip(&req, &trusted), "1.2.3.4");
    }

    #[test]
    fn test_client_ip_of_defaults_to_unknown() {
        let mut req = Request::builder().body(Body::empty()).unwrap();
        assert_eq!(ClientIp::of(&req), UNKNOWN_IP);
        req.extensions_mut()
            .insert(ClientIp(Cow::Owned("10.9.8.7".into())));
        assert_eq!(ClientIp::of(&req), "10.9.8.7");
    }

    // ==========================================================================
    // CIDR Range Tests
    // ==========================================================================

    #[test]
    fn test_cidr_parse() {
        assert_eq!(CidrRange::parse("10.0.0.0/8").unwrap().prefix_len, 8);
        assert_eq!(CidrRange::parse("::1/128").unwrap().prefix_len, 128);
        assert_eq!(CidrRange::parse("192.168.1.1").unwrap().prefix_len, 32);
        assert!(CidrRange::parse("not-an-ip").is_none());
        assert!(CidrRange::parse("10.0.0.0/33").is_none());
    }

    #[test]
    fn test_cidr_contains() {
        let cidr = CidrRange::parse("192.168.1.0/24").unwrap();
        assert!(cidr.contains(&"192.168.1.254".parse().unwrap()));
        assert!(!cidr.contains(&"192.168.2.1".parse().unwrap()));
        assert!(!cidr.contains(&"::1".parse().unwrap()));

        let everything = CidrRange::parse("0.0.0.0/0").unwrap();
        assert!(everything.contains(&"8.8.8.8".parse().unwrap()));
    }
}
