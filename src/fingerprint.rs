//! Client fingerprinting.
//!
//! A fingerprint is the SHA-256 of the anonymized client IP concatenated with
//! the user agent. Anonymization keeps a /16 for IPv4 and a /64 for IPv6 so
//! that small address changes inside the same network do not break a session.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, FromRef, FromRequestParts};
use axum::http::header;
use axum::http::request::Parts;

use crate::config::Configuration;
use crate::crypto::{constant_time_eq, digest};

const FORWARDED_FOR: &str = "x-forwarded-for";
const UNKNOWN_USER_AGENT: &str = "unknown";

/// Truncate an IP address to its network part.
///
/// Unparseable input yields an empty string.
pub fn anonymize_ip(ip: &str) -> String {
    let Ok(ip) = ip.trim().parse::<IpAddr>() else {
        return String::default();
    };

    match ip.to_canonical() {
        IpAddr::V4(v4) => {
            let [a, b, _, _] = v4.octets();
            format!("{a}.{b}.0.0")
        },
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            format!(
                "{:x}:{:x}:{:x}:{:x}::",
                segments[0], segments[1], segments[2], segments[3]
            )
        },
    }
}

/// Hex encoded fingerprint bound into access tokens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute fingerprint from raw client attributes.
    pub fn generate(ip: &str, user_agent: &str) -> Self {
        let user_agent = if user_agent.is_empty() {
            UNKNOWN_USER_AGENT
        } else {
            user_agent
        };

        Self(digest(format!("{}{}", anonymize_ip(ip), user_agent)))
    }

    /// Compare with an expected fingerprint in constant time.
    pub fn matches(&self, expected: &str) -> bool {
        constant_time_eq(&self.0, expected)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Client attributes of the current request.
#[derive(Clone, Debug, Default)]
pub struct ClientInfo {
    pub ip: String,
    pub user_agent: String,
}

impl ClientInfo {
    /// Fingerprint of this client.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::generate(&self.ip, &self.user_agent)
    }

    /// Read client attributes from request parts.
    ///
    /// IP comes from the first `X-Forwarded-For` entry when `trust_forwarded`
    /// is set, else from the socket peer. Clients control that header, so it
    /// is only meaningful behind a proxy that rewrites it.
    pub fn from_parts(parts: &Parts, trust_forwarded: bool) -> Self {
        let forwarded = parts
            .headers
            .get(FORWARDED_FOR)
            .filter(|_| trust_forwarded)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(|ip| ip.trim().to_owned())
            .filter(|ip| !ip.is_empty());

        let ip = forwarded
            .or_else(|| {
                parts
                    .extensions
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| addr.ip().to_string())
            })
            .unwrap_or_default();

        let user_agent = parts
            .headers
            .get(header::USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_owned();

        Self { ip, user_agent }
    }
}

impl<S> FromRequestParts<S> for ClientInfo
where
    Arc<Configuration>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> Result<Self, Self::Rejection> {
        let config = Arc::<Configuration>::from_ref(state);
        Ok(Self::from_parts(parts, config.trust_forwarded_for))
    }
}

/// Recompute the fingerprint of `client` and compare it to `expected`.
pub fn validate_fingerprint(client: &ClientInfo, expected: &str) -> bool {
    client.fingerprint().matches(expected)
}
