//! Session cookies.

use axum::http::header::{self, HeaderMap, HeaderValue};

pub const ACCESS_COOKIE: &str = "auth_token";
pub const REFRESH_COOKIE: &str = "refresh_token";

const ATTRIBUTES: &str = "Path=/; HttpOnly; Secure; SameSite=Strict";
const EPOCH: &str = "Thu, 01 Jan 1970 00:00:00 GMT";

/// `Set-Cookie` value delivering `value` for `max_age` seconds.
pub fn build(name: &str, value: &str, max_age: u64) -> Option<HeaderValue> {
    HeaderValue::from_str(&format!(
        "{name}={value}; {ATTRIBUTES}; Max-Age={max_age}"
    ))
    .ok()
}

/// `Set-Cookie` value removing cookie `name` from the client.
pub fn clear(name: &str) -> HeaderValue {
    HeaderValue::from_str(&format!(
        "{name}=; {ATTRIBUTES}; Max-Age=0; Expires={EPOCH}"
    ))
    .unwrap_or_else(|_| HeaderValue::from_static("invalid=; Max-Age=0"))
}

/// Read cookie `name` from the `Cookie` headers.
pub fn get(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

/// Append a fresh access/refresh cookie pair.
pub fn append_session(
    headers: &mut HeaderMap,
    access_token: &str,
    access_ttl: u64,
    refresh_token: &str,
    refresh_ttl: u64,
) {
    for cookie in [
        build(ACCESS_COOKIE, access_token, access_ttl),
        build(REFRESH_COOKIE, refresh_token, refresh_ttl),
    ]
    .into_iter()
    .flatten()
    {
        headers.append(header::SET_COOKIE, cookie);
    }
}

/// Append cookies wiping both tokens.
pub fn append_cleared(headers: &mut HeaderMap) {
    headers.append(header::SET_COOKIE, clear(ACCESS_COOKIE));
    headers.append(header::SET_COOKIE, clear(REFRESH_COOKIE));
}
