use axum::http::{header, HeaderMap, HeaderValue};
use uuid::Uuid;

/// Cookie carrying the session token.
pub const SESSION_COOKIE: &str = "sessionId";

/// Generate a new opaque session token.
pub fn generate_token() -> String {
    Uuid::new_v4().to_string()
}

/// Pull the session token out of the `Cookie` header(s), if any.
pub fn token_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.trim_matches('"').to_string())
        .filter(|value| !value.is_empty())
}

pub fn session_cookie(token: &str) -> HeaderValue {
    // Tokens are UUIDs, always valid header bytes.
    HeaderValue::from_str(&format!(
        "{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Lax"
    ))
    .unwrap_or_else(|_| clear_session_cookie())
}

pub fn clear_session_cookie() -> HeaderValue {
    HeaderValue::from_static("sessionId=; Path=/; HttpOnly; Max-Age=0")
}
