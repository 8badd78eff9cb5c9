// src/utils/client.rs

use axum::http::HeaderMap;

use crate::models::session::ClientContext;

/// Client address as reported by the reverse proxy.
///
/// Takes the first hop of `X-Forwarded-For`, then `X-Real-IP`.
pub fn client_address(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    forwarded
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        })
        .map(str::to_string)
}

pub fn client_context(headers: &HeaderMap, device_fingerprint: Option<serde_json::Value>) -> ClientContext {
    ClientContext {
        client_address: client_address(headers),
        device_fingerprint,
    }
}
