//! API-key guard for the administrative routes.
//!
//! A request is admitted when it presents the configured key as
//! `Authorization: Bearer <key>`, `Authorization: API-Key <key>` or an
//! `API-Key: <key>` header. Without a configured key every administrative
//! request is refused.

use crate::errors::AppError;
use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tracing::warn;

pub const API_KEY_HEADER: &str = "api-key";

/// The key administrative requests must present.
#[derive(Clone, Debug, Default)]
pub struct AdminAuth {
    key: Option<Arc<str>>,
}

impl AdminAuth {
    pub fn new(key: Option<String>) -> Self {
        Self {
            key: key.filter(|k| !k.is_empty()).map(Arc::from),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.key.is_some()
    }

    fn admits(&self, headers: &HeaderMap) -> bool {
        match (self.key.as_deref(), presented_key(headers)) {
            (Some(expected), Some(presented)) => keys_match(expected, presented),
            _ => false,
        }
    }
}

fn presented_key(headers: &HeaderMap) -> Option<&str> {
    let from_authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("API-Key ")));
    from_authorization
        .or_else(|| headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()))
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Compare without bailing out at the first differing byte.
fn keys_match(expected: &str, presented: &str) -> bool {
    expected.len() == presented.len()
        && expected
            .bytes()
            .zip(presented.bytes())
            .fold(0u8, |diff, (a, b)| diff | (a ^ b))
            == 0
}

/// Middleware for `route_layer` on the administrative router.
pub async fn require_admin_key(
    State(auth): State<AdminAuth>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if !auth.admits(request.headers()) {
        warn!(
            method = %request.method(),
            path = %request.uri().path(),
            "rejected administrative request"
        );
        return Err(AppError::new(
            StatusCode::UNAUTHORIZED,
            "missing or invalid API key",
        ));
    }
    Ok(next.run(request).await)
}
