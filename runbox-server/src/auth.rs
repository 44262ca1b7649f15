//! Bearer-token authentication
//!
//! API keys come from configuration; a resolved [`Tenant`] is attached to
//! the request extensions for the handlers and the rate limiter.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;

use runbox_core::{Error, Result};

use crate::routes::{ApiError, AppState};

/// The identity behind an API key: the unit of rate limiting.
#[derive(Debug, Clone)]
pub struct Tenant {
    pub token: String,
    pub label: String,
    /// Token-bucket refill rate in requests per second.
    pub rate: f64,
    /// Token-bucket capacity.
    pub burst: f64,
}

/// Resolve the `Authorization: Bearer` header against the configured keys.
pub fn resolve_bearer(
    tenants: &HashMap<String, Tenant>,
    headers: &HeaderMap,
) -> Result<Tenant> {
    let header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or(Error::Unauthorized)?;
    let token = header.strip_prefix("Bearer ").ok_or(Error::Unauthorized)?;
    tenants.get(token).cloned().ok_or(Error::Unauthorized)
}

/// Middleware for the bearer-protected routes.
pub async fn require_bearer(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> std::result::Result<Response, ApiError> {
    let tenant = resolve_bearer(&state.tenants, request.headers())?;
    tracing::debug!(tenant = %tenant.label, "authenticated");
    request.extensions_mut().insert(Arc::new(tenant));
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn tenants() -> HashMap<String, Tenant> {
        HashMap::from([(
            "dev_123".to_string(),
            Tenant {
                token: "dev_123".to_string(),
                label: "dev".to_string(),
                rate: 5.0,
                burst: 5.0,
            },
        )])
    }

    #[test]
    fn test_valid_bearer_resolves() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer dev_123"));
        let tenant = resolve_bearer(&tenants(), &headers).unwrap();
        assert_eq!(tenant.label, "dev");
    }

    #[test]
    fn test_missing_header_is_unauthorized() {
        let headers = HeaderMap::new();
        assert!(matches!(
            resolve_bearer(&tenants(), &headers),
            Err(Error::Unauthorized)
        ));
    }

    #[test]
    fn test_unknown_token_is_unauthorized() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer nope"));
        assert!(matches!(
            resolve_bearer(&tenants(), &headers),
            Err(Error::Unauthorized)
        ));
    }

    #[test]
    fn test_non_bearer_scheme_is_unauthorized() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Basic dev_123"));
        assert!(matches!(
            resolve_bearer(&tenants(), &headers),
            Err(Error::Unauthorized)
        ));
    }
}
