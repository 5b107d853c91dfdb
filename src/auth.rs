use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::AuthConfig;
use crate::error::ApiError;

/// Bearer-token gate applied to every route. Compares the SHA-256 hex digest
/// of the presented token against the configured digest, case-sensitively.
pub async fn require_bearer(
    State(config): State<Arc<AuthConfig>>,
    request: Request,
    next: Next,
) -> Response {
    if !config.enabled {
        return next.run(request).await;
    }

    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    let Some(header) = header else {
        warn!("missing Authorization header");
        return ApiError::unauthorized("Authorization header is required").into_response();
    };

    let mut parts = header.splitn(2, ' ');
    let scheme = parts.next().unwrap_or_default();
    let token = parts.next();

    let Some(token) = token.filter(|_| scheme.eq_ignore_ascii_case("bearer")) else {
        warn!("malformed Authorization header");
        return ApiError::unauthorized("Authorization header must be in format: Bearer <token>")
            .into_response();
    };

    let provided_hash = hash_key(token);
    if provided_hash != config.api_key_hash {
        warn!(provided_key_hash = %provided_hash, "invalid API key");
        return ApiError::unauthorized("Invalid API key").into_response();
    }

    debug!("API key validated");
    next.run(request).await
}

pub fn hash_key(key: &str) -> String {
    format!("{:x}", Sha256::digest(key.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, body::Body, http::StatusCode, middleware::from_fn_with_state, routing::get};
    use tower::ServiceExt;

    fn protected_router(enabled: bool) -> Router {
        let config = Arc::new(AuthConfig {
            enabled,
            api_key_hash: hash_key("secret-token"),
        });

        Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(from_fn_with_state(config, require_bearer))
    }

    async fn status_for(router: Router, authorization: Option<&str>) -> StatusCode {
        let mut request = axum::http::Request::builder().uri("/");
        if let Some(value) = authorization {
            request = request.header(AUTHORIZATION, value);
        }
        let response = router
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap();
        response.status()
    }

    #[test]
    fn digest_is_lowercase_sha256_hex() {
        assert_eq!(
            hash_key("hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[tokio::test]
    async fn missing_header_is_rejected() {
        assert_eq!(
            status_for(protected_router(true), None).await,
            StatusCode::UNAUTHORIZED
        );
    }

    #[tokio::test]
    async fn malformed_scheme_is_rejected() {
        assert_eq!(
            status_for(protected_router(true), Some("Basic abc")).await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_for(protected_router(true), Some("secret-token")).await,
            StatusCode::UNAUTHORIZED
        );
    }

    #[tokio::test]
    async fn wrong_token_is_rejected() {
        assert_eq!(
            status_for(protected_router(true), Some("Bearer wrong")).await,
            StatusCode::UNAUTHORIZED
        );
    }

    #[tokio::test]
    async fn matching_token_passes() {
        assert_eq!(
            status_for(protected_router(true), Some("Bearer secret-token")).await,
            StatusCode::OK
        );
        // scheme is case-insensitive, the token digest is not
        assert_eq!(
            status_for(protected_router(true), Some("bearer secret-token")).await,
            StatusCode::OK
        );
    }

    #[tokio::test]
    async fn disabled_auth_passes_everything() {
        assert_eq!(status_for(protected_router(false), None).await, StatusCode::OK);
    }
}
