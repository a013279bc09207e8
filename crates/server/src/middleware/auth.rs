use async_trait::async_trait;
use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};

use crate::config::AppState;

/// Authorizes inbound requests from a bearer token.
///
/// The gateway only ever hands this a token; it has no opinion on how
/// tokens map to identity or scope. Deployments that need real
/// authentication swap in their own implementation.
#[async_trait]
pub trait AuthChecker: Send + Sync {
    async fn check(&self, token: Option<&str>) -> bool;
}

/// Accepts any request, including ones with no token at all.
///
/// This is the default so the gateway runs out of the box; anything
/// beyond a trusted network or a front door proxy should replace it.
pub struct AllowAllAuthChecker;

#[async_trait]
impl AuthChecker for AllowAllAuthChecker {
    async fn check(&self, _token: Option<&str>) -> bool {
        true
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    value.strip_prefix("Bearer ")
}

pub async fn require_auth(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = bearer_token(req.headers());
    if state.auth_checker.check(token).await {
        Ok(next.run(req).await)
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allow_all_accepts_missing_token() {
        let checker = AllowAllAuthChecker;
        assert!(checker.check(None).await);
    }

    #[tokio::test]
    async fn allow_all_accepts_any_token() {
        let checker = AllowAllAuthChecker;
        assert!(checker.check(Some("whatever")).await);
    }

    #[test]
    fn bearer_token_strips_prefix() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer secret-token".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("secret-token"));
    }

    #[test]
    fn bearer_token_ignores_other_schemes() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Basic dXNlcjpwYXNz".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }
}
