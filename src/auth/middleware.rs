use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, info};

use crate::AppState;
use crate::error::GatewayError;

use super::jwt::{extract_bearer_token, hash_token, validate_token};

/// Authenticated caller identity, attached to the request after the auth
/// stage and consumed by quota and the orchestrator.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: String,
    pub email: String,
    pub iam_username: String,
    pub iam_groups: Vec<String>,
    pub default_inference_profile: String,
    pub team: String,
    pub person: String,
    pub jti: String,
}

/// Resolve the client address behind proxies and load balancers:
/// X-Forwarded-For first entry, then X-Real-IP, then the peer address.
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok())
        && let Some(first) = forwarded.split(',').next()
    {
        let first = first.trim();
        if !first.is_empty() {
            return first.to_string();
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok())
        && !real_ip.is_empty()
    {
        return real_ip.to_string();
    }

    peer.ip().to_string()
}

/// Credential from `Authorization: Bearer` or, failing that, `x-api-key`
fn extract_credential(headers: &HeaderMap) -> Result<&str, GatewayError> {
    if let Some(auth_header) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        return extract_bearer_token(auth_header);
    }

    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .filter(|k| !k.is_empty())
        .ok_or_else(|| GatewayError::AuthFailure("missing authorization header or x-api-key".into()))
}

/// Authentication middleware: rate gates, claims validation, and the store
/// cross-check. On success a `Caller` extension rides with the request.
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    mut request: Request,
    next: Next,
) -> Response {
    let addr = client_ip(request.headers(), peer);

    if let Err(retry_after) = state.rate_limiter.check_source(&addr) {
        return GatewayError::RateLimited(retry_after.as_secs().max(1)).into_response();
    }

    let credential = match extract_credential(request.headers()) {
        Ok(c) => c.to_string(),
        Err(err) => {
            state.rate_limiter.record_failure(&addr, "");
            return err.into_response();
        }
    };

    let token_hash = hash_token(&credential);
    if let Err(retry_after) = state.rate_limiter.check_token(&token_hash) {
        return GatewayError::RateLimited(retry_after.as_secs().max(1)).into_response();
    }

    let claims = match validate_token(&credential, &state.jwt) {
        Ok(c) => c,
        Err(err) => {
            state.rate_limiter.record_failure(&addr, &token_hash);
            return err.into_response();
        }
    };

    let Some(store) = &state.store else {
        return GatewayError::DatabaseError("store unavailable".into()).into_response();
    };

    let record = match store.validate_token(&token_hash).await {
        Ok(r) => r,
        Err(err) => {
            state.rate_limiter.record_failure(&addr, &token_hash);
            return err.into_response();
        }
    };

    debug!(
        jti = %record.jti,
        email = %record.email,
        team = %record.team,
        person = %record.person,
        expires_at = %record.expires_at,
        profile = %record.inference_profile,
        "token record matched"
    );

    if record.is_revoked {
        state.rate_limiter.record_failure(&addr, &token_hash);
        return GatewayError::AuthFailure("token has been revoked".into()).into_response();
    }

    // The claim-embedded subject must match the stored owner
    if record.user_id != claims.sub || claims.sub != claims.user_id {
        state.rate_limiter.record_failure(&addr, &token_hash);
        return GatewayError::AuthFailure("token user mismatch".into()).into_response();
    }

    state.rate_limiter.record_success(&addr);

    let caller = Caller {
        user_id: claims.user_id,
        email: claims.email,
        iam_username: claims.iam_username,
        iam_groups: claims.iam_groups,
        default_inference_profile: claims.default_inference_profile,
        team: claims.team,
        person: claims.person,
        jti: claims.jti,
    };

    info!(
        user_id = %caller.user_id,
        email = %caller.email,
        iam_username = %caller.iam_username,
        team = %caller.team,
        source = %addr,
        "caller authenticated"
    );
    debug!(
        inference_profile = %caller.default_inference_profile,
        groups = caller.iam_groups.len(),
        jti = %caller.jti,
        "caller identity attached"
    );

    request.extensions_mut().insert(caller);
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn peer() -> SocketAddr {
        "192.0.2.7:55001".parse().unwrap()
    }

    #[test]
    fn client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.2"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.1"));
        assert_eq!(client_ip(&headers, peer()), "203.0.113.9");
    }

    #[test]
    fn client_ip_falls_back_to_real_ip_then_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.1"));
        assert_eq!(client_ip(&headers, peer()), "198.51.100.1");

        let headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, peer()), "192.0.2.7");
    }

    #[test]
    fn credential_from_bearer_or_api_key() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer tok-a"));
        assert_eq!(extract_credential(&headers).unwrap(), "tok-a");

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("tok-b"));
        assert_eq!(extract_credential(&headers).unwrap(), "tok-b");

        let headers = HeaderMap::new();
        assert!(extract_credential(&headers).is_err());
    }

    #[test]
    fn malformed_bearer_does_not_fall_through_to_api_key() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Token tok-a"));
        headers.insert("x-api-key", HeaderValue::from_static("tok-b"));
        assert!(extract_credential(&headers).is_err());
    }
}
