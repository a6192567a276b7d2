use axum::{
    Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("missing required configuration: {0}")]
    ConfigMissing(String),

    #[error("failed to parse request: {0}")]
    ParseError(String),

    #[error("{0}")]
    ValidationError(String),

    #[error("{0}")]
    AuthFailure(String),

    #[error("too many authentication attempts, please try again in {0} seconds")]
    RateLimited(u64),

    #[error("{0}")]
    QuotaExceeded(String),

    #[error("user is blocked due to quota limits exceeded")]
    UserBlocked,

    #[error("user must have default_inference_profile configured in JWT")]
    ProfileMissing,

    #[error("request signing failed: {0}")]
    UpstreamSigningError(String),

    #[error("upstream call failed: {0}")]
    UpstreamCallError(String),

    #[error("stream error: {0}")]
    UpstreamStreamError(String),

    #[error("database error: {0}")]
    DatabaseError(String),

    #[error("metrics queue is full, metric dropped")]
    DropMetric,
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::ConfigMissing(_) | GatewayError::DatabaseError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            GatewayError::ParseError(_) | GatewayError::ValidationError(_) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::AuthFailure(_) => StatusCode::UNAUTHORIZED,
            GatewayError::RateLimited(_) | GatewayError::QuotaExceeded(_) => {
                StatusCode::TOO_MANY_REQUESTS
            }
            GatewayError::UserBlocked | GatewayError::ProfileMissing => StatusCode::FORBIDDEN,
            GatewayError::UpstreamSigningError(_)
            | GatewayError::UpstreamCallError(_)
            | GatewayError::UpstreamStreamError(_) => StatusCode::BAD_GATEWAY,
            // Drops are logged by the caller, never surfaced
            GatewayError::DropMetric => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(e: sqlx::Error) -> Self {
        GatewayError::DatabaseError(e.to_string())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({ "error": self.to_string() }));

        // Rate-limit rejections carry the remaining block duration
        if let GatewayError::RateLimited(retry_after) = &self {
            return (
                status,
                [(header::RETRY_AFTER, retry_after.to_string())],
                body,
            )
                .into_response();
        }

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            GatewayError::ParseError("bad json".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::AuthFailure("invalid token".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayError::RateLimited(900).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(GatewayError::UserBlocked.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            GatewayError::ProfileMissing.status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            GatewayError::UpstreamCallError("timeout".into()).status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn rate_limited_response_has_retry_after() {
        let resp = GatewayError::RateLimited(42).into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            resp.headers().get(header::RETRY_AFTER).unwrap(),
            "42"
        );
    }
}
