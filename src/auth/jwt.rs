use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::JwtConfig;
use crate::error::GatewayError;

/// Claims carried by gateway credentials. Registered claims plus the
/// caller identity fields minted by the token service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
    #[serde(default)]
    pub iss: String,
    #[serde(default)]
    pub aud: String,
    #[serde(default)]
    pub jti: String,
    pub user_id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub iam_username: String,
    #[serde(default)]
    pub iam_groups: Vec<String>,
    #[serde(default)]
    pub default_inference_profile: String,
    #[serde(default)]
    pub team: String,
    #[serde(default)]
    pub person: String,
}

/// Validate a credential as an HMAC-SHA256 signed claims envelope.
/// Any other algorithm in the header is a hard reject, before signature
/// verification is even attempted.
pub fn validate_token(token: &str, config: &JwtConfig) -> Result<Claims, GatewayError> {
    let header = decode_header(token)
        .map_err(|e| GatewayError::AuthFailure(format!("invalid token: {e}")))?;
    if header.alg != Algorithm::HS256 {
        return Err(GatewayError::AuthFailure(format!(
            "unexpected signing method: {:?}",
            header.alg
        )));
    }

    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_required_spec_claims(&["exp"]);
    if !config.issuer.is_empty() {
        validation.set_issuer(&[&config.issuer]);
    }
    if config.audience.is_empty() {
        validation.validate_aud = false;
    } else {
        validation.set_audience(&[&config.audience]);
    }

    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.secret_key.as_bytes()),
        &validation,
    )
    .map_err(|e| GatewayError::AuthFailure(format!("invalid token: {e}")))?;

    Ok(data.claims)
}

/// SHA-256 hex of the opaque credential, used for store lookups and
/// per-token rate limiting. The raw credential is never persisted.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Extract the credential from an `Authorization: Bearer <token>` value
pub fn extract_bearer_token(header: &str) -> Result<&str, GatewayError> {
    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| {
            GatewayError::AuthFailure("authorization header must start with 'Bearer '".into())
        })?;
    if token.is_empty() {
        return Err(GatewayError::AuthFailure("token is empty".into()));
    }
    Ok(token)
}
