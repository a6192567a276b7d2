use std::collections::HashMap;

use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::debug;

use crate::config::BedrockConfig;
use crate::error::GatewayError;

use super::sigv4::SigV4Signer;
use super::types::ConverseRequest;

/// Signed HTTP client for the Bedrock runtime. Carries no per-request
/// state; one instance is shared across all requests. Signing and sending
/// are separate steps so the orchestrator can time them as phases.
#[derive(Clone)]
pub struct BedrockClient {
    config: BedrockConfig,
    signer: SigV4Signer,
    http: reqwest::Client,
}

impl BedrockClient {
    pub fn new(config: BedrockConfig, http: reqwest::Client) -> Self {
        let signer = SigV4Signer::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            config.region.clone(),
        );
        Self {
            config,
            signer,
            http,
        }
    }

    pub fn config(&self) -> &BedrockConfig {
        &self.config
    }

    pub fn region(&self) -> &str {
        &self.config.region
    }

    fn runtime_url(&self, inference_profile: &str, action: &str) -> String {
        let escaped: String =
            url::form_urlencoded::byte_serialize(inference_profile.as_bytes()).collect();
        format!(
            "https://bedrock-runtime.{}.amazonaws.com/model/{}/{}",
            self.config.region, escaped, action
        )
    }

    /// Build and sign a streaming Converse call for the caller's profile
    pub fn sign_converse_stream(
        &self,
        inference_profile: &str,
        request: &ConverseRequest,
    ) -> Result<reqwest::Request, GatewayError> {
        let body = serde_json::to_vec(request)
            .map_err(|e| GatewayError::UpstreamSigningError(format!("serialize request: {e}")))?;
        let url = self.runtime_url(inference_profile, "converse-stream");
        self.build_signed(&url, body, "application/vnd.amazon.eventstream")
    }

    /// Build and sign the non-streaming invoke passthrough for an
    /// already-rewritten Anthropic body
    pub fn sign_invoke(
        &self,
        inference_profile: &str,
        body: Vec<u8>,
    ) -> Result<reqwest::Request, GatewayError> {
        let url = self.runtime_url(inference_profile, "invoke");
        self.build_signed(&url, body, "application/json")
    }

    /// Execute a signed streaming call; non-success is an upstream error
    /// since no stream bytes have reached the client yet.
    pub async fn send_converse_stream(
        &self,
        request: reqwest::Request,
    ) -> Result<reqwest::Response, GatewayError> {
        let response = self.send(request).await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(GatewayError::UpstreamCallError(format!(
                "converse stream returned {status}: {text}"
            )));
        }
        Ok(response)
    }

    /// Execute a signed request as-is; the caller relays whatever comes back
    pub async fn send(&self, request: reqwest::Request) -> Result<reqwest::Response, GatewayError> {
        self.http
            .execute(request)
            .await
            .map_err(|e| GatewayError::UpstreamCallError(e.to_string()))
    }

    fn build_signed(
        &self,
        url: &str,
        body: Vec<u8>,
        accept: &str,
    ) -> Result<reqwest::Request, GatewayError> {
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        headers.insert("accept".to_string(), accept.to_string());

        let signed = self
            .signer
            .sign_request("POST", url, &headers, &body, Utc::now())?;

        if self.config.debug {
            debug!(url, body_len = body.len(), "signed bedrock request");
        }

        let mut header_map = HeaderMap::new();
        for (name, value) in &signed {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| GatewayError::UpstreamSigningError(format!("header name: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| GatewayError::UpstreamSigningError(format!("header value: {e}")))?;
            header_map.insert(name, value);
        }

        self.http
            .post(url)
            .headers(header_map)
            .body(body)
            .build()
            .map_err(|e| GatewayError::UpstreamSigningError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bedrock::types::{ConverseMessage, ContentBlock, InferenceConfig, Role};

    fn client() -> BedrockClient {
        let config = BedrockConfig {
            access_key: "AK".into(),
            secret_key: "SK".into(),
            region: "eu-west-1".into(),
            anthropic_version: "bedrock-2023-05-31".into(),
            enable_computer_use: false,
            enable_output_reason: false,
            reason_budget_tokens: 1024,
            max_tokens: 0,
            debug: false,
        };
        BedrockClient::new(config, reqwest::Client::new())
    }

    #[test]
    fn runtime_url_escapes_profile_arns() {
        let url = client().runtime_url(
            "arn:aws:bedrock:eu-west-1:701055077130:application-inference-profile/hjy3duh3aoos",
            "converse-stream",
        );
        assert_eq!(
            url,
            "https://bedrock-runtime.eu-west-1.amazonaws.com/model/arn%3Aaws%3Abedrock%3Aeu-west-1%3A701055077130%3Aapplication-inference-profile%2Fhjy3duh3aoos/converse-stream"
        );
    }

    #[test]
    fn signed_converse_request_carries_auth_headers() {
        let request = ConverseRequest {
            system: Vec::new(),
            messages: vec![ConverseMessage {
                role: Role::User,
                content: vec![ContentBlock::Text("hi".into())],
            }],
            inference_config: InferenceConfig {
                max_tokens: 8192,
                temperature: 0.0,
            },
            additional_model_request_fields: None,
        };

        let signed = client()
            .sign_converse_stream("us.anthropic.claude-sonnet-4-5-v2:0", &request)
            .unwrap();

        assert_eq!(signed.method(), "POST");
        assert!(signed.headers().contains_key("authorization"));
        assert!(signed.headers().contains_key("x-amz-date"));
        assert_eq!(
            signed.headers().get("accept").unwrap(),
            "application/vnd.amazon.eventstream"
        );
        assert_eq!(
            signed.headers().get("content-type").unwrap(),
            "application/json"
        );
    }

    #[test]
    fn signed_invoke_accepts_json() {
        let signed = client()
            .sign_invoke("us.anthropic.claude-sonnet-4-5-v2:0", b"{}".to_vec())
            .unwrap();
        assert_eq!(signed.headers().get("accept").unwrap(), "application/json");
        assert!(signed.url().path().ends_with("/invoke"));
    }
}
