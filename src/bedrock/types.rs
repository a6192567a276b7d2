//! Serde models for the Converse wire format: the request body sent to
//! `converse-stream` and the event payloads read back off the event stream.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;

use super::eventstream::Frame;

// ============================================================================
// Request side
// ============================================================================

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CachePointBlock {
    #[serde(rename = "type")]
    pub kind: String,
}

impl Default for CachePointBlock {
    fn default() -> Self {
        Self {
            kind: "default".to_string(),
        }
    }
}

/// System prompt block: text, or a cache checkpoint marker
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum SystemBlock {
    Text(String),
    CachePoint(CachePointBlock),
}

/// Message content block
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ContentBlock {
    Text(String),
    CachePoint(CachePointBlock),
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConverseMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InferenceConfig {
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolInputSchema {
    pub json: Value,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpecification {
    pub name: String,
    pub description: String,
    pub input_schema: ToolInputSchema,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum Tool {
    ToolSpec(ToolSpecification),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ToolChoice {
    Auto {},
    Any {},
    Tool { name: String },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolConfiguration {
    pub tools: Vec<Tool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
}

/// Body of a `converse-stream` call
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConverseRequest {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub system: Vec<SystemBlock>,
    pub messages: Vec<ConverseMessage>,
    pub inference_config: InferenceConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_model_request_fields: Option<Value>,
}

// ============================================================================
// Stream side
// ============================================================================

/// Usage counters from the metadata event
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StreamUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    #[allow(dead_code)]
    pub total_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: Option<u64>,
    #[serde(default)]
    pub cache_write_input_tokens: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageStartEvent {
    #[serde(default)]
    #[allow(dead_code)]
    pub role: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentBlockStartEvent {
    #[serde(default)]
    #[allow(dead_code)]
    pub content_block_index: i32,
    #[serde(default)]
    #[allow(dead_code)]
    pub start: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentDelta {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    pub reasoning_content: Option<Value>,
    #[serde(default)]
    #[allow(dead_code)]
    pub tool_use: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentBlockDeltaEvent {
    #[serde(default)]
    #[allow(dead_code)]
    pub content_block_index: i32,
    #[serde(default)]
    pub delta: Option<ContentDelta>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentBlockStopEvent {
    #[serde(default)]
    #[allow(dead_code)]
    pub content_block_index: i32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataEvent {
    #[serde(default)]
    pub usage: Option<StreamUsage>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageStopEvent {
    #[serde(default)]
    pub stop_reason: Option<String>,
}

/// One provider event off the converse stream
#[derive(Debug, Clone)]
pub enum ConverseStreamEvent {
    MessageStart(MessageStartEvent),
    ContentBlockStart(ContentBlockStartEvent),
    ContentBlockDelta(ContentBlockDeltaEvent),
    ContentBlockStop(ContentBlockStopEvent),
    Metadata(MetadataEvent),
    MessageStop(MessageStopEvent),
}

impl ConverseStreamEvent {
    /// Decode a frame into a typed event. Exception frames become stream
    /// errors; unrecognized event types are skipped (None).
    pub fn from_frame(frame: &Frame) -> Result<Option<Self>, GatewayError> {
        if frame.message_type() == Some("exception") {
            let detail = serde_json::from_slice::<Value>(&frame.payload)
                .ok()
                .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
                .unwrap_or_default();
            return Err(GatewayError::UpstreamStreamError(format!(
                "{}: {detail}",
                frame.exception_type().unwrap_or("unknown exception")
            )));
        }

        let parse_err = |e: serde_json::Error| {
            GatewayError::UpstreamStreamError(format!("malformed event payload: {e}"))
        };

        let event = match frame.event_type() {
            Some("messageStart") => Some(ConverseStreamEvent::MessageStart(
                serde_json::from_slice(&frame.payload).map_err(parse_err)?,
            )),
            Some("contentBlockStart") => Some(ConverseStreamEvent::ContentBlockStart(
                serde_json::from_slice(&frame.payload).map_err(parse_err)?,
            )),
            Some("contentBlockDelta") => Some(ConverseStreamEvent::ContentBlockDelta(
                serde_json::from_slice(&frame.payload).map_err(parse_err)?,
            )),
            Some("contentBlockStop") => Some(ConverseStreamEvent::ContentBlockStop(
                serde_json::from_slice(&frame.payload).map_err(parse_err)?,
            )),
            Some("metadata") => Some(ConverseStreamEvent::Metadata(
                serde_json::from_slice(&frame.payload).map_err(parse_err)?,
            )),
            Some("messageStop") => Some(ConverseStreamEvent::MessageStop(
                serde_json::from_slice(&frame.payload).map_err(parse_err)?,
            )),
            _ => None,
        };

        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_blocks_serialize_to_converse_shapes() {
        let blocks = vec![
            SystemBlock::Text("You are terse.".into()),
            SystemBlock::CachePoint(CachePointBlock::default()),
        ];
        let json = serde_json::to_value(&blocks).unwrap();
        assert_eq!(
            json,
            serde_json::json!([
                {"text": "You are terse."},
                {"cachePoint": {"type": "default"}}
            ])
        );
    }

    #[test]
    fn converse_request_serializes_camel_case() {
        let req = ConverseRequest {
            system: vec![SystemBlock::Text("sys".into())],
            messages: vec![ConverseMessage {
                role: Role::User,
                content: vec![ContentBlock::Text("hello".into())],
            }],
            inference_config: InferenceConfig {
                max_tokens: 8192,
                temperature: 0.0,
            },
            additional_model_request_fields: None,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["inferenceConfig"]["maxTokens"], 8192);
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["messages"][0]["content"][0]["text"], "hello");
        assert!(json.get("additionalModelRequestFields").is_none());
    }

    #[test]
    fn tool_configuration_serializes_tool_spec_and_choice() {
        let config = ToolConfiguration {
            tools: vec![Tool::ToolSpec(ToolSpecification {
                name: "write_file".into(),
                description: "Write a file".into(),
                input_schema: ToolInputSchema {
                    json: serde_json::json!({"type": "object", "properties": {}}),
                },
            })],
            tool_choice: Some(ToolChoice::Tool {
                name: "write_file".into(),
            }),
        };
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["tools"][0]["toolSpec"]["name"], "write_file");
        assert!(json["tools"][0]["toolSpec"]["inputSchema"]["json"].is_object());
        assert_eq!(json["toolChoice"]["tool"]["name"], "write_file");

        let auto = serde_json::to_value(ToolChoice::Auto {}).unwrap();
        assert_eq!(auto, serde_json::json!({"auto": {}}));
    }

    #[test]
    fn metadata_event_parses_cache_counters() {
        let payload = br#"{"usage":{"inputTokens":42,"outputTokens":7,"totalTokens":49,
            "cacheReadInputTokens":30,"cacheWriteInputTokens":5},"metrics":{"latencyMs":812}}"#;
        let event: MetadataEvent = serde_json::from_slice(payload).unwrap();
        let usage = event.usage.unwrap();
        assert_eq!(usage.input_tokens, 42);
        assert_eq!(usage.output_tokens, 7);
        assert_eq!(usage.cache_read_input_tokens, Some(30));
        assert_eq!(usage.cache_write_input_tokens, Some(5));
    }

    #[test]
    fn message_stop_parses_stop_reason() {
        let event: MessageStopEvent =
            serde_json::from_slice(br#"{"stopReason":"max_tokens"}"#).unwrap();
        assert_eq!(event.stop_reason.as_deref(), Some("max_tokens"));
    }
}
