//! Inbound envelope parsing and translation to the Converse request shape.
//!
//! The polymorphic `system` and `content` fields (string or sequence of
//! typed blocks) are validated here at the parser boundary; everything
//! downstream handles typed variants only.

use serde::Deserialize;
use serde_json::{Value, json};

use crate::bedrock::types::{
    CachePointBlock, ContentBlock, ConverseMessage, ConverseRequest, InferenceConfig, Role,
    SystemBlock, Tool, ToolChoice, ToolConfiguration, ToolInputSchema, ToolSpecification,
};
use crate::config::BedrockConfig;
use crate::constants::{
    COMPUTER_USE_BETA, DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE, MAX_MESSAGES_PER_REQUEST,
    TOOLS_SYSTEM_HEADING, TOOLS_SYSTEM_TRAILER,
};
use crate::error::GatewayError;

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CacheControl {
    #[serde(rename = "type", default)]
    pub kind: String,
}

impl CacheControl {
    pub fn is_ephemeral(&self) -> bool {
        self.kind == "ephemeral"
    }
}

/// One typed content block. Non-text blocks are accepted and dropped
/// during translation; only text reaches the provider.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundBlock {
    Text {
        text: String,
        #[serde(default)]
        cache_control: Option<CacheControl>,
    },
    #[serde(other)]
    Other,
}

/// String-or-blocks content, for both `system` and message `content`
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum InboundContent {
    Text(String),
    Blocks(Vec<InboundBlock>),
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct InboundMessage {
    pub role: String,
    pub content: InboundContent,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ToolDeclaration {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: Option<Value>,
}

/// Parsed inbound message envelope
#[derive(Debug, Clone, Deserialize)]
pub struct MessagesRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub system: Option<InboundContent>,
    #[serde(default)]
    pub messages: Vec<InboundMessage>,
    #[serde(default)]
    pub tools: Vec<ToolDeclaration>,
    #[serde(default)]
    pub tool_choice: Option<Value>,
    #[serde(default)]
    pub thinking: Option<Value>,
}

/// Translation output. `tool_config` is constructed for completeness but
/// the send path omits it: the downstream client parses tool calls from
/// assistant text, and transmitting tools twice biases the model.
#[derive(Debug, Clone)]
pub struct TranslatedRequest {
    pub converse: ConverseRequest,
    pub tool_config: Option<ToolConfiguration>,
}

pub fn parse_request(body: &Value) -> Result<MessagesRequest, GatewayError> {
    serde_json::from_value(body.clone())
        .map_err(|e| GatewayError::ParseError(e.to_string()))
}

/// Translate the inbound envelope into a Converse request
pub fn translate(
    request: &MessagesRequest,
    config: &BedrockConfig,
) -> Result<TranslatedRequest, GatewayError> {
    if request.messages.len() > MAX_MESSAGES_PER_REQUEST {
        return Err(GatewayError::ValidationError(format!(
            "too many messages: {} (max: {})",
            request.messages.len(),
            MAX_MESSAGES_PER_REQUEST
        )));
    }

    let tools_text = tools_to_system_text(&request.tools)?;

    let mut system = match &request.system {
        Some(InboundContent::Text(text)) => {
            // Legacy plain-string system prompt; tools are appended inline
            let mut text = text.clone();
            if let Some(tools_text) = &tools_text {
                text.push_str(tools_text);
            }
            vec![SystemBlock::Text(text)]
        }
        Some(InboundContent::Blocks(blocks)) => {
            let mut out = Vec::with_capacity(blocks.len() + 1);
            for block in blocks {
                if let InboundBlock::Text {
                    text,
                    cache_control,
                } = block
                {
                    out.push(SystemBlock::Text(text.clone()));
                    // Cache points always trail the content they checkpoint
                    if cache_control.as_ref().is_some_and(CacheControl::is_ephemeral) {
                        out.push(SystemBlock::CachePoint(CachePointBlock::default()));
                    }
                }
            }
            out
        }
        None => Vec::new(),
    };

    if !matches!(request.system, Some(InboundContent::Text(_)))
        && let Some(tools_text) = tools_text
    {
        system.push(SystemBlock::Text(tools_text));
    }

    let mut messages = Vec::with_capacity(request.messages.len());
    for message in &request.messages {
        let role = if message.role == "user" {
            Role::User
        } else {
            Role::Assistant
        };

        let content = match &message.content {
            InboundContent::Text(text) => vec![ContentBlock::Text(text.clone())],
            InboundContent::Blocks(blocks) => {
                let mut out = Vec::with_capacity(blocks.len());
                for block in blocks {
                    if let InboundBlock::Text {
                        text,
                        cache_control,
                    } = block
                    {
                        out.push(ContentBlock::Text(text.clone()));
                        if cache_control.as_ref().is_some_and(CacheControl::is_ephemeral) {
                            out.push(ContentBlock::CachePoint(CachePointBlock::default()));
                        }
                    }
                }
                out
            }
        };

        if !content.is_empty() {
            messages.push(ConverseMessage { role, content });
        }
    }

    let max_tokens = if config.max_tokens > 0 {
        config.max_tokens
    } else {
        request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)
    };

    let additional_model_request_fields = thinking_fields(request.thinking.as_ref(), config);

    let tool_config = build_tool_config(&request.tools, request.tool_choice.as_ref());

    Ok(TranslatedRequest {
        converse: ConverseRequest {
            system,
            messages,
            inference_config: InferenceConfig {
                max_tokens,
                temperature: DEFAULT_TEMPERATURE,
            },
            additional_model_request_fields,
        },
        tool_config,
    })
}

/// Reasoning directive handling: config wins. Enabled injects a thinking
/// directive (inbound one passes through); disabled strips any inbound one.
fn thinking_fields(inbound: Option<&Value>, config: &BedrockConfig) -> Option<Value> {
    if !config.enable_output_reason {
        return None;
    }
    let thinking = match inbound {
        Some(thinking) => thinking.clone(),
        None => json!({
            "type": "enabled",
            "budget_tokens": config.reason_budget_tokens,
        }),
    };
    Some(json!({ "thinking": thinking }))
}

/// Serialize tool declarations as pretty JSON for the system prompt
fn tools_to_system_text(tools: &[ToolDeclaration]) -> Result<Option<String>, GatewayError> {
    if tools.is_empty() {
        return Ok(None);
    }

    let entries: Vec<Value> = tools
        .iter()
        .filter(|t| !t.name.is_empty())
        .map(|t| {
            json!({
                "name": t.name,
                "description": t.description,
                "inputSchema": t.input_schema.clone().unwrap_or(Value::Null),
            })
        })
        .collect();

    if entries.is_empty() {
        return Ok(None);
    }

    let payload = serde_json::to_string_pretty(&entries)
        .map_err(|e| GatewayError::ValidationError(format!("failed to serialize tools: {e}")))?;

    Ok(Some(format!(
        "{TOOLS_SYSTEM_HEADING}```json\n{payload}\n```\n\n{TOOLS_SYSTEM_TRAILER}"
    )))
}

fn default_input_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

/// Build the native tool configuration. Unsent today, but kept complete so
/// a native-transmission mode needs no translator changes.
fn build_tool_config(
    tools: &[ToolDeclaration],
    tool_choice: Option<&Value>,
) -> Option<ToolConfiguration> {
    let specs: Vec<Tool> = tools
        .iter()
        .filter(|t| !t.name.is_empty())
        .map(|t| {
            let description = if t.description.is_empty() {
                t.name.clone()
            } else {
                t.description.clone()
            };
            let schema = match &t.input_schema {
                Some(schema) if schema.is_object() => schema.clone(),
                _ => default_input_schema(),
            };
            Tool::ToolSpec(ToolSpecification {
                name: t.name.clone(),
                description,
                input_schema: ToolInputSchema { json: schema },
            })
        })
        .collect();

    if specs.is_empty() {
        return None;
    }

    let choice = tool_choice
        .and_then(map_tool_choice)
        .or(Some(ToolChoice::Auto {}));

    Some(ToolConfiguration {
        tools: specs,
        tool_choice: choice,
    })
}

/// Map an inbound tool_choice directive (bare string or typed object)
pub fn map_tool_choice(value: &Value) -> Option<ToolChoice> {
    if let Some(s) = value.as_str() {
        return match s {
            "auto" => Some(ToolChoice::Auto {}),
            "any" => Some(ToolChoice::Any {}),
            _ => None,
        };
    }

    match value.get("type").and_then(|t| t.as_str()) {
        Some("auto") => Some(ToolChoice::Auto {}),
        Some("any") => Some(ToolChoice::Any {}),
        Some("tool") => value
            .get("name")
            .and_then(|n| n.as_str())
            .map(|name| ToolChoice::Tool {
                name: name.to_string(),
            }),
        _ => None,
    }
}

/// Rewrite the raw inbound body for the non-streaming invoke passthrough:
/// drop routing fields, stamp the anthropic version, apply the computer-use
/// and reasoning knobs, and honor the max-tokens override.
pub fn prepare_invoke_body(inbound: &Value, config: &BedrockConfig) -> Value {
    let mut body = inbound.clone();
    let Some(obj) = body.as_object_mut() else {
        return body;
    };

    obj.remove("model");
    obj.remove("stream");
    obj.insert(
        "anthropic_version".to_string(),
        Value::String(config.anthropic_version.clone()),
    );

    if config.enable_computer_use {
        obj.insert(
            "anthropic_beta".to_string(),
            Value::String(COMPUTER_USE_BETA.to_string()),
        );
    }

    if config.enable_output_reason {
        if !obj.contains_key("thinking") {
            obj.insert(
                "thinking".to_string(),
                json!({ "type": "enabled", "budget_tokens": config.reason_budget_tokens }),
            );
        }
    } else {
        obj.remove("thinking");
    }

    if config.max_tokens > 0 {
        obj.insert("max_tokens".to_string(), json!(config.max_tokens));
    }

    body
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BedrockConfig {
        BedrockConfig {
            access_key: "AK".into(),
            secret_key: "SK".into(),
            region: "eu-west-1".into(),
            anthropic_version: "bedrock-2023-05-31".into(),
            enable_computer_use: false,
            enable_output_reason: false,
            reason_budget_tokens: 1024,
            max_tokens: 0,
            debug: false,
        }
    }

    fn parse(body: Value) -> MessagesRequest {
        parse_request(&body).unwrap()
    }

    #[test]
    fn cached_system_block_gets_trailing_cache_point() {
        let request = parse(json!({
            "system": [{"type": "text", "text": "hello", "cache_control": {"type": "ephemeral"}}],
            "messages": [{"role": "user", "content": "hi"}],
        }));
        let translated = translate(&request, &config()).unwrap();
        assert_eq!(
            translated.converse.system,
            vec![
                SystemBlock::Text("hello".into()),
                SystemBlock::CachePoint(CachePointBlock::default()),
            ]
        );
    }

    #[test]
    fn uncached_system_block_has_no_cache_point() {
        let request = parse(json!({
            "system": [{"type": "text", "text": "hello"}],
            "messages": [{"role": "user", "content": "hi"}],
        }));
        let translated = translate(&request, &config()).unwrap();
        assert_eq!(
            translated.converse.system,
            vec![SystemBlock::Text("hello".into())]
        );
    }

    #[test]
    fn string_system_becomes_single_text_block() {
        let request = parse(json!({
            "system": "be brief",
            "messages": [{"role": "user", "content": "hi"}],
        }));
        let translated = translate(&request, &config()).unwrap();
        assert_eq!(
            translated.converse.system,
            vec![SystemBlock::Text("be brief".into())]
        );
    }

    #[test]
    fn message_cache_control_gets_trailing_cache_point() {
        let request = parse(json!({
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "context", "cache_control": {"type": "ephemeral"}},
                    {"type": "text", "text": "question"},
                ],
            }],
        }));
        let translated = translate(&request, &config()).unwrap();
        assert_eq!(
            translated.converse.messages[0].content,
            vec![
                ContentBlock::Text("context".into()),
                ContentBlock::CachePoint(CachePointBlock::default()),
                ContentBlock::Text("question".into()),
            ]
        );
    }

    #[test]
    fn roles_map_and_non_text_blocks_are_dropped() {
        let request = parse(json!({
            "messages": [
                {"role": "user", "content": [
                    {"type": "image", "source": {"type": "base64", "data": "..."}},
                    {"type": "text", "text": "what is this?"},
                ]},
                {"role": "assistant", "content": "a bird"},
                {"role": "user", "content": [{"type": "image", "source": {}}]},
            ],
        }));
        let translated = translate(&request, &config()).unwrap();
        // The image-only message vanishes entirely
        assert_eq!(translated.converse.messages.len(), 2);
        assert_eq!(translated.converse.messages[0].role, Role::User);
        assert_eq!(
            translated.converse.messages[0].content,
            vec![ContentBlock::Text("what is this?".into())]
        );
        assert_eq!(translated.converse.messages[1].role, Role::Assistant);
    }

    #[test]
    fn too_many_messages_rejected() {
        let messages: Vec<Value> = (0..1001)
            .map(|i| json!({"role": "user", "content": format!("m{i}")}))
            .collect();
        let request = parse(json!({ "messages": messages }));
        let err = translate(&request, &config()).unwrap_err();
        assert!(err.to_string().contains("too many messages: 1001"));
    }

    #[test]
    fn exactly_max_messages_allowed() {
        let messages: Vec<Value> = (0..1000)
            .map(|i| json!({"role": "user", "content": format!("m{i}")}))
            .collect();
        let request = parse(json!({ "messages": messages }));
        assert!(translate(&request, &config()).is_ok());
    }

    #[test]
    fn max_tokens_priority_config_then_request_then_default() {
        let mut cfg = config();
        let request = parse(json!({
            "max_tokens": 2048,
            "messages": [{"role": "user", "content": "hi"}],
        }));

        let translated = translate(&request, &cfg).unwrap();
        assert_eq!(translated.converse.inference_config.max_tokens, 2048);

        cfg.max_tokens = 4096;
        let translated = translate(&request, &cfg).unwrap();
        assert_eq!(translated.converse.inference_config.max_tokens, 4096);

        let request = parse(json!({"messages": [{"role": "user", "content": "hi"}]}));
        let translated = translate(&request, &config()).unwrap();
        assert_eq!(
            translated.converse.inference_config.max_tokens,
            DEFAULT_MAX_TOKENS
        );
    }

    #[test]
    fn tools_fold_into_system_text_not_tool_config_channel() {
        let request = parse(json!({
            "system": [{"type": "text", "text": "base"}],
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{
                "name": "write_file",
                "description": "Write a file",
                "input_schema": {"type": "object", "properties": {"path": {"type": "string"}}},
            }],
        }));
        let translated = translate(&request, &config()).unwrap();

        assert_eq!(translated.converse.system.len(), 2);
        let SystemBlock::Text(tools_text) = &translated.converse.system[1] else {
            panic!("expected trailing tools text block");
        };
        assert!(tools_text.contains("# Available MCP Tools"));
        assert!(tools_text.contains("\"write_file\""));
        assert!(tools_text.contains("```json"));

        // The native config exists but never reaches the wire
        let tool_config = translated.tool_config.unwrap();
        assert_eq!(tool_config.tools.len(), 1);
        let wire = serde_json::to_value(&translated.converse).unwrap();
        assert!(wire.get("toolConfig").is_none());
    }

    #[test]
    fn tools_append_to_string_system() {
        let request = parse(json!({
            "system": "base",
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{"name": "read_file"}],
        }));
        let translated = translate(&request, &config()).unwrap();
        assert_eq!(translated.converse.system.len(), 1);
        let SystemBlock::Text(text) = &translated.converse.system[0] else {
            panic!("expected text block");
        };
        assert!(text.starts_with("base"));
        assert!(text.contains("read_file"));
    }

    #[test]
    fn tool_defaults_for_description_and_schema() {
        let request = parse(json!({
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [
                {"name": "bare_tool"},
                {"name": "", "description": "nameless is skipped"},
            ],
        }));
        let translated = translate(&request, &config()).unwrap();
        let tool_config = translated.tool_config.unwrap();
        assert_eq!(tool_config.tools.len(), 1);
        let Tool::ToolSpec(spec) = &tool_config.tools[0];
        assert_eq!(spec.description, "bare_tool");
        assert_eq!(spec.input_schema.json, default_input_schema());
    }

    #[test]
    fn tool_choice_mapping() {
        assert_eq!(map_tool_choice(&json!("auto")), Some(ToolChoice::Auto {}));
        assert_eq!(map_tool_choice(&json!("any")), Some(ToolChoice::Any {}));
        assert_eq!(
            map_tool_choice(&json!({"type": "tool", "name": "grep"})),
            Some(ToolChoice::Tool { name: "grep".into() })
        );
        assert_eq!(map_tool_choice(&json!({"type": "tool"})), None);
        assert_eq!(map_tool_choice(&json!("none")), None);
    }

    #[test]
    fn client_tool_choice_is_honored_else_auto() {
        let request = parse(json!({
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{"name": "grep"}],
            "tool_choice": {"type": "tool", "name": "grep"},
        }));
        let translated = translate(&request, &config()).unwrap();
        assert_eq!(
            translated.tool_config.unwrap().tool_choice,
            Some(ToolChoice::Tool { name: "grep".into() })
        );

        let request = parse(json!({
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{"name": "grep"}],
        }));
        let translated = translate(&request, &config()).unwrap();
        assert_eq!(
            translated.tool_config.unwrap().tool_choice,
            Some(ToolChoice::Auto {})
        );
    }

    #[test]
    fn thinking_injected_when_reasoning_enabled() {
        let mut cfg = config();
        cfg.enable_output_reason = true;
        cfg.reason_budget_tokens = 2000;
        let request = parse(json!({"messages": [{"role": "user", "content": "hi"}]}));
        let translated = translate(&request, &cfg).unwrap();
        let fields = translated.converse.additional_model_request_fields.unwrap();
        assert_eq!(fields["thinking"]["type"], "enabled");
        assert_eq!(fields["thinking"]["budget_tokens"], 2000);
    }

    #[test]
    fn inbound_thinking_stripped_when_reasoning_disabled() {
        let request = parse(json!({
            "messages": [{"role": "user", "content": "hi"}],
            "thinking": {"type": "enabled", "budget_tokens": 9000},
        }));
        let translated = translate(&request, &config()).unwrap();
        assert!(translated.converse.additional_model_request_fields.is_none());
    }

    #[test]
    fn inbound_thinking_passes_through_when_enabled() {
        let mut cfg = config();
        cfg.enable_output_reason = true;
        let request = parse(json!({
            "messages": [{"role": "user", "content": "hi"}],
            "thinking": {"type": "enabled", "budget_tokens": 9000},
        }));
        let translated = translate(&request, &cfg).unwrap();
        let fields = translated.converse.additional_model_request_fields.unwrap();
        assert_eq!(fields["thinking"]["budget_tokens"], 9000);
    }

    #[test]
    fn malformed_body_is_a_parse_error() {
        let err = parse_request(&json!({"messages": "not-a-list"})).unwrap_err();
        assert!(matches!(err, GatewayError::ParseError(_)));
    }

    #[test]
    fn invoke_body_rewrite() {
        let mut cfg = config();
        cfg.enable_computer_use = true;
        cfg.max_tokens = 4096;
        let inbound = json!({
            "model": "claude-sonnet",
            "stream": false,
            "max_tokens": 100,
            "messages": [{"role": "user", "content": "hi"}],
            "thinking": {"type": "enabled", "budget_tokens": 5},
        });

        let body = prepare_invoke_body(&inbound, &cfg);
        assert!(body.get("model").is_none());
        assert!(body.get("stream").is_none());
        assert_eq!(body["anthropic_version"], "bedrock-2023-05-31");
        assert_eq!(body["anthropic_beta"], COMPUTER_USE_BETA);
        assert_eq!(body["max_tokens"], 4096);
        // Reasoning disabled: inbound thinking is stripped
        assert!(body.get("thinking").is_none());
    }

    #[test]
    fn invoke_body_injects_thinking_when_enabled() {
        let mut cfg = config();
        cfg.enable_output_reason = true;
        let body = prepare_invoke_body(&json!({"messages": []}), &cfg);
        assert_eq!(body["thinking"]["type"], "enabled");
        assert_eq!(body["thinking"]["budget_tokens"], 1024);
    }
}
