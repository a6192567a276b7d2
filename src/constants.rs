/// Default max_tokens when neither config nor the request supplies one
pub const DEFAULT_MAX_TOKENS: u32 = 8192;

/// Temperature sent to the Converse API (the gateway does not expose it)
pub const DEFAULT_TEMPERATURE: f32 = 0.0;

/// Hard cap on messages per request
pub const MAX_MESSAGES_PER_REQUEST: usize = 1000;

/// Default reasoning budget when extended output reasoning is enabled
pub const DEFAULT_REASON_BUDGET_TOKENS: u32 = 1024;

/// anthropic_version value stamped onto the non-streaming passthrough body
pub const DEFAULT_ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";

/// Beta marker added when computer use is enabled
pub const COMPUTER_USE_BETA: &str = "computer-use-2024-10-22";

/// Heading under which tool declarations are folded into the system prompt.
/// The downstream client parses tool invocations out of assistant text, so
/// tools travel as prompt text instead of the native toolConfig channel.
pub const TOOLS_SYSTEM_HEADING: &str = "\n\n# Available MCP Tools\n\n\
The following tools are available as MCP (Model Context Protocol) tools. \
Each tool has a name, description, and input schema that defines its parameters.\n\n";

/// Trailer appended after the tools JSON block in the system prompt
pub const TOOLS_SYSTEM_TRAILER: &str =
    "To use a tool, reference it by name and provide parameters according to its input schema.\n";

/// Default cap for the markup-safe delta buffer (overridable via env)
pub const DEFAULT_TAG_BUFFER_SIZE: usize = 3;
