//! Belt-and-braces usage capture: re-parses the outbound SSE text to
//! extract token counters, independent of the adapter's own bookkeeping.
//! Whatever the client saw is what gets billed.

use serde_json::Value;

/// Incremental SSE parser fed with every outbound chunk
#[derive(Debug, Default)]
pub struct UsageCapture {
    line_buffer: String,
    current_event: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    pub has_error: bool,
    pub error_message: String,
}

impl UsageCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one outbound chunk; complete lines are parsed immediately,
    /// partial lines wait for the next chunk.
    pub fn observe(&mut self, chunk: &str) {
        self.line_buffer.push_str(chunk);
        while let Some(pos) = self.line_buffer.find('\n') {
            let line: String = self.line_buffer.drain(..=pos).collect();
            self.process_line(line.trim_end());
        }
    }

    fn process_line(&mut self, line: &str) {
        if let Some(name) = line.strip_prefix("event: ") {
            self.current_event = Some(name.to_string());
        } else if let Some(data) = line.strip_prefix("data: ") {
            if let Some(event) = self.current_event.take() {
                self.extract(&event, data);
            }
        }
    }

    fn extract(&mut self, event: &str, data: &str) {
        let Ok(value) = serde_json::from_str::<Value>(data) else {
            return;
        };

        match event {
            "message_start" => {
                if let Some(usage) = value.get("message").and_then(|m| m.get("usage")) {
                    self.apply_usage(usage);
                }
            }
            // ping carries the complete counter set as a backup channel
            "ping" => {
                if let Some(usage) = value.get("usage") {
                    self.apply_usage(usage);
                }
            }
            "message_delta" => {
                if let Some(output) = value
                    .get("usage")
                    .and_then(|u| u.get("output_tokens"))
                    .and_then(|v| v.as_u64())
                {
                    self.output_tokens = output;
                }
            }
            "error" => {
                self.has_error = true;
                if let Some(error) = value.get("error") {
                    let kind = error.get("type").and_then(|t| t.as_str()).unwrap_or("error");
                    let message = error
                        .get("message")
                        .and_then(|m| m.as_str())
                        .unwrap_or_default();
                    self.error_message = format!("{kind}: {message}");
                }
            }
            _ => {}
        }
    }

    fn apply_usage(&mut self, usage: &Value) {
        let field = |name: &str| usage.get(name).and_then(|v| v.as_u64());
        if let Some(v) = field("input_tokens") {
            self.input_tokens = v;
        }
        if let Some(v) = field("output_tokens") {
            self.output_tokens = v;
        }
        if let Some(v) = field("cache_read_input_tokens") {
            self.cache_read_tokens = v;
        }
        if let Some(v) = field("cache_creation_input_tokens") {
            self.cache_write_tokens = v;
        }
    }

    pub fn outcome(&self) -> &'static str {
        if self.has_error { "error" } else { "success" }
    }
}
