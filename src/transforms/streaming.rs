//! Converse stream -> client SSE adaptation.
//!
//! The adapter is an explicit state machine with a pure `drive` function so
//! the event translation is unit-testable away from any transport. The
//! async wrapper decodes event-stream frames off the HTTP body, drives the
//! adapter, and yields encoded SSE bytes.

use async_stream::stream;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::{Value, json};
use tracing::warn;

use crate::bedrock::eventstream::FrameDecoder;
use crate::bedrock::types::{ConverseStreamEvent, StreamUsage};
use crate::error::GatewayError;
use crate::transforms::tag_buffer::MarkupTagBuffer;

/// One outbound server-sent event
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub name: &'static str,
    pub data: Value,
}

impl SseEvent {
    pub fn new(name: &'static str, data: Value) -> Self {
        Self { name, data }
    }

    pub fn encode(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.name, self.data)
    }
}

/// Mid-stream error record; status can no longer change once bytes are out
pub fn error_event(message: &str) -> SseEvent {
    SseEvent::new(
        "error",
        json!({
            "type": "error",
            "error": { "type": "api_error", "message": message },
        }),
    )
}

/// Streaming state machine. `message_start` is deferred until the provider
/// metadata supplies real token counts: clients key per-turn accounting off
/// the first event's usage, and placeholder zeros would break it.
#[derive(Debug)]
pub struct StreamAdapter {
    model_id: String,
    buffer: MarkupTagBuffer,
    start_received: bool,
    start_emitted: bool,
    usage: StreamUsage,
}

impl StreamAdapter {
    pub fn new(model_id: String, buffer_max_size: usize) -> Self {
        Self {
            model_id,
            buffer: MarkupTagBuffer::new(buffer_max_size),
            start_received: false,
            start_emitted: false,
            usage: StreamUsage::default(),
        }
    }

    /// Usage counters captured so far (complete after the metadata event)
    pub fn usage(&self) -> StreamUsage {
        self.usage
    }

    /// Translate one provider event into zero or more outbound events
    pub fn drive(&mut self, event: ConverseStreamEvent) -> Vec<SseEvent> {
        match event {
            ConverseStreamEvent::MessageStart(_) => {
                self.start_received = true;
                Vec::new()
            }

            ConverseStreamEvent::ContentBlockStart(_) => {
                vec![SseEvent::new(
                    "content_block_start",
                    json!({
                        "type": "content_block_start",
                        "index": 0,
                        "content_block": { "type": "text", "text": "" },
                    }),
                )]
            }

            ConverseStreamEvent::ContentBlockDelta(delta_event) => {
                let Some(text) = delta_event.delta.and_then(|d| d.text) else {
                    return Vec::new();
                };
                let emitted = self.buffer.process_chunk(&text);
                if emitted.is_empty() {
                    return Vec::new();
                }
                vec![text_delta_event(&emitted)]
            }

            ConverseStreamEvent::ContentBlockStop(_) => {
                let mut events = Vec::with_capacity(2);
                if self.buffer.has_buffered() {
                    let remaining = self.buffer.flush();
                    events.push(text_delta_event(&remaining));
                }
                events.push(SseEvent::new(
                    "content_block_stop",
                    json!({ "type": "content_block_stop", "index": 0 }),
                ));
                events
            }

            ConverseStreamEvent::Metadata(metadata) => {
                let Some(usage) = metadata.usage else {
                    return Vec::new();
                };
                self.usage = usage;

                let mut events = Vec::with_capacity(2);
                if self.start_received && !self.start_emitted {
                    events.push(SseEvent::new(
                        "message_start",
                        json!({
                            "type": "message_start",
                            "message": {
                                "id": "",
                                "type": "message",
                                "role": "assistant",
                                "content": [],
                                "model": self.model_id,
                                "stop_reason": null,
                                "stop_sequence": null,
                                "usage": self.usage_json(),
                            },
                        }),
                    ));
                    self.start_emitted = true;
                }

                // Redundant usage backup so metric capture survives clients
                // that swallow message_start
                events.push(SseEvent::new(
                    "ping",
                    json!({ "type": "ping", "usage": self.usage_json() }),
                ));
                events
            }

            ConverseStreamEvent::MessageStop(stop) => {
                let stop_reason = stop
                    .stop_reason
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| "end_turn".to_string());
                vec![
                    SseEvent::new(
                        "message_delta",
                        json!({
                            "type": "message_delta",
                            "delta": { "stop_reason": stop_reason, "stop_sequence": null },
                            "usage": { "output_tokens": self.usage.output_tokens },
                        }),
                    ),
                    SseEvent::new("message_stop", json!({ "type": "message_stop" })),
                ]
            }
        }
    }

    fn usage_json(&self) -> Value {
        json!({
            "input_tokens": self.usage.input_tokens,
            "output_tokens": self.usage.output_tokens,
            "cache_creation_input_tokens": self.usage.cache_write_input_tokens.unwrap_or(0),
            "cache_read_input_tokens": self.usage.cache_read_input_tokens.unwrap_or(0),
        })
    }
}

fn text_delta_event(text: &str) -> SseEvent {
    SseEvent::new(
        "content_block_delta",
        json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": { "type": "text_delta", "text": text },
        }),
    )
}

/// Adapt a converse-stream HTTP response into client SSE bytes. Every
/// outbound chunk also passes through `observe` so the orchestrator's
/// usage capture sees exactly what the client sees. Dropping the returned
/// stream cancels the upstream call.
pub fn converse_sse_stream(
    response: reqwest::Response,
    mut adapter: StreamAdapter,
    mut observe: impl FnMut(&str) + Send + 'static,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send {
    stream! {
        let mut decoder = FrameDecoder::new();
        let mut body = std::pin::pin!(response.bytes_stream());

        'outer: while let Some(chunk_result) = body.next().await {
            let chunk = match chunk_result {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "upstream stream read failed");
                    let event = error_event(&format!("stream error: {e}"));
                    let text = event.encode();
                    observe(&text);
                    yield Ok(Bytes::from(text));
                    break;
                }
            };

            decoder.feed(&chunk);
            loop {
                let frame = match decoder.next_frame() {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "event stream decode failed");
                        let event = error_event(&e.to_string());
                        let text = event.encode();
                        observe(&text);
                        yield Ok(Bytes::from(text));
                        break 'outer;
                    }
                };

                let event = match ConverseStreamEvent::from_frame(&frame) {
                    Ok(Some(event)) => event,
                    Ok(None) => continue,
                    Err(GatewayError::UpstreamStreamError(message)) => {
                        warn!(error = %message, "upstream exception frame");
                        let event = error_event(&message);
                        let text = event.encode();
                        observe(&text);
                        yield Ok(Bytes::from(text));
                        break 'outer;
                    }
                    Err(e) => {
                        let event = error_event(&e.to_string());
                        let text = event.encode();
                        observe(&text);
                        yield Ok(Bytes::from(text));
                        break 'outer;
                    }
                };

                for sse in adapter.drive(event) {
                    let text = sse.encode();
                    observe(&text);
                    yield Ok(Bytes::from(text));
                }
            }
        }
    }
}
