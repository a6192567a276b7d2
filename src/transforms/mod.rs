pub mod request;
pub mod streaming;
pub mod tag_buffer;

pub use request::{MessagesRequest, TranslatedRequest, parse_request, prepare_invoke_body, translate};
pub use streaming::{SseEvent, StreamAdapter, converse_sse_stream, error_event};
pub use tag_buffer::MarkupTagBuffer;
