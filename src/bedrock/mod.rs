pub mod client;
pub mod eventstream;
pub mod sigv4;
pub mod types;

pub use client::BedrockClient;
pub use eventstream::{Frame, FrameDecoder};
pub use types::{ConverseRequest, ConverseStreamEvent, StreamUsage};
