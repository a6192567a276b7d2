use bytes::Bytes;

use crate::error::GatewayError;

/// One decoded event-stream message
#[derive(Debug)]
pub struct Frame {
    pub headers: Vec<(String, HeaderValue)>,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
#[allow(dead_code)]
pub enum HeaderValue {
    Bool(bool),
    Byte(i8),
    Short(i16),
    Integer(i32),
    Long(i64),
    ByteArray(Vec<u8>),
    String(String),
    Timestamp(i64),
    Uuid([u8; 16]),
}

impl Frame {
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.iter().find_map(|(n, v)| {
            if n == name
                && let HeaderValue::String(s) = v
            {
                Some(s.as_str())
            } else {
                None
            }
        })
    }

    pub fn event_type(&self) -> Option<&str> {
        self.header_str(":event-type")
    }

    pub fn message_type(&self) -> Option<&str> {
        self.header_str(":message-type")
    }

    pub fn exception_type(&self) -> Option<&str> {
        self.header_str(":exception-type")
    }
}

/// Incremental decoder for the binary `application/vnd.amazon.eventstream`
/// framing: 12-byte prelude (big-endian total length, headers length,
/// prelude CRC), headers, payload, 4-byte message CRC. CRCs are not
/// verified; TLS already covers integrity.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Pop the next complete frame, or None when more bytes are needed
    pub fn next_frame(&mut self) -> Result<Option<Frame>, GatewayError> {
        if self.buffer.len() < 16 {
            return Ok(None);
        }

        let total_length =
            u32::from_be_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]])
                as usize;
        let headers_length =
            u32::from_be_bytes([self.buffer[4], self.buffer[5], self.buffer[6], self.buffer[7]])
                as usize;

        if total_length < 16 || headers_length > total_length - 16 {
            return Err(GatewayError::UpstreamStreamError(
                "invalid event stream prelude".into(),
            ));
        }
        if self.buffer.len() < total_length {
            return Ok(None);
        }

        let message: Vec<u8> = self.buffer.drain(..total_length).collect();
        let headers = parse_headers(&message[12..12 + headers_length])?;
        let payload_end = total_length - 4;
        let payload = Bytes::copy_from_slice(&message[12 + headers_length..payload_end]);

        Ok(Some(Frame { headers, payload }))
    }
}

fn parse_headers(mut data: &[u8]) -> Result<Vec<(String, HeaderValue)>, GatewayError> {
    let mut headers = Vec::new();

    while !data.is_empty() {
        let name_len = data[0] as usize;
        data = &data[1..];
        let name = take(&mut data, name_len)?;
        let name = String::from_utf8_lossy(name).to_string();

        let value_type = *first(&data)?;
        data = &data[1..];

        let value = match value_type {
            0 => HeaderValue::Bool(true),
            1 => HeaderValue::Bool(false),
            2 => HeaderValue::Byte(take(&mut data, 1)?[0] as i8),
            3 => {
                let b = take(&mut data, 2)?;
                HeaderValue::Short(i16::from_be_bytes([b[0], b[1]]))
            }
            4 => {
                let b = take(&mut data, 4)?;
                HeaderValue::Integer(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            }
            5 => {
                let b = take(&mut data, 8)?;
                HeaderValue::Long(i64::from_be_bytes(b.try_into().unwrap_or_default()))
            }
            6 => {
                let len = be_u16(&mut data)? as usize;
                HeaderValue::ByteArray(take(&mut data, len)?.to_vec())
            }
            7 => {
                let len = be_u16(&mut data)? as usize;
                let raw = take(&mut data, len)?;
                HeaderValue::String(String::from_utf8_lossy(raw).to_string())
            }
            8 => {
                let b = take(&mut data, 8)?;
                HeaderValue::Timestamp(i64::from_be_bytes(b.try_into().unwrap_or_default()))
            }
            9 => {
                let b = take(&mut data, 16)?;
                HeaderValue::Uuid(b.try_into().unwrap_or_default())
            }
            other => {
                return Err(GatewayError::UpstreamStreamError(format!(
                    "unknown event stream header type {other}"
                )));
            }
        };

        headers.push((name, value));
    }

    Ok(headers)
}

fn first<'a>(data: &'a [u8]) -> Result<&'a u8, GatewayError> {
    data.first()
        .ok_or_else(|| GatewayError::UpstreamStreamError("truncated event stream headers".into()))
}

fn take<'a>(data: &mut &'a [u8], n: usize) -> Result<&'a [u8], GatewayError> {
    if data.len() < n {
        return Err(GatewayError::UpstreamStreamError(
            "truncated event stream headers".into(),
        ));
    }
    let (head, rest) = data.split_at(n);
    *data = rest;
    Ok(head)
}

fn be_u16(data: &mut &[u8]) -> Result<u16, GatewayError> {
    let b = take(data, 2)?;
    Ok(u16::from_be_bytes([b[0], b[1]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a frame with string headers and the given payload. CRC fields
    /// are zeroed; the decoder does not check them.
    fn build_frame(headers: &[(&str, &str)], payload: &[u8]) -> Vec<u8> {
        let mut header_bytes = Vec::new();
        for (name, value) in headers {
            header_bytes.push(name.len() as u8);
            header_bytes.extend_from_slice(name.as_bytes());
            header_bytes.push(7u8);
            header_bytes.extend_from_slice(&(value.len() as u16).to_be_bytes());
            header_bytes.extend_from_slice(value.as_bytes());
        }

        let total = 12 + header_bytes.len() + payload.len() + 4;
        let mut frame = Vec::with_capacity(total);
        frame.extend_from_slice(&(total as u32).to_be_bytes());
        frame.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
        frame.extend_from_slice(&0u32.to_be_bytes());
        frame.extend_from_slice(&header_bytes);
        frame.extend_from_slice(payload);
        frame.extend_from_slice(&0u32.to_be_bytes());
        frame
    }

    #[test]
    fn decodes_a_single_frame() {
        let raw = build_frame(
            &[(":event-type", "contentBlockDelta"), (":message-type", "event")],
            br#"{"contentBlockIndex":0,"delta":{"text":"hi"}}"#,
        );

        let mut decoder = FrameDecoder::new();
        decoder.feed(&raw);
        let frame = decoder.next_frame().unwrap().unwrap();

        assert_eq!(frame.event_type(), Some("contentBlockDelta"));
        assert_eq!(frame.message_type(), Some("event"));
        assert_eq!(
            frame.payload.as_ref(),
            br#"{"contentBlockIndex":0,"delta":{"text":"hi"}}"#
        );
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn handles_frames_split_across_feeds() {
        let raw = build_frame(&[(":event-type", "messageStop")], b"{}");
        let (a, b) = raw.split_at(7);

        let mut decoder = FrameDecoder::new();
        decoder.feed(a);
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.feed(b);
        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(frame.event_type(), Some("messageStop"));
    }

    #[test]
    fn drains_multiple_frames_from_one_feed() {
        let mut raw = build_frame(&[(":event-type", "messageStart")], b"{\"role\":\"assistant\"}");
        raw.extend(build_frame(&[(":event-type", "contentBlockStart")], b"{}"));

        let mut decoder = FrameDecoder::new();
        decoder.feed(&raw);
        assert_eq!(
            decoder.next_frame().unwrap().unwrap().event_type(),
            Some("messageStart")
        );
        assert_eq!(
            decoder.next_frame().unwrap().unwrap().event_type(),
            Some("contentBlockStart")
        );
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn exception_frames_expose_their_type() {
        let raw = build_frame(
            &[
                (":message-type", "exception"),
                (":exception-type", "throttlingException"),
            ],
            br#"{"message":"Too many requests"}"#,
        );
        let mut decoder = FrameDecoder::new();
        decoder.feed(&raw);
        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(frame.message_type(), Some("exception"));
        assert_eq!(frame.exception_type(), Some("throttlingException"));
    }

    #[test]
    fn invalid_prelude_is_an_error() {
        let mut decoder = FrameDecoder::new();
        // headers length exceeds total length
        let mut raw = Vec::new();
        raw.extend_from_slice(&20u32.to_be_bytes());
        raw.extend_from_slice(&100u32.to_be_bytes());
        raw.extend_from_slice(&[0u8; 12]);
        decoder.feed(&raw);
        assert!(decoder.next_frame().is_err());
    }
}
