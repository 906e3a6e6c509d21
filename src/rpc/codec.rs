//! Content-Length framing for JSON-RPC messages

use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::rpc::message::Message;

/// Header that carries the body length
const CONTENT_LENGTH: &str = "content-length";

/// Separator between the header block and the body
const HEADER_END: &[u8] = b"\r\n\r\n";

/// Largest body accepted from a peer
pub const MAX_CONTENT_LENGTH: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Missing Content-Length header")]
    MissingContentLength,

    #[error("Invalid Content-Length header: {0}")]
    InvalidContentLength(String),

    #[error("Malformed message body: {0}")]
    Json(#[from] serde_json::Error),
}

/// Codec for `Content-Length: <n>\r\n\r\n<body>` frames.
///
/// A frame that cannot be decoded is consumed before the error is returned,
/// so the next call resumes at the following frame.
#[derive(Debug, Default)]
pub struct LspCodec {
    /// Body length of a frame whose header was already consumed
    pending_body: Option<usize>,
}

impl LspCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for LspCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        let length = match self.pending_body {
            Some(length) => length,
            None => {
                let Some(end) = find_header_end(src) else {
                    return Ok(None);
                };
                let header = src.split_to(end + HEADER_END.len());
                let length = parse_content_length(&header[..end])?;
                if length > MAX_CONTENT_LENGTH {
                    return Err(CodecError::InvalidContentLength(format!(
                        "{} exceeds the {} byte limit",
                        length, MAX_CONTENT_LENGTH
                    )));
                }
                self.pending_body = Some(length);
                length
            }
        };

        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        self.pending_body = None;
        let body = src.split_to(length);
        let value: serde_json::Value = serde_json::from_slice(&body)?;
        Ok(Some(Message::from_value(value)?))
    }
}

impl Encoder<&Message> for LspCodec {
    type Error = CodecError;

    fn encode(&mut self, item: &Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        let body = serde_json::to_vec(&item.to_value()?)?;
        let header = format!("Content-Length: {}\r\n\r\n", body.len());

        dst.reserve(header.len() + body.len());
        dst.put_slice(header.as_bytes());
        dst.put_slice(&body);
        Ok(())
    }
}

impl Encoder<Message> for LspCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        <Self as Encoder<&Message>>::encode(self, &item, dst)
    }
}

/// Encodes a single message into a standalone frame.
pub fn encode_frame(message: &Message) -> Result<BytesMut, CodecError> {
    let mut buf = BytesMut::new();
    <LspCodec as Encoder<&Message>>::encode(&mut LspCodec::new(), message, &mut buf)?;
    Ok(buf)
}

fn find_header_end(src: &[u8]) -> Option<usize> {
    src.windows(HEADER_END.len())
        .position(|window| window == HEADER_END)
}

/// Reads the body length from a header block.
///
/// Anything ahead of the `Content-Length` name is skipped: servers that log
/// to stdout, or the leftover body of a frame that was rejected.
fn parse_content_length(header: &[u8]) -> Result<usize, CodecError> {
    let header = String::from_utf8_lossy(header);

    for line in header.lines() {
        let Some(start) = line.to_ascii_lowercase().find(CONTENT_LENGTH) else {
            continue;
        };
        let Some((_, value)) = line[start..].split_once(':') else {
            continue;
        };
        let value = value.trim();
        return value
            .parse::<usize>()
            .map_err(|_| CodecError::InvalidContentLength(value.to_string()));
    }

    Err(CodecError::MissingContentLength)
}
