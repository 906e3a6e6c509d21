//! Wire layer
//! - message.rs: JSON-RPC request/response/notification envelopes
//! - codec.rs: Content-Length framing (tokio-util codec)

pub mod codec;
pub mod message;

pub use codec::{CodecError, LspCodec, encode_frame};
pub use message::{Message, Notification, Request, RequestId, Response, ResponseError};
