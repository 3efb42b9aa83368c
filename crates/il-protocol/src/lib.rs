// il-protocol: Agent messaging protocol types and serialization.
//
// All wire messages share one canonical JSON shape: a `header` with routing
// and priority fields, a `payload` with the command and its data tree, and
// an optional detached `signature`.  MessagePack mirrors the JSON shape with
// binary scalar types; the compact pipe format is for human tooling only.

pub mod codec;
pub mod message;
pub mod validate;

pub use codec::{WireFormat, decode, encode, encode_json, validate_message};
pub use message::{
    BROADCAST, Message, MessageDraft, MessageHeader, MessagePayload, MessageType, Priority,
    Protocol, now_ts,
};

use thiserror::Error;

/// Frozen error codes carried in ERROR responses (`payload.data.error_code`).
pub mod error_codes {
    pub const AUTH_FAILED: &str = "AUTH_FAILED";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const VALIDATION_FAILED: &str = "VALIDATION_FAILED";
    pub const DECODE_FAILED: &str = "DECODE_FAILED";
    pub const QUEUE_OVERFLOW: &str = "QUEUE_OVERFLOW";
    pub const UNKNOWN_SESSION: &str = "UNKNOWN_SESSION";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

/// Errors from encoding, decoding, or validating messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("unsupported protocol version: {0}")]
    VersionMismatch(String),
    #[error("message exceeds maximum size ({size} > {max} bytes)")]
    TooLarge { size: usize, max: usize },
    #[error("missing {0}")]
    MissingField(&'static str),
    #[error("command too long ({0} chars, max {max})", max = validate::MAX_COMMAND_LEN)]
    CommandTooLong(usize),
    #[error("payload nesting exceeds depth limit of {}", validate::MAX_PAYLOAD_DEPTH)]
    PayloadTooDeep,
}
