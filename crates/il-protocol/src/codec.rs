//! Wire encodings and protocol validation.
//!
//! Canonical JSON is serde_json's compact form (UTF-8, `,`/`:` separators,
//! no whitespace).  MessagePack carries the identical field layout with
//! binary scalar types.  The compact pipe format
//! (`TYPE|SENDER|RECIPIENT|COMMAND|DATA_JSON`) exists for human tooling and
//! is lossy: header identity fields are synthesized on parse.

use std::hash::{Hash, Hasher};

use crate::message::{
    Message, MessageHeader, MessagePayload, MessageType, Priority, Protocol,
};
use crate::validate::{MAX_COMMAND_LEN, MAX_PAYLOAD_DEPTH, payload_within_depth};
use crate::ProtocolError;

/// Supported wire encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// Canonical compact JSON.  This is the only format used on the wire.
    Json,
    /// MessagePack mirror of the JSON shape.
    MessagePack,
    /// `TYPE|SENDER|RECIPIENT|COMMAND|DATA_JSON`, tooling only.
    Compact,
}

/// Encode a message in the given format.
pub fn encode(message: &Message, format: WireFormat) -> Result<Vec<u8>, ProtocolError> {
    match format {
        WireFormat::Json => encode_json(message).map(String::into_bytes),
        WireFormat::MessagePack => {
            rmp_serde::to_vec_named(message).map_err(|e| ProtocolError::Encode(e.to_string()))
        }
        WireFormat::Compact => encode_compact(message).map(String::into_bytes),
    }
}

/// Decode bytes in the given format back into a message.
pub fn decode(bytes: &[u8], format: WireFormat) -> Result<Message, ProtocolError> {
    match format {
        WireFormat::Json => {
            let text =
                std::str::from_utf8(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))?;
            serde_json::from_str(text).map_err(|e| ProtocolError::Decode(e.to_string()))
        }
        WireFormat::MessagePack => {
            rmp_serde::from_slice(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
        }
        WireFormat::Compact => {
            let text =
                std::str::from_utf8(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))?;
            decode_compact(text)
        }
    }
}

/// Canonical JSON encoding as a string (the transport payload type).
pub fn encode_json(message: &Message) -> Result<String, ProtocolError> {
    serde_json::to_string(message).map_err(|e| ProtocolError::Encode(e.to_string()))
}

/// Enforce protocol invariants on a message.
///
/// Checks, in order: protocol version, required identity fields, command
/// length, payload nesting depth, and the 1 MiB cap on the JSON encoding.
pub fn validate_message(message: &Message) -> Result<(), ProtocolError> {
    if message.header.protocol_version != Protocol::VERSION {
        return Err(ProtocolError::VersionMismatch(
            message.header.protocol_version.clone(),
        ));
    }
    if message.header.message_id.is_empty() {
        return Err(ProtocolError::MissingField("message_id"));
    }
    if message.header.sender_id.is_empty() {
        return Err(ProtocolError::MissingField("sender_id"));
    }
    if message.header.recipient_id.is_empty() {
        return Err(ProtocolError::MissingField("recipient_id"));
    }
    if message.payload.command.is_empty() {
        return Err(ProtocolError::MissingField("command"));
    }
    if message.payload.command.chars().count() > MAX_COMMAND_LEN {
        return Err(ProtocolError::CommandTooLong(
            message.payload.command.chars().count(),
        ));
    }
    if !payload_within_depth(&message.payload.data, MAX_PAYLOAD_DEPTH) {
        return Err(ProtocolError::PayloadTooDeep);
    }
    let size = encode_json(message)?.len();
    if size > Protocol::MAX_MESSAGE_SIZE {
        return Err(ProtocolError::TooLarge {
            size,
            max: Protocol::MAX_MESSAGE_SIZE,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Compact pipe format
// ---------------------------------------------------------------------------

fn type_tag(message_type: MessageType) -> &'static str {
    match message_type {
        MessageType::Request => "request",
        MessageType::Response => "response",
        MessageType::Notification => "notification",
        MessageType::Error => "error",
        MessageType::Heartbeat => "heartbeat",
        MessageType::Handshake => "handshake",
    }
}

fn encode_compact(message: &Message) -> Result<String, ProtocolError> {
    let data_json = serde_json::to_string(&message.payload.data)
        .map_err(|e| ProtocolError::Encode(e.to_string()))?;
    Ok(format!(
        "{}|{}|{}|{}|{}",
        type_tag(message.header.message_type),
        message.header.sender_id,
        message.header.recipient_id,
        message.payload.command,
        data_json
    ))
}

fn decode_compact(text: &str) -> Result<Message, ProtocolError> {
    let parts: Vec<&str> = text.splitn(5, '|').collect();
    let [tag, sender, recipient, command, data_json] = parts[..] else {
        return Err(ProtocolError::Decode(format!(
            "compact form needs 5 pipe-separated fields, got {}",
            parts.len()
        )));
    };
    let message_type: MessageType = serde_json::from_value(serde_json::Value::String(
        tag.to_ascii_lowercase(),
    ))
    .map_err(|_| ProtocolError::Decode(format!("unknown message type: {tag}")))?;
    let data = if data_json.is_empty() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        serde_json::from_str(data_json).map_err(|e| ProtocolError::Decode(e.to_string()))?
    };

    // Synthesize a deterministic-per-input message ID; compact parses carry
    // no timestamp or session of their own.
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    text.hash(&mut hasher);
    Ok(Message {
        header: MessageHeader {
            message_id: format!("{sender}_{:016x}", hasher.finish()),
            message_type,
            sender_id: sender.to_owned(),
            recipient_id: recipient.to_owned(),
            timestamp: 0.0,
            priority: Priority::Normal,
            session_id: "compact".to_owned(),
            protocol_version: Protocol::VERSION.to_owned(),
        },
        payload: MessagePayload {
            command: command.to_owned(),
            data,
            metadata: None,
        },
        signature: None,
    })
}
