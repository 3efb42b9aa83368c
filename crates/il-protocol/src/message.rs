//! Canonical message model and the per-agent message factory.
//!
//! A [`Message`] is immutable after creation: the factory stamps identity,
//! timestamp, and protocol version, and nothing downstream rewrites them.
//! Message IDs are `<sender>_<counter>_<epoch>` where `counter` is a
//! process-lifetime monotonic `u64` (it does not wrap).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Recipient wildcard for broadcast messages.
pub const BROADCAST: &str = "*";

/// Current UNIX time as fractional seconds.
pub fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Message kinds in the v1 protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Response,
    Notification,
    Error,
    Heartbeat,
    Handshake,
}

/// Priority lanes, ordered CRITICAL > HIGH > NORMAL > LOW.
///
/// Serialized as the numeric lane value (1-4) to keep the wire shape stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Priority {
    Low = 1,
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> Self {
        p as u8
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Priority::Low),
            2 => Ok(Priority::Normal),
            3 => Ok(Priority::High),
            4 => Ok(Priority::Critical),
            other => Err(format!("invalid priority value: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Message structure
// ---------------------------------------------------------------------------

fn default_protocol_version() -> String {
    Protocol::VERSION.to_owned()
}

/// Routing and ordering metadata for one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub message_id: String,
    pub message_type: MessageType,
    pub sender_id: String,
    /// `"*"` addresses every reachable peer.
    pub recipient_id: String,
    /// UNIX seconds, fractional.
    pub timestamp: f64,
    pub priority: Priority,
    pub session_id: String,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
}

/// Command payload: the action name plus an arbitrary JSON data tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub command: String,
    pub data: Value,
    /// Optional side-channel map; may carry `auth_token`.
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

impl MessagePayload {
    /// The `auth_token` metadata entry, if present.
    pub fn auth_token(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("auth_token"))
            .and_then(Value::as_str)
    }
}

/// The unit of communication: header + payload + optional detached signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub header: MessageHeader,
    pub payload: MessagePayload,
    #[serde(default)]
    pub signature: Option<String>,
}

impl Message {
    /// True when this message is addressed to every peer.
    pub fn is_broadcast(&self) -> bool {
        self.header.recipient_id == BROADCAST
    }
}

// ---------------------------------------------------------------------------
// Message factory
// ---------------------------------------------------------------------------

/// Everything the caller chooses when creating a message; the factory fills
/// in identity, timestamp, and version.
#[derive(Debug)]
pub struct MessageDraft<'a> {
    pub recipient_id: &'a str,
    pub message_type: MessageType,
    pub command: &'a str,
    pub data: Value,
    pub session_id: &'a str,
    pub priority: Priority,
    pub metadata: Option<Map<String, Value>>,
}

impl<'a> MessageDraft<'a> {
    /// A NORMAL-priority draft with no metadata.
    pub fn new(
        recipient_id: &'a str,
        message_type: MessageType,
        command: &'a str,
        data: Value,
        session_id: &'a str,
    ) -> Self {
        MessageDraft {
            recipient_id,
            message_type,
            command,
            data,
            session_id,
            priority: Priority::Normal,
            metadata: None,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Per-agent protocol state: owns the monotonic message counter.
#[derive(Debug)]
pub struct Protocol {
    agent_id: String,
    counter: AtomicU64,
}

impl Protocol {
    pub const VERSION: &'static str = "1.0";
    /// Cap on the JSON-encoded size of a single message.
    pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

    pub fn new(agent_id: impl Into<String>) -> Self {
        Protocol {
            agent_id: agent_id.into(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Stamp a draft into a complete message.
    pub fn create_message(&self, draft: MessageDraft<'_>) -> Message {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let now = now_ts();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let epoch = now as u64;
        Message {
            header: MessageHeader {
                message_id: format!("{}_{}_{}", self.agent_id, n, epoch),
                message_type: draft.message_type,
                sender_id: self.agent_id.clone(),
                recipient_id: draft.recipient_id.to_owned(),
                timestamp: now,
                priority: draft.priority,
                session_id: draft.session_id.to_owned(),
                protocol_version: Self::VERSION.to_owned(),
            },
            payload: MessagePayload {
                command: draft.command.to_owned(),
                data: draft.data,
                metadata: draft.metadata,
            },
            signature: None,
        }
    }

    /// An ERROR response addressed back at the offending message's sender.
    ///
    /// Carries the original message ID so the peer can correlate, and copies
    /// the offending message's priority.
    pub fn create_error_response(
        &self,
        original: &Message,
        error_code: &str,
        error_description: &str,
    ) -> Message {
        self.create_message(
            MessageDraft::new(
                &original.header.sender_id,
                MessageType::Error,
                "error",
                serde_json::json!({
                    "error_code": error_code,
                    "error_description": error_description,
                    "original_message_id": original.header.message_id,
                }),
                &original.header.session_id,
            )
            .priority(original.header.priority),
        )
    }

    /// A broadcast HEARTBEAT (`command = "ping"`); peers update `last_seen`
    /// on receipt, no reply is expected.
    pub fn create_heartbeat(&self, session_id: &str) -> Message {
        self.create_message(
            MessageDraft::new(
                BROADCAST,
                MessageType::Heartbeat,
                "ping",
                serde_json::json!({ "timestamp": now_ts() }),
                session_id,
            )
            .priority(Priority::Low),
        )
    }
}
