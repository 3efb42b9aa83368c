//! Shape validators for identifiers and payload trees.

use serde_json::Value;

pub const MAX_AGENT_ID_LEN: usize = 64;
pub const MAX_SESSION_ID_LEN: usize = 128;
pub const MAX_COMMAND_LEN: usize = 64;
pub const MAX_PAYLOAD_DEPTH: usize = 10;

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Agent IDs: non-empty, `[A-Za-z0-9_-]`, at most 64 chars.
pub fn valid_agent_id(agent_id: &str) -> bool {
    !agent_id.is_empty()
        && agent_id.len() <= MAX_AGENT_ID_LEN
        && agent_id.chars().all(is_ident_char)
}

/// Session IDs: non-empty, `[A-Za-z0-9_-]`, at most 128 chars.
pub fn valid_session_id(session_id: &str) -> bool {
    !session_id.is_empty()
        && session_id.len() <= MAX_SESSION_ID_LEN
        && session_id.chars().all(is_ident_char)
}

/// Token values: URL-safe base64 alphabet, 32 to 256 chars.
pub fn valid_token_shape(token: &str) -> bool {
    (32..=256).contains(&token.len()) && token.chars().all(is_ident_char)
}

/// True when no branch of `value` nests deeper than `max_depth` containers.
pub fn payload_within_depth(value: &Value, max_depth: usize) -> bool {
    fn check(value: &Value, remaining: usize) -> bool {
        match value {
            Value::Object(map) => {
                remaining > 0 && map.values().all(|v| check(v, remaining - 1))
            }
            Value::Array(items) => {
                remaining > 0 && items.iter().all(|v| check(v, remaining - 1))
            }
            _ => true,
        }
    }
    check(value, max_depth)
}
