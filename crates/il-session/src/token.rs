//! Session token issue, validation, revocation, and expiry sweep.
//!
//! At most one ACTIVE token exists per session: generating a new token
//! replaces the previous one outright.  Expiry is observable only through
//! validation or the sweep — tokens are never actively notified.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use rand::rngs::OsRng;
use tracing::debug;

use crate::now_ts;

/// Token lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    Active,
    Expired,
    Revoked,
    Pending,
}

/// A communication token bound to one session.
#[derive(Debug, Clone)]
pub struct Token {
    pub token_id: String,
    /// Opaque URL-safe value with ≥32 bytes of entropy.
    pub value: String,
    pub created_at: f64,
    pub expires_at: f64,
    pub status: TokenStatus,
    pub session_id: String,
}

impl Token {
    fn is_valid(&self, now: f64) -> bool {
        self.status == TokenStatus::Active && self.expires_at > now
    }
}

#[derive(Default)]
struct TokenTable {
    tokens: HashMap<String, Token>,
    /// session_id → token_id
    by_session: HashMap<String, String>,
    /// token value → token_id, so validation avoids a table scan
    by_value: HashMap<String, String>,
}

impl TokenTable {
    fn remove(&mut self, token_id: &str) -> Option<Token> {
        let token = self.tokens.remove(token_id)?;
        self.by_session.remove(&token.session_id);
        self.by_value.remove(&token.value);
        Some(token)
    }
}

/// Issues and tracks tokens for sessions.
pub struct TokenManager {
    default_ttl: Duration,
    inner: Mutex<TokenTable>,
}

impl TokenManager {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

    pub fn new(default_ttl: Duration) -> Self {
        TokenManager {
            default_ttl,
            inner: Mutex::new(TokenTable::default()),
        }
    }

    /// Issue a token for `session_id` with the default TTL, replacing any
    /// prior token for that session.
    pub fn generate_token(&self, session_id: &str) -> String {
        self.generate_token_with_ttl(session_id, self.default_ttl)
    }

    /// Issue a token with an explicit TTL.
    pub fn generate_token_with_ttl(&self, session_id: &str, ttl: Duration) -> String {
        let mut value_bytes = [0u8; 32];
        OsRng.fill_bytes(&mut value_bytes);
        let value = URL_SAFE_NO_PAD.encode(value_bytes);

        let mut id_bytes = [0u8; 16];
        OsRng.fill_bytes(&mut id_bytes);
        let token_id = hex::encode(id_bytes);

        let now = now_ts();
        let token = Token {
            token_id: token_id.clone(),
            value: value.clone(),
            created_at: now,
            expires_at: now + ttl.as_secs_f64(),
            status: TokenStatus::Active,
            session_id: session_id.to_owned(),
        };

        let mut table = self.inner.lock().expect("token table poisoned");
        if let Some(old_id) = table.by_session.get(session_id).cloned() {
            table.remove(&old_id);
        }
        table.by_session.insert(session_id.to_owned(), token_id.clone());
        table.by_value.insert(value.clone(), token_id.clone());
        table.tokens.insert(token_id, token);
        debug!(session_id, "token issued");
        value
    }

    /// Validate a token value.  Returns the bound session ID when the token
    /// is ACTIVE and unexpired.
    pub fn validate_token(&self, value: &str) -> Option<String> {
        let table = self.inner.lock().expect("token table poisoned");
        let token_id = table.by_value.get(value)?;
        let token = table.tokens.get(token_id)?;
        token.is_valid(now_ts()).then(|| token.session_id.clone())
    }

    /// Revoke the session's token.  Returns false when no token exists.
    pub fn revoke_token(&self, session_id: &str) -> bool {
        let mut table = self.inner.lock().expect("token table poisoned");
        let Some(token_id) = table.by_session.get(session_id).cloned() else {
            return false;
        };
        if let Some(token) = table.tokens.get_mut(&token_id) {
            token.status = TokenStatus::Revoked;
            debug!(session_id, "token revoked");
            return true;
        }
        false
    }

    /// Sweep out every token past its deadline, transitioning each through
    /// EXPIRED before removal.  Returns the number removed.
    pub fn cleanup_expired_tokens(&self) -> usize {
        let now = now_ts();
        let mut table = self.inner.lock().expect("token table poisoned");
        let expired: Vec<String> = table
            .tokens
            .iter()
            .filter(|(_, t)| t.expires_at < now)
            .map(|(id, _)| id.clone())
            .collect();
        for token_id in &expired {
            if let Some(token) = table.tokens.get_mut(token_id) {
                token.status = TokenStatus::Expired;
            }
            table.remove(token_id);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "expired tokens swept");
        }
        expired.len()
    }

    /// Snapshot of the session's current token, if any.
    pub fn get_token_info(&self, session_id: &str) -> Option<Token> {
        let table = self.inner.lock().expect("token table poisoned");
        let token_id = table.by_session.get(session_id)?;
        table.tokens.get(token_id).cloned()
    }

    /// Number of tokens currently tracked (any status).
    pub fn token_count(&self) -> usize {
        self.inner.lock().expect("token table poisoned").tokens.len()
    }
}

impl Default for TokenManager {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TTL)
    }
}
