//! Authentication middleware.
//!
//! Every inbound message passes through `authenticate_message`: block-list
//! check, context lookup, token validation, trusted-agent lift, then every
//! rule whose command pattern matches.  Accepts and rejects both land in a
//! bounded audit log.
//!
//! Permission grants are attached per session with `grant_permissions`;
//! a validated token picks up whatever its session was granted.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Timelike;
use regex::Regex;
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::{info, warn};

use il_protocol::Message;
use il_session::TokenManager;

use crate::ConfigError;

/// Audit log cap; the oldest entries roll off.
const AUDIT_LOG_CAP: usize = 10_000;

/// Context GC threshold: entries idle longer than this are evicted.
const CONTEXT_IDLE_MAX: Duration = Duration::from_secs(3600);

fn now_ts() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// ---------------------------------------------------------------------------
// Levels, contexts, rules
// ---------------------------------------------------------------------------

/// Authentication levels, ordered NONE < BASIC < ELEVATED < ADMIN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AuthLevel {
    None = 0,
    Basic = 1,
    Elevated = 2,
    Admin = 3,
}

impl AuthLevel {
    pub fn name(self) -> &'static str {
        match self {
            AuthLevel::None => "NONE",
            AuthLevel::Basic => "BASIC",
            AuthLevel::Elevated => "ELEVATED",
            AuthLevel::Admin => "ADMIN",
        }
    }
}

/// Cached authentication state for one `(agent, session)` pair.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub agent_id: String,
    pub session_id: String,
    pub token: Option<String>,
    pub permissions: HashSet<String>,
    pub auth_level: AuthLevel,
    pub metadata: Map<String, Value>,
    pub authenticated_at: f64,
    pub last_activity: f64,
    pub request_count: u64,
}

impl AuthContext {
    fn new(agent_id: &str, session_id: &str) -> Self {
        AuthContext {
            agent_id: agent_id.to_owned(),
            session_id: session_id.to_owned(),
            token: None,
            permissions: HashSet::new(),
            auth_level: AuthLevel::None,
            metadata: Map::new(),
            authenticated_at: 0.0,
            last_activity: now_ts(),
            request_count: 0,
        }
    }
}

/// Allowed UTC hour window, inclusive start, exclusive end.  A window that
/// wraps midnight (`start > end`) is honored.
#[derive(Debug, Clone, Copy)]
pub struct TimeRestriction {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl TimeRestriction {
    fn allows(self, hour: u32) -> bool {
        if self.start_hour <= self.end_hour {
            (self.start_hour..self.end_hour).contains(&hour)
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

/// One authorization rule, applied to every command its pattern matches.
#[derive(Debug, Clone)]
pub struct AuthRule {
    pub name: String,
    pattern: Regex,
    pub required_level: AuthLevel,
    pub required_permissions: HashSet<String>,
    /// Requests per minute, enforced per agent with a sliding window.
    pub rate_limit: Option<u32>,
    pub allowed_agents: Option<HashSet<String>>,
    pub denied_agents: Option<HashSet<String>>,
    pub time_restriction: Option<TimeRestriction>,
}

impl AuthRule {
    /// Build a rule.  The pattern matches from the start of the command
    /// (like an anchored regex).
    pub fn new(
        name: &str,
        pattern: &str,
        required_level: AuthLevel,
    ) -> Result<Self, ConfigError> {
        if pattern.is_empty() {
            return Err(ConfigError::InvalidAuthRule {
                name: name.to_owned(),
                reason: "empty pattern".to_owned(),
            });
        }
        let pattern =
            Regex::new(&format!("^(?:{pattern})")).map_err(|e| ConfigError::InvalidAuthRule {
                name: name.to_owned(),
                reason: e.to_string(),
            })?;
        Ok(AuthRule {
            name: name.to_owned(),
            pattern,
            required_level,
            required_permissions: HashSet::new(),
            rate_limit: None,
            allowed_agents: None,
            denied_agents: None,
            time_restriction: None,
        })
    }

    pub fn permissions<I: IntoIterator<Item = &'static str>>(mut self, perms: I) -> Self {
        self.required_permissions = perms.into_iter().map(ToOwned::to_owned).collect();
        self
    }

    pub fn rate_limit(mut self, per_minute: u32) -> Self {
        self.rate_limit = Some(per_minute);
        self
    }

    pub fn allow_agents<I: IntoIterator<Item = &'static str>>(mut self, agents: I) -> Self {
        self.allowed_agents = Some(agents.into_iter().map(ToOwned::to_owned).collect());
        self
    }

    pub fn deny_agents<I: IntoIterator<Item = &'static str>>(mut self, agents: I) -> Self {
        self.denied_agents = Some(agents.into_iter().map(ToOwned::to_owned).collect());
        self
    }

    pub fn time_restriction(mut self, restriction: TimeRestriction) -> Self {
        self.time_restriction = Some(restriction);
        self
    }

    fn matches(&self, command: &str) -> bool {
        self.pattern.is_match(command)
    }
}

/// Authentication failures; each maps to an audited rejection.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("agent {0} is blocked")]
    Blocked(String),
    #[error("invalid or expired token")]
    InvalidToken,
    #[error("command {command} requires {required} authentication")]
    InsufficientLevel {
        command: String,
        required: &'static str,
    },
    #[error("command {command} requires permissions: {missing:?}")]
    MissingPermissions {
        command: String,
        missing: Vec<String>,
    },
    #[error("agent {agent_id} not allowed for command {command}")]
    AgentNotAllowed { agent_id: String, command: String },
    #[error("agent {agent_id} denied for command {command}")]
    AgentDenied { agent_id: String, command: String },
    #[error("rate limit exceeded for command {command}")]
    RateLimited { command: String },
    #[error("command {command} not allowed at this time")]
    TimeRestricted { command: String },
}

/// One structured audit event.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub timestamp: f64,
    pub event_type: String,
    pub details: Map<String, Value>,
}

/// Snapshot of middleware state for monitoring.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuthStatistics {
    pub total_contexts: usize,
    pub active_contexts: usize,
    pub auth_rules: usize,
    pub trusted_agents: usize,
    pub blocked_agents: usize,
    pub audit_events: usize,
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

struct AuthState {
    contexts: HashMap<String, AuthContext>,
    rules: Vec<AuthRule>,
    trusted: HashSet<String>,
    blocked: HashSet<String>,
    /// (rule name, agent) → request timestamps inside the window
    rule_windows: HashMap<(String, String), VecDeque<Instant>>,
    /// session → granted permissions, picked up on token validation
    session_grants: HashMap<String, HashSet<String>>,
    audit_log: VecDeque<AuditEvent>,
}

/// Rule-driven authentication and authorization with audit logging.
pub struct AuthMiddleware {
    tokens: Arc<TokenManager>,
    state: Mutex<AuthState>,
}

impl AuthMiddleware {
    /// Middleware with the stock rule set: `admin_*` commands need ADMIN,
    /// `system_*` need ELEVATED, and high-frequency query commands are
    /// rate-limited to 60/minute.
    pub fn new(tokens: Arc<TokenManager>) -> Self {
        let middleware = Self::without_default_rules(tokens);
        {
            let mut state = middleware.state.lock().expect("auth state poisoned");
            state.rules.push(
                AuthRule::new("admin_commands", "admin_.*", AuthLevel::Admin)
                    .expect("static pattern")
                    .permissions(["admin"]),
            );
            state.rules.push(
                AuthRule::new("system_commands", "system_.*", AuthLevel::Elevated)
                    .expect("static pattern")
                    .permissions(["system"]),
            );
            state.rules.push(
                AuthRule::new(
                    "high_frequency_commands",
                    "(query|search|process)_.*",
                    AuthLevel::Basic,
                )
                .expect("static pattern")
                .rate_limit(60),
            );
        }
        middleware
    }

    /// Middleware with no rules installed.
    pub fn without_default_rules(tokens: Arc<TokenManager>) -> Self {
        AuthMiddleware {
            tokens,
            state: Mutex::new(AuthState {
                contexts: HashMap::new(),
                rules: Vec::new(),
                trusted: HashSet::new(),
                blocked: HashSet::new(),
                rule_windows: HashMap::new(),
                session_grants: HashMap::new(),
                audit_log: VecDeque::new(),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Authentication
    // -----------------------------------------------------------------------

    /// Authenticate one inbound message; returns the (updated) context or
    /// the first rule violation.
    pub fn authenticate_message(&self, message: &Message) -> Result<AuthContext, AuthError> {
        let agent_id = &message.header.sender_id;
        let session_id = &message.header.session_id;
        let command = &message.payload.command;
        let now = now_ts();

        let mut state = self.state.lock().expect("auth state poisoned");

        if state.blocked.contains(agent_id) {
            Self::audit(
                &mut state,
                "auth_blocked_agent",
                json_details(&[("agent_id", json!(agent_id))]),
            );
            return Err(AuthError::Blocked(agent_id.clone()));
        }

        let context_key = format!("{agent_id}:{session_id}");
        let entry = state
            .contexts
            .entry(context_key.clone())
            .or_insert_with(|| AuthContext::new(agent_id, session_id));
        entry.last_activity = now;
        entry.request_count += 1;

        // Token validation (when the message carries one).
        if let Some(token) = message.payload.auth_token() {
            let validated = self.tokens.validate_token(token);
            if validated.as_deref() == Some(session_id.as_str()) {
                let grants = state
                    .session_grants
                    .get(session_id)
                    .cloned()
                    .unwrap_or_default();
                let level = level_from_permissions(&grants);
                let entry = state.contexts.get_mut(&context_key).expect("just inserted");
                entry.token = Some(token.to_owned());
                entry.permissions = grants;
                entry.auth_level = level;
                entry.authenticated_at = now;
                Self::audit(
                    &mut state,
                    "auth_token_validated",
                    json_details(&[
                        ("agent_id", json!(agent_id)),
                        ("session_id", json!(session_id)),
                        ("auth_level", json!(level.name())),
                    ]),
                );
            } else {
                let token_hash = &token_fingerprint(token)[..16];
                Self::audit(
                    &mut state,
                    "auth_token_invalid",
                    json_details(&[
                        ("agent_id", json!(agent_id)),
                        ("session_id", json!(session_id)),
                        ("token_hash", json!(token_hash)),
                    ]),
                );
                return Err(AuthError::InvalidToken);
            }
        }

        // Trusted agents get at least ELEVATED.
        if state.trusted.contains(agent_id) {
            let entry = state.contexts.get_mut(&context_key).expect("just inserted");
            entry.auth_level = entry.auth_level.max(AuthLevel::Elevated);
            entry.permissions.insert("trusted".to_owned());
        }

        let context = state.contexts.get(&context_key).expect("just inserted").clone();

        // Rule application.
        let matching: Vec<AuthRule> = state
            .rules
            .iter()
            .filter(|rule| rule.matches(command))
            .cloned()
            .collect();
        for rule in matching {
            if let Err(e) = Self::apply_rule(&mut state, &rule, &context, command) {
                return Err(e);
            }
        }

        Ok(context)
    }

    fn apply_rule(
        state: &mut AuthState,
        rule: &AuthRule,
        context: &AuthContext,
        command: &str,
    ) -> Result<(), AuthError> {
        if context.auth_level < rule.required_level {
            Self::audit(
                state,
                "auth_insufficient_level",
                json_details(&[
                    ("agent_id", json!(context.agent_id)),
                    ("command", json!(command)),
                    ("required_level", json!(rule.required_level.name())),
                    ("current_level", json!(context.auth_level.name())),
                ]),
            );
            return Err(AuthError::InsufficientLevel {
                command: command.to_owned(),
                required: rule.required_level.name(),
            });
        }

        if !rule.required_permissions.is_subset(&context.permissions) {
            let missing: Vec<String> = rule
                .required_permissions
                .difference(&context.permissions)
                .cloned()
                .collect();
            Self::audit(
                state,
                "auth_insufficient_permissions",
                json_details(&[
                    ("agent_id", json!(context.agent_id)),
                    ("command", json!(command)),
                    ("missing_permissions", json!(missing)),
                ]),
            );
            return Err(AuthError::MissingPermissions {
                command: command.to_owned(),
                missing,
            });
        }

        if let Some(allowed) = &rule.allowed_agents {
            if !allowed.contains(&context.agent_id) {
                return Err(AuthError::AgentNotAllowed {
                    agent_id: context.agent_id.clone(),
                    command: command.to_owned(),
                });
            }
        }
        if let Some(denied) = &rule.denied_agents {
            if denied.contains(&context.agent_id) {
                return Err(AuthError::AgentDenied {
                    agent_id: context.agent_id.clone(),
                    command: command.to_owned(),
                });
            }
        }

        if let Some(limit) = rule.rate_limit {
            let key = (rule.name.clone(), context.agent_id.clone());
            let window = state.rule_windows.entry(key).or_default();
            let now = Instant::now();
            while window
                .front()
                .is_some_and(|&t| now.duration_since(t) >= Duration::from_secs(60))
            {
                window.pop_front();
            }
            if window.len() >= limit as usize {
                Self::audit(
                    state,
                    "auth_rate_limited",
                    json_details(&[
                        ("agent_id", json!(context.agent_id)),
                        ("command", json!(command)),
                        ("rate_limit", json!(limit)),
                    ]),
                );
                return Err(AuthError::RateLimited {
                    command: command.to_owned(),
                });
            }
            window.push_back(now);
        }

        if let Some(restriction) = rule.time_restriction {
            let hour = chrono::Utc::now().hour();
            if !restriction.allows(hour) {
                Self::audit(
                    state,
                    "auth_time_restricted",
                    json_details(&[
                        ("agent_id", json!(context.agent_id)),
                        ("command", json!(command)),
                        ("hour", json!(hour)),
                    ]),
                );
                return Err(AuthError::TimeRestricted {
                    command: command.to_owned(),
                });
            }
        }

        Ok(())
    }

    /// Authorize a specific action: ADMIN passes, otherwise an explicit
    /// `action:resource` permission or the `action:*` wildcard is required.
    pub fn authorize_action(
        &self,
        context: &AuthContext,
        action: &str,
        resource: Option<&str>,
    ) -> bool {
        if context.auth_level == AuthLevel::None {
            return false;
        }
        if context.auth_level == AuthLevel::Admin {
            return true;
        }
        let required = match resource {
            Some(resource) => format!("{action}:{resource}"),
            None => action.to_owned(),
        };
        if context.permissions.contains(&required)
            || context.permissions.contains(&format!("{action}:*"))
        {
            return true;
        }
        let mut state = self.state.lock().expect("auth state poisoned");
        Self::audit(
            &mut state,
            "auth_action_denied",
            json_details(&[
                ("agent_id", json!(context.agent_id)),
                ("action", json!(action)),
                ("resource", json!(resource)),
            ]),
        );
        false
    }

    // -----------------------------------------------------------------------
    // Administration
    // -----------------------------------------------------------------------

    pub fn add_auth_rule(&self, rule: AuthRule) {
        let mut state = self.state.lock().expect("auth state poisoned");
        info!(rule = %rule.name, "auth rule added");
        state.rules.push(rule);
    }

    pub fn remove_auth_rule(&self, rule_name: &str) -> bool {
        let mut state = self.state.lock().expect("auth state poisoned");
        let before = state.rules.len();
        state.rules.retain(|r| r.name != rule_name);
        state.rules.len() < before
    }

    /// Grant permissions to a session; validated tokens for that session
    /// inherit them.
    pub fn grant_permissions<I: IntoIterator<Item = &'static str>>(
        &self,
        session_id: &str,
        permissions: I,
    ) {
        let mut state = self.state.lock().expect("auth state poisoned");
        state
            .session_grants
            .entry(session_id.to_owned())
            .or_default()
            .extend(permissions.into_iter().map(ToOwned::to_owned));
    }

    pub fn add_trusted_agent(&self, agent_id: &str) {
        let mut state = self.state.lock().expect("auth state poisoned");
        state.trusted.insert(agent_id.to_owned());
        info!(agent_id, "trusted agent added");
    }

    pub fn remove_trusted_agent(&self, agent_id: &str) {
        let mut state = self.state.lock().expect("auth state poisoned");
        state.trusted.remove(agent_id);
    }

    pub fn block_agent(&self, agent_id: &str, reason: &str) {
        let mut state = self.state.lock().expect("auth state poisoned");
        state.blocked.insert(agent_id.to_owned());
        Self::audit(
            &mut state,
            "agent_blocked",
            json_details(&[("agent_id", json!(agent_id)), ("reason", json!(reason))]),
        );
        warn!(agent_id, reason, "agent blocked");
    }

    pub fn unblock_agent(&self, agent_id: &str) {
        let mut state = self.state.lock().expect("auth state poisoned");
        state.blocked.remove(agent_id);
        Self::audit(
            &mut state,
            "agent_unblocked",
            json_details(&[("agent_id", json!(agent_id))]),
        );
    }

    pub fn get_auth_context(&self, agent_id: &str, session_id: &str) -> Option<AuthContext> {
        let state = self.state.lock().expect("auth state poisoned");
        state.contexts.get(&format!("{agent_id}:{session_id}")).cloned()
    }

    /// Evict contexts idle longer than one hour.  Returns the count evicted.
    pub fn cleanup_expired_contexts(&self) -> usize {
        let cutoff = now_ts() - CONTEXT_IDLE_MAX.as_secs_f64();
        let mut state = self.state.lock().expect("auth state poisoned");
        let before = state.contexts.len();
        state.contexts.retain(|_, c| c.last_activity >= cutoff);
        before - state.contexts.len()
    }

    // -----------------------------------------------------------------------
    // Audit log
    // -----------------------------------------------------------------------

    fn audit(state: &mut AuthState, event_type: &str, details: Map<String, Value>) {
        if state.audit_log.len() >= AUDIT_LOG_CAP {
            state.audit_log.pop_front();
        }
        state.audit_log.push_back(AuditEvent {
            timestamp: now_ts(),
            event_type: event_type.to_owned(),
            details,
        });
    }

    /// Filtered view of the audit log, newest last.
    pub fn get_audit_log(
        &self,
        event_type: Option<&str>,
        agent_id: Option<&str>,
        limit: usize,
    ) -> Vec<AuditEvent> {
        let state = self.state.lock().expect("auth state poisoned");
        let filtered: Vec<AuditEvent> = state
            .audit_log
            .iter()
            .filter(|e| event_type.is_none_or(|t| e.event_type == t))
            .filter(|e| {
                agent_id.is_none_or(|a| {
                    e.details.get("agent_id").and_then(Value::as_str) == Some(a)
                })
            })
            .cloned()
            .collect();
        let skip = filtered.len().saturating_sub(limit);
        filtered.into_iter().skip(skip).collect()
    }

    pub fn statistics(&self) -> AuthStatistics {
        let state = self.state.lock().expect("auth state poisoned");
        let active_cutoff = now_ts() - 300.0;
        AuthStatistics {
            total_contexts: state.contexts.len(),
            active_contexts: state
                .contexts
                .values()
                .filter(|c| c.last_activity >= active_cutoff)
                .count(),
            auth_rules: state.rules.len(),
            trusted_agents: state.trusted.len(),
            blocked_agents: state.blocked.len(),
            audit_events: state.audit_log.len(),
        }
    }
}

/// ADMIN from `admin`, ELEVATED from `elevated`/`system`, BASIC from any
/// grant at all.
fn level_from_permissions(permissions: &HashSet<String>) -> AuthLevel {
    if permissions.contains("admin") {
        AuthLevel::Admin
    } else if permissions.contains("elevated") || permissions.contains("system") {
        AuthLevel::Elevated
    } else if !permissions.is_empty() {
        AuthLevel::Basic
    } else {
        AuthLevel::None
    }
}

fn json_details(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), v.clone()))
        .collect()
}

fn token_fingerprint(token: &str) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(token.as_bytes()))
}
