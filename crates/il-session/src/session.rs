//! Multi-agent session lifecycle.
//!
//! Sessions are created ACTIVE and may be paused/resumed; they expire when
//! their deadline passes and terminate when explicitly ended or when the
//! last participant leaves.  A background sweep (default every 60 s) marks
//! overdue sessions EXPIRED and garbage-collects sessions that have been
//! EXPIRED/TERMINATED for more than 24 h.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::now_ts;

/// How long an ended session lingers before the sweep deletes it.
const ENDED_RETENTION: f64 = 24.0 * 3600.0;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Pending,
    Active,
    Paused,
    Expired,
    Terminated,
}

/// Errors from session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} already exists")]
    AlreadyExists(String),
}

/// One communication session and its participants.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: String,
    pub participants: HashSet<String>,
    pub created_at: f64,
    pub expires_at: f64,
    pub status: SessionStatus,
    pub metadata: Map<String, Value>,
    /// Set when the session reaches EXPIRED or TERMINATED; drives GC.
    pub ended_at: Option<f64>,
}

impl SessionInfo {
    fn is_past_deadline(&self, now: f64) -> bool {
        now > self.expires_at
    }

    fn end(&mut self, status: SessionStatus, now: f64) {
        self.status = status;
        if self.ended_at.is_none() {
            self.ended_at = Some(now);
        }
    }
}

/// Per-status session counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub total: usize,
    pub active: usize,
    pub paused: usize,
    pub expired: usize,
    pub terminated: usize,
}

#[derive(Default)]
struct SessionTable {
    sessions: HashMap<String, SessionInfo>,
    /// agent_id → session_ids, the reverse participant index
    by_agent: HashMap<String, HashSet<String>>,
}

impl SessionTable {
    fn unlink_participant(&mut self, agent_id: &str, session_id: &str) {
        if let Some(sessions) = self.by_agent.get_mut(agent_id) {
            sessions.remove(session_id);
            if sessions.is_empty() {
                self.by_agent.remove(agent_id);
            }
        }
    }

    fn terminate(&mut self, session_id: &str, now: f64) -> bool {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return false;
        };
        session.end(SessionStatus::Terminated, now);
        let participants: Vec<String> = session.participants.drain().collect();
        for agent_id in participants {
            self.unlink_participant(&agent_id, session_id);
        }
        true
    }
}

/// Manages communication sessions between agents.
pub struct SessionManager {
    default_ttl: Duration,
    sweep_period: Duration,
    inner: Arc<Mutex<SessionTable>>,
    sweeper: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl SessionManager {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);
    pub const DEFAULT_SWEEP_PERIOD: Duration = Duration::from_secs(60);

    pub fn new(default_ttl: Duration) -> Self {
        Self::with_sweep_period(default_ttl, Self::DEFAULT_SWEEP_PERIOD)
    }

    /// Override the sweep cadence (tests use short periods).
    pub fn with_sweep_period(default_ttl: Duration, sweep_period: Duration) -> Self {
        SessionManager {
            default_ttl,
            sweep_period,
            inner: Arc::new(Mutex::new(SessionTable::default())),
            sweeper: Mutex::new(None),
        }
    }

    // -----------------------------------------------------------------------
    // Background sweep
    // -----------------------------------------------------------------------

    /// Start the background expiry sweep.  Idempotent.
    pub fn start(&self) {
        let mut sweeper = self.sweeper.lock().expect("sweeper slot poisoned");
        if sweeper.is_some() {
            return;
        }
        let (tx, mut rx) = watch::channel(false);
        let table = Arc::clone(&self.inner);
        let period = self.sweep_period;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        Self::sweep_table(&table);
                    }
                    _ = rx.changed() => break,
                }
            }
        });
        *sweeper = Some((tx, handle));
        info!("session manager started");
    }

    /// Stop the background sweep and wait for it to exit.
    pub async fn stop(&self) {
        let taken = self
            .sweeper
            .lock()
            .expect("sweeper slot poisoned")
            .take();
        if let Some((tx, handle)) = taken {
            let _ = tx.send(true);
            if handle.await.is_err() {
                warn!("session sweeper exited abnormally");
            }
            info!("session manager stopped");
        }
    }

    /// One sweep pass: mark overdue ACTIVE sessions EXPIRED, delete sessions
    /// that ended more than 24 h ago, and purge the reverse index.
    pub fn sweep(&self) {
        Self::sweep_table(&self.inner);
    }

    fn sweep_table(inner: &Mutex<SessionTable>) {
        let now = now_ts();
        let mut table = inner.lock().expect("session table poisoned");

        let overdue: Vec<String> = table
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::Active && s.is_past_deadline(now))
            .map(|s| s.session_id.clone())
            .collect();
        for session_id in &overdue {
            if let Some(session) = table.sessions.get_mut(session_id) {
                session.end(SessionStatus::Expired, now);
                info!(session_id, "session expired");
            }
        }

        let stale: Vec<String> = table
            .sessions
            .values()
            .filter(|s| {
                matches!(s.status, SessionStatus::Expired | SessionStatus::Terminated)
                    && s.ended_at.is_some_and(|t| now - t > ENDED_RETENTION)
            })
            .map(|s| s.session_id.clone())
            .collect();
        for session_id in &stale {
            if let Some(session) = table.sessions.remove(session_id) {
                let participants: Vec<String> =
                    session.participants.iter().cloned().collect();
                for agent_id in participants {
                    table.unlink_participant(&agent_id, session_id);
                }
                debug!(session_id, "stale session removed");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Session operations
    // -----------------------------------------------------------------------

    /// Create a session.  Rejects duplicate IDs.  A session created with no
    /// participants is terminated immediately.
    pub fn create_session(
        &self,
        session_id: &str,
        participants: &[&str],
        ttl: Option<Duration>,
        metadata: Option<Map<String, Value>>,
    ) -> Result<SessionInfo, SessionError> {
        let now = now_ts();
        let ttl = ttl.unwrap_or(self.default_ttl);
        let mut table = self.inner.lock().expect("session table poisoned");
        if table.sessions.contains_key(session_id) {
            return Err(SessionError::AlreadyExists(session_id.to_owned()));
        }

        let mut session = SessionInfo {
            session_id: session_id.to_owned(),
            participants: participants.iter().map(|&p| p.to_owned()).collect(),
            created_at: now,
            expires_at: now + ttl.as_secs_f64(),
            status: SessionStatus::Active,
            metadata: metadata.unwrap_or_default(),
            ended_at: None,
        };
        if session.participants.is_empty() {
            session.end(SessionStatus::Terminated, now);
        }

        for agent_id in &session.participants {
            table
                .by_agent
                .entry(agent_id.clone())
                .or_default()
                .insert(session_id.to_owned());
        }
        table.sessions.insert(session_id.to_owned(), session.clone());
        info!(session_id, participants = participants.len(), "session created");
        Ok(session)
    }

    /// Snapshot of a session, refreshing expiry status on read.
    pub fn get_session(&self, session_id: &str) -> Option<SessionInfo> {
        let now = now_ts();
        let mut table = self.inner.lock().expect("session table poisoned");
        let session = table.sessions.get_mut(session_id)?;
        if session.status == SessionStatus::Active && session.is_past_deadline(now) {
            session.end(SessionStatus::Expired, now);
        }
        Some(session.clone())
    }

    /// Push the session deadline out by `additional_ttl` from now.
    /// Only ACTIVE and PAUSED sessions can be extended.
    pub fn extend_session(&self, session_id: &str, additional_ttl: Option<Duration>) -> bool {
        let additional = additional_ttl.unwrap_or(self.default_ttl);
        let mut table = self.inner.lock().expect("session table poisoned");
        let Some(session) = table.sessions.get_mut(session_id) else {
            return false;
        };
        if !matches!(session.status, SessionStatus::Active | SessionStatus::Paused) {
            return false;
        }
        session.expires_at = now_ts() + additional.as_secs_f64();
        debug!(session_id, "session extended");
        true
    }

    pub fn pause_session(&self, session_id: &str) -> bool {
        let mut table = self.inner.lock().expect("session table poisoned");
        let Some(session) = table.sessions.get_mut(session_id) else {
            return false;
        };
        if session.status != SessionStatus::Active {
            return false;
        }
        session.status = SessionStatus::Paused;
        info!(session_id, "session paused");
        true
    }

    /// Resume a paused session.  A paused session whose deadline already
    /// passed expires instead of resuming.
    pub fn resume_session(&self, session_id: &str) -> bool {
        let now = now_ts();
        let mut table = self.inner.lock().expect("session table poisoned");
        let Some(session) = table.sessions.get_mut(session_id) else {
            return false;
        };
        if session.status != SessionStatus::Paused {
            return false;
        }
        if session.is_past_deadline(now) {
            session.end(SessionStatus::Expired, now);
            return false;
        }
        session.status = SessionStatus::Active;
        info!(session_id, "session resumed");
        true
    }

    /// Terminate a session, removing all participants.
    pub fn terminate_session(&self, session_id: &str) -> bool {
        let now = now_ts();
        let mut table = self.inner.lock().expect("session table poisoned");
        let terminated = table.terminate(session_id, now);
        if terminated {
            info!(session_id, "session terminated");
        }
        terminated
    }

    /// Add a participant.  Requires ACTIVE status.
    pub fn add_participant(&self, session_id: &str, agent_id: &str) -> bool {
        let mut table = self.inner.lock().expect("session table poisoned");
        let Some(session) = table.sessions.get_mut(session_id) else {
            return false;
        };
        if session.status != SessionStatus::Active {
            return false;
        }
        session.participants.insert(agent_id.to_owned());
        table
            .by_agent
            .entry(agent_id.to_owned())
            .or_default()
            .insert(session_id.to_owned());
        debug!(session_id, agent_id, "participant added");
        true
    }

    /// Remove a participant.  The session auto-terminates when the last
    /// participant leaves.
    pub fn remove_participant(&self, session_id: &str, agent_id: &str) -> bool {
        let now = now_ts();
        let mut table = self.inner.lock().expect("session table poisoned");
        if !table.sessions.contains_key(session_id) {
            return false;
        }
        if let Some(session) = table.sessions.get_mut(session_id) {
            session.participants.remove(agent_id);
        }
        table.unlink_participant(agent_id, session_id);

        let now_empty = table
            .sessions
            .get(session_id)
            .is_some_and(|s| s.participants.is_empty());
        if now_empty {
            table.terminate(session_id, now);
            info!(session_id, "session auto-terminated (no participants)");
        }
        debug!(session_id, agent_id, "participant removed");
        true
    }

    /// Session IDs the agent currently participates in.
    pub fn get_agent_sessions(&self, agent_id: &str) -> Vec<String> {
        let table = self.inner.lock().expect("session table poisoned");
        table
            .by_agent
            .get(agent_id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// IDs of all sessions that are ACTIVE and not past their deadline.
    pub fn get_active_sessions(&self) -> Vec<String> {
        let now = now_ts();
        let table = self.inner.lock().expect("session table poisoned");
        table
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::Active && !s.is_past_deadline(now))
            .map(|s| s.session_id.clone())
            .collect()
    }

    /// Per-status counts, refreshing expiry state first.
    pub fn stats(&self) -> SessionStats {
        let now = now_ts();
        let mut table = self.inner.lock().expect("session table poisoned");
        let mut stats = SessionStats::default();
        for session in table.sessions.values_mut() {
            if session.status == SessionStatus::Active && session.is_past_deadline(now) {
                session.end(SessionStatus::Expired, now);
            }
            stats.total += 1;
            match session.status {
                SessionStatus::Active => stats.active += 1,
                SessionStatus::Paused => stats.paused += 1,
                SessionStatus::Expired => stats.expired += 1,
                SessionStatus::Terminated => stats.terminated += 1,
                SessionStatus::Pending => {}
            }
        }
        stats
    }
}
