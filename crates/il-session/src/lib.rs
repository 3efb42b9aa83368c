// il-session: Session and token lifecycle for the messaging substrate.
//
// Tokens are opaque credentials bound to one session; sessions are the
// shared context a group of agents communicates in.  Both live in memory
// and are owned by their manager — everything else refers to them by ID.

pub mod session;
pub mod token;

pub use session::{SessionError, SessionInfo, SessionManager, SessionStatus};
pub use token::{Token, TokenManager, TokenStatus};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current UNIX time as fractional seconds.
pub(crate) fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
