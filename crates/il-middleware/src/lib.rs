// il-middleware: Policy layers around the message pipeline.
//
// - auth: rule-based authentication/authorization with an audit trail
// - rate_limit: token-bucket and sliding-window limiting, adaptive throttle
// - balance: health-aware backend selection
// - compress: entropy-driven payload compression

pub mod auth;
pub mod balance;
pub mod compress;
pub mod rate_limit;

pub use auth::{AuthContext, AuthError, AuthLevel, AuthMiddleware, AuthRule, TimeRestriction};
pub use balance::{BackendAgent, LoadBalancer, LoadBalancingStrategy};
pub use compress::{
    CompressionAlgorithm, CompressionConfig, CompressionError, CompressionMiddleware,
    CompressionOutcome,
};
pub use rate_limit::{
    RateLimitResult, RateLimitRule, RateLimitStrategy, RateLimiter,
};

use thiserror::Error;

/// Setup-time configuration failures (invalid rules and limits).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid auth rule {name}: {reason}")]
    InvalidAuthRule { name: String, reason: String },
    #[error("invalid rate limit rule: {0}")]
    InvalidRateRule(String),
}
