//! End-to-End: rate limiting admits exactly the configured budget.
//!
//! Rule of 10 requests per 60 s for agent X: of 15 back-to-back requests,
//! exactly 10 are admitted and the 5 rejections carry a nonzero
//! retry_after.  The same budget applies through the auth middleware's
//! per-rule sliding window.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use interlinq::middleware::{
    AuthError, AuthLevel, AuthMiddleware, AuthRule, RateLimitRule, RateLimitStrategy, RateLimiter,
};
use interlinq::protocol::{Message, MessageDraft, MessageType, Protocol};
use interlinq::session::TokenManager;

#[tokio::test]
async fn exactly_ten_of_fifteen_requests_pass() {
    let limiter = RateLimiter::new();
    limiter.set_agent_rule(
        "agent-x",
        RateLimitRule::new(10, Duration::from_secs(60))
            .unwrap()
            .strategy(RateLimitStrategy::SlidingWindow),
    );

    let results: Vec<_> = (0..15)
        .map(|_| limiter.check_rate_limit(Some("agent-x"), 1))
        .collect();

    let admitted = results.iter().filter(|r| r.allowed).count();
    assert_eq!(admitted, 10);
    assert!(results[..10].iter().all(|r| r.allowed));
    for rejected in &results[10..] {
        assert!(!rejected.allowed);
        assert!(
            rejected.retry_after.unwrap() > Duration::ZERO,
            "rejections say when to come back"
        );
        assert_eq!(rejected.remaining_requests, 0);
    }

    let metrics = limiter.metrics();
    assert_eq!(metrics.total_requests, 15);
    assert_eq!(metrics.allowed_requests, 10);
    assert_eq!(metrics.blocked_requests, 5);
}

#[tokio::test]
async fn other_agents_keep_their_own_budget() {
    let limiter = RateLimiter::new();
    limiter.set_agent_rule(
        "agent-x2",
        RateLimitRule::new(2, Duration::from_secs(60))
            .unwrap()
            .strategy(RateLimitStrategy::SlidingWindow),
    );

    assert!(limiter.check_rate_limit(Some("agent-x2"), 1).allowed);
    assert!(limiter.check_rate_limit(Some("agent-x2"), 1).allowed);
    assert!(!limiter.check_rate_limit(Some("agent-x2"), 1).allowed);
    // agent-y2 rides the 100/60s default rule.
    assert!(limiter.check_rate_limit(Some("agent-y2"), 1).allowed);
}

fn bulk_message(sender: &str, n: usize) -> Message {
    Protocol::new(sender).create_message(MessageDraft::new(
        "gateway",
        MessageType::Request,
        "bulk_export",
        json!({ "n": n }),
        "s6",
    ))
}

#[tokio::test]
async fn auth_rule_rate_limit_matches_the_budget() {
    let tokens = Arc::new(TokenManager::default());
    let auth = AuthMiddleware::without_default_rules(tokens);
    auth.add_auth_rule(
        AuthRule::new("bulk_budget", "bulk_.*", AuthLevel::None)
            .unwrap()
            .rate_limit(10),
    );

    let mut outcomes = Vec::new();
    for n in 0..15 {
        outcomes.push(auth.authenticate_message(&bulk_message("agent-x3", n)));
    }
    let admitted = outcomes.iter().filter(|o| o.is_ok()).count();
    assert_eq!(admitted, 10);
    assert!(
        outcomes[10..]
            .iter()
            .all(|o| matches!(o, Err(AuthError::RateLimited { .. })))
    );

    let audited = auth.get_audit_log(Some("auth_rate_limited"), Some("agent-x3"), 100);
    assert_eq!(audited.len(), 5);
}

#[tokio::test]
async fn token_bucket_budget_refills_over_time() {
    let limiter = RateLimiter::new();
    limiter.set_agent_rule(
        "agent-x4",
        RateLimitRule::new(50, Duration::from_secs(1)).unwrap(),
    );

    // Drain the bucket.
    while limiter.check_rate_limit(Some("agent-x4"), 1).allowed {}
    assert!(!limiter.check_rate_limit(Some("agent-x4"), 1).allowed);

    // 50 tokens/s: a short wait buys the next request.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(limiter.check_rate_limit(Some("agent-x4"), 1).allowed);
}
