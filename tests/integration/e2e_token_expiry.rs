//! End-to-End: token TTL expiry.
//!
//! Generate a short-TTL token: it validates immediately, fails validation
//! after the TTL passes, and the sweep removes it.

use std::sync::Arc;
use std::time::Duration;

use interlinq::crypto::EncryptionHandler;
use interlinq::pipeline::{MessageHandler, PipelineConfig, PipelineError};
use interlinq::protocol::{MessageDraft, MessageType};
use interlinq::session::{SessionManager, SessionStatus, TokenManager};
use interlinq::transport::Transport;

use il_test_utils::MockTransport;
use serde_json::json;

#[tokio::test]
async fn token_expires_and_is_swept() {
    let tokens = TokenManager::default();
    let value = tokens.generate_token_with_ttl("s3", Duration::from_millis(150));

    assert_eq!(
        tokens.validate_token(&value).as_deref(),
        Some("s3"),
        "fresh token validates"
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(tokens.validate_token(&value), None, "past TTL");
    assert!(tokens.cleanup_expired_tokens() >= 1);
    assert!(tokens.get_token_info("s3").is_none());
}

#[tokio::test]
async fn send_path_rejects_session_after_sweep() {
    let tokens = Arc::new(TokenManager::default());
    tokens.generate_token_with_ttl("s3", Duration::from_millis(100));

    let transport = MockTransport::register("expiry-agent");
    let _peer = MockTransport::register("expiry-peer");
    let handler = MessageHandler::with_config(
        "expiry-agent",
        Arc::clone(&tokens),
        Arc::new(EncryptionHandler::new()),
        transport as Arc<dyn Transport>,
        PipelineConfig {
            encrypt_by_default: false,
            ..PipelineConfig::default()
        },
    );
    handler.register_route("peer", "expiry-peer");

    let msg = handler.protocol().create_message(MessageDraft::new(
        "peer",
        MessageType::Request,
        "work",
        json!({}),
        "s3",
    ));
    assert!(handler.send_message(&msg, false).await.is_ok());

    // Let the token lapse and sweep it out; the same send now fails fast.
    tokio::time::sleep(Duration::from_millis(150)).await;
    tokens.cleanup_expired_tokens();
    assert!(matches!(
        handler.send_message(&msg, false).await,
        Err(PipelineError::UnknownSession(_))
    ));
}

#[tokio::test]
async fn session_sweep_expires_and_tokens_follow() {
    let sessions = Arc::new(SessionManager::with_sweep_period(
        Duration::from_secs(3600),
        Duration::from_millis(20),
    ));
    let tokens = TokenManager::default();

    sessions
        .create_session("s3", &["agent-a"], Some(Duration::from_millis(100)), None)
        .unwrap();
    let value = tokens.generate_token_with_ttl("s3", Duration::from_millis(100));
    sessions.start();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        sessions.get_session("s3").unwrap().status,
        SessionStatus::Expired,
        "session swept"
    );
    assert_eq!(tokens.validate_token(&value), None, "token lapsed with it");
    sessions.stop().await;
}
