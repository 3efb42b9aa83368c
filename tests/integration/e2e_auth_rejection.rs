//! End-to-End: auth rejection produces an ERROR response and an audit entry.
//!
//! Rule: `admin_.*` requires ADMIN.  An agent holding a BASIC token sends
//! `admin_restart`; authentication fails with insufficient level, the
//! pipeline answers with an ERROR message carrying the offending message
//! ID, and the audit log records `auth_insufficient_level`.

use std::sync::Arc;

use serde_json::{Map, json};

use il_test_utils::MockTransport;
use interlinq::crypto::EncryptionHandler;
use interlinq::middleware::{AuthError, AuthMiddleware};
use interlinq::pipeline::{MessageHandler, PipelineConfig};
use interlinq::protocol::{self, Message, MessageDraft, MessageType, error_codes};
use interlinq::session::TokenManager;
use interlinq::transport::Transport;

const SESSION: &str = "s4";

/// The receiving side: pipeline + auth middleware sharing one token table.
struct Receiver {
    handler: Arc<MessageHandler>,
    auth: AuthMiddleware,
    tokens: Arc<TokenManager>,
}

fn build_receiver(agent_id: &str) -> Receiver {
    let tokens = Arc::new(TokenManager::default());
    let transport = MockTransport::register(agent_id);
    let handler = Arc::new(MessageHandler::with_config(
        agent_id,
        Arc::clone(&tokens),
        Arc::new(EncryptionHandler::new()),
        transport as Arc<dyn Transport>,
        PipelineConfig {
            encrypt_by_default: false,
            ..PipelineConfig::default()
        },
    ));
    let auth = AuthMiddleware::new(Arc::clone(&tokens));
    Receiver {
        handler,
        auth,
        tokens,
    }
}

fn admin_restart_from(sender: &str, token: &str) -> Message {
    let mut metadata = Map::new();
    metadata.insert("auth_token".to_owned(), json!(token));
    protocol::Protocol::new(sender).create_message(
        MessageDraft::new("gateway", MessageType::Request, "admin_restart", json!({}), SESSION)
            .metadata(metadata),
    )
}

#[tokio::test]
async fn basic_token_cannot_run_admin_command() {
    let receiver = build_receiver("auth-gateway");
    let sender_transport = MockTransport::register("auth-basic-sender");
    receiver.handler.register_route("auth-basic-sender", "auth-basic-sender");

    // BASIC: the session only carries a plain read permission.
    let token = receiver.tokens.generate_token(SESSION);
    receiver.auth.grant_permissions(SESSION, ["read"]);

    let offending = admin_restart_from("auth-basic-sender", &token);
    let verdict = receiver.auth.authenticate_message(&offending);
    assert!(matches!(&verdict, Err(AuthError::InsufficientLevel { .. })));

    // The inbound pipeline answers the rejection with an ERROR response.
    receiver
        .handler
        .emit_error_response(
            &offending,
            error_codes::AUTH_FAILED,
            &verdict.unwrap_err().to_string(),
        )
        .await;

    let inbox = sender_transport.sent_to_me();
    assert_eq!(inbox.len(), 1, "sender got exactly one ERROR response");
    let error: Message = protocol::decode(inbox[0].0.as_bytes(), protocol::WireFormat::Json)
        .expect("error response decodes");
    assert_eq!(error.header.message_type, MessageType::Error);
    assert_eq!(error.payload.command, "error");
    assert_eq!(error.payload.data["error_code"], error_codes::AUTH_FAILED);
    assert_eq!(
        error.payload.data["original_message_id"],
        offending.header.message_id
    );

    // Audit trail names the rejection.
    let events = receiver
        .auth
        .get_audit_log(Some("auth_insufficient_level"), Some("auth-basic-sender"), 10);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].details["command"], "admin_restart");
    assert_eq!(events[0].details["required_level"], "ADMIN");
}

#[tokio::test]
async fn admin_token_passes_the_same_rule() {
    let receiver = build_receiver("auth-gateway-2");
    let token = receiver.tokens.generate_token(SESSION);
    receiver.auth.grant_permissions(SESSION, ["admin"]);

    let message = admin_restart_from("auth-admin-sender", &token);
    let context = receiver
        .auth
        .authenticate_message(&message)
        .expect("admin clears the admin rule");
    assert!(receiver.auth.authorize_action(&context, "restart", Some("gateway")));
}

#[tokio::test]
async fn blocked_sender_is_rejected_before_rules() {
    let receiver = build_receiver("auth-gateway-3");
    receiver.auth.block_agent("mallory", "abuse");
    let token = receiver.tokens.generate_token(SESSION);

    let message = admin_restart_from("mallory", &token);
    assert!(matches!(
        receiver.auth.authenticate_message(&message),
        Err(AuthError::Blocked(_))
    ));
    let events = receiver.auth.get_audit_log(Some("auth_blocked_agent"), None, 10);
    assert_eq!(events.len(), 1);
}
