//! End-to-End: basic RPC between two agents over WebSocket.
//!
//! 1. Agents A and B each run a WebSocket server and a message pipeline,
//!    sharing one encryption key and session "s1".
//! 2. B registers a handler for "ping" that replies with `{pong: true}`.
//! 3. A sends a REQUEST through `send_request_and_wait_response`.
//! 4. A's waiter completes with a RESPONSE carrying the original message ID.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use interlinq::crypto::EncryptionHandler;
use interlinq::pipeline::{self, MessageHandler, PipelineConfig};
use interlinq::protocol::{Message, MessageDraft, MessageType};
use interlinq::session::TokenManager;
use interlinq::transport::{Transport, TransportConfig, WsTransport};

const SHARED_KEY: &str = "K";
const SESSION: &str = "s1";

struct Agent {
    handler: Arc<MessageHandler>,
    transport: Arc<WsTransport>,
}

/// Build one agent: token for the shared session, encrypted pipeline, and a
/// WebSocket server on an ephemeral port.
async fn spawn_agent(agent_id: &str) -> Agent {
    let tokens = Arc::new(TokenManager::default());
    tokens.generate_token(SESSION);
    let crypto = Arc::new(EncryptionHandler::with_shared_key(SHARED_KEY));
    let transport = Arc::new(WsTransport::new(TransportConfig {
        port: 0,
        ..TransportConfig::default()
    }));
    let handler = Arc::new(MessageHandler::with_config(
        agent_id,
        tokens,
        crypto,
        Arc::clone(&transport) as Arc<dyn Transport>,
        PipelineConfig::default(),
    ));
    pipeline::wire_inbound(&handler, None, true);
    transport.start_server().await.expect("ws server starts");
    Agent { handler, transport }
}

/// Pump the session queue so queued messages reach their handlers/waiters.
fn start_pump(handler: Arc<MessageHandler>) {
    tokio::spawn(async move {
        loop {
            handler.process_messages(SESSION, 16).await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });
}

#[tokio::test]
async fn request_gets_matching_response() {
    let a = spawn_agent("agent-a").await;
    let b = spawn_agent("agent-b").await;
    let a_addr = a.transport.local_addr().unwrap().to_string();
    let b_addr = b.transport.local_addr().unwrap().to_string();

    a.handler.register_route("agent-b", &b_addr);
    b.handler.register_route("agent-a", &a_addr);

    // B answers "ping" with {pong: true}, correlated by the request ID.
    let replier = Arc::clone(&b.handler);
    b.handler.register_command_handler(
        "ping",
        interlinq::pipeline::command_fn(move |request: Message| {
            let replier = Arc::clone(&replier);
            async move {
                let response = replier.protocol().create_message(MessageDraft::new(
                    &request.header.sender_id,
                    MessageType::Response,
                    "pong",
                    json!({
                        "pong": true,
                        "original_message_id": request.header.message_id,
                    }),
                    &request.header.session_id,
                ));
                replier
                    .send_message(&response, true)
                    .await
                    .expect("response send");
            }
        }),
    );

    start_pump(Arc::clone(&a.handler));
    start_pump(Arc::clone(&b.handler));

    let request = a.handler.protocol().create_message(MessageDraft::new(
        "agent-b",
        MessageType::Request,
        "ping",
        json!({}),
        SESSION,
    ));
    let request_id = request.header.message_id.clone();

    let response = a
        .handler
        .send_request_and_wait_response(&request, Duration::from_secs(5))
        .await
        .expect("RPC should complete");

    assert_eq!(response.header.message_type, MessageType::Response);
    assert_eq!(response.payload.data["pong"], true);
    assert_eq!(response.payload.data["original_message_id"], request_id);

    let a_stats = a.handler.statistics();
    assert_eq!(a_stats.messages_sent, 1);
    assert_eq!(a_stats.messages_received, 1);
    assert_eq!(a_stats.pending_responses, 0);
    let b_stats = b.handler.statistics();
    assert_eq!(b_stats.messages_received, 1);
    assert_eq!(b_stats.messages_sent, 1);
}

#[tokio::test]
async fn rpc_times_out_without_a_responder() {
    let a = spawn_agent("agent-a2").await;
    let b = spawn_agent("agent-b2").await;
    let b_addr = b.transport.local_addr().unwrap().to_string();
    a.handler.register_route("agent-b2", &b_addr);

    start_pump(Arc::clone(&a.handler));
    // B never registers a "ping" handler and never replies.
    start_pump(Arc::clone(&b.handler));

    let request = a.handler.protocol().create_message(MessageDraft::new(
        "agent-b2",
        MessageType::Request,
        "ping",
        json!({}),
        SESSION,
    ));
    let response = a
        .handler
        .send_request_and_wait_response(&request, Duration::from_millis(300))
        .await;
    assert!(response.is_none(), "no responder means timeout");
    assert_eq!(a.handler.statistics().pending_responses, 0);
}

#[tokio::test]
async fn tampered_ciphertext_never_reaches_the_queue() {
    let a = spawn_agent("agent-a3").await;
    let a_addr = a.transport.local_addr().unwrap().to_string();

    // A rogue client throws junk at A's server; the pipeline counts the
    // decrypt failure and keeps running.
    let rogue = WsTransport::new(TransportConfig {
        port: 0,
        ..TransportConfig::default()
    });
    rogue
        .send_message(&a_addr, "bm90LXJlYWwtY2lwaGVydGV4dA")
        .await
        .expect("frame is accepted at the socket level");

    tokio::time::sleep(Duration::from_millis(100)).await;
    let stats = a.handler.statistics();
    assert_eq!(stats.errors, 1);
    assert_eq!(stats.messages_received, 0);
    assert_eq!(stats.queued_messages, 0);
}
