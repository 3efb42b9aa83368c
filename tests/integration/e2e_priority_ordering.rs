//! End-to-End: strict priority ordering within one session.
//!
//! Enqueue, in arrival order: LOW L1, NORMAL N1, CRITICAL C1, HIGH H1,
//! NORMAL N2 — all in session "s2".  `process_messages(s2, 5)` must
//! dispatch C1, H1, N1, N2, L1.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use il_test_utils::MockTransport;
use interlinq::crypto::EncryptionHandler;
use interlinq::pipeline::{MessageHandler, PipelineConfig, command_fn};
use interlinq::protocol::{self, Message, MessageDraft, MessageType, Priority};
use interlinq::session::TokenManager;
use interlinq::transport::Transport;

const SESSION: &str = "s2";

fn build_handler(agent_id: &str) -> Arc<MessageHandler> {
    let transport = MockTransport::register(agent_id);
    Arc::new(MessageHandler::with_config(
        agent_id,
        Arc::new(TokenManager::default()),
        Arc::new(EncryptionHandler::new()),
        transport as Arc<dyn Transport>,
        PipelineConfig {
            encrypt_by_default: false,
            ..PipelineConfig::default()
        },
    ))
}

async fn feed(handler: &MessageHandler, label: &str, priority: Priority) -> String {
    let msg = handler.protocol().create_message(
        MessageDraft::new(
            "peer",
            MessageType::Notification,
            "record",
            json!({ "label": label }),
            SESSION,
        )
        .priority(priority),
    );
    let id = msg.header.message_id.clone();
    let encoded = protocol::encode_json(&msg).unwrap();
    assert!(handler.receive_message(&encoded, false).await);
    id
}

#[tokio::test]
async fn critical_beats_high_beats_normal_beats_low() {
    let handler = build_handler("prio-e2e-a");

    feed(&handler, "L1", Priority::Low).await;
    feed(&handler, "N1", Priority::Normal).await;
    feed(&handler, "C1", Priority::Critical).await;
    feed(&handler, "H1", Priority::High).await;
    feed(&handler, "N2", Priority::Normal).await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    handler.register_command_handler(
        "record",
        command_fn(move |message: Message| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(message.payload.data["label"].as_str().unwrap().to_owned());
            }
        }),
    );

    assert_eq!(handler.process_messages(SESSION, 5).await, 5);

    let mut order = Vec::new();
    while let Ok(label) = rx.try_recv() {
        order.push(label);
    }
    assert_eq!(order, vec!["C1", "H1", "N1", "N2", "L1"]);
}

#[tokio::test]
async fn ordering_holds_across_multiple_processing_calls() {
    let handler = build_handler("prio-e2e-b");

    feed(&handler, "L1", Priority::Low).await;
    feed(&handler, "C1", Priority::Critical).await;
    feed(&handler, "N1", Priority::Normal).await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    handler.register_command_handler(
        "record",
        command_fn(move |message: Message| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(message.payload.data["label"].as_str().unwrap().to_owned());
            }
        }),
    );

    // Drain two, then feed a HIGH message: it must still beat the queued
    // NORMAL and LOW leftovers... but C1 was already dispatched.
    assert_eq!(handler.process_messages(SESSION, 1).await, 1);
    feed(&handler, "H1", Priority::High).await;
    assert_eq!(handler.process_messages(SESSION, 3).await, 3);

    tokio::time::sleep(Duration::from_millis(10)).await;
    let mut order = Vec::new();
    while let Ok(label) = rx.try_recv() {
        order.push(label);
    }
    assert_eq!(order, vec!["C1", "H1", "N1", "L1"]);
}

#[tokio::test]
async fn sessions_do_not_share_queues() {
    let handler = build_handler("prio-e2e-c");

    // Same command, two sessions.
    let m1 = handler.protocol().create_message(
        MessageDraft::new("peer", MessageType::Notification, "record", json!({}), "s-one")
            .priority(Priority::Critical),
    );
    let m2 = handler.protocol().create_message(
        MessageDraft::new("peer", MessageType::Notification, "record", json!({}), "s-two")
            .priority(Priority::Low),
    );
    for m in [&m1, &m2] {
        let encoded = protocol::encode_json(m).unwrap();
        handler.receive_message(&encoded, false).await;
    }

    assert_eq!(handler.process_messages("s-one", 10).await, 1);
    assert_eq!(handler.statistics().queued_messages, 1, "s-two untouched");
    assert_eq!(handler.process_messages("s-two", 10).await, 1);
}
