//! End-to-End: heartbeat-driven reconnect.
//!
//! Peer P is CONNECTED with a short heartbeat timeout.  When P stops
//! answering, the supervisor demotes it to RECONNECTING within one period
//! of the timeout and re-dials; P either recovers to CONNECTED or lands in
//! ERROR once the retry budget is spent.

use std::sync::Arc;
use std::time::Duration;

use il_test_utils::MockTransport;
use interlinq::pipeline::{
    ConnectionConfig, ConnectionManager, ConnectionStatus, MessageHandler, PipelineConfig,
    wire_inbound,
};
use interlinq::crypto::EncryptionHandler;
use interlinq::session::TokenManager;
use interlinq::transport::Transport;

fn fast_config() -> ConnectionConfig {
    ConnectionConfig {
        heartbeat_interval: Duration::from_millis(25),
        heartbeat_timeout: Duration::from_millis(80),
        supervisor_period: Duration::from_millis(25),
        max_retries: 3,
    }
}

#[tokio::test]
async fn silent_peer_recovers_when_it_comes_back() {
    let transport = MockTransport::register("hb-agent-a");
    let peer = MockTransport::register("hb-peer-a");
    let manager = Arc::new(ConnectionManager::with_config(
        transport as Arc<dyn Transport>,
        "hb-agent-a",
        None,
        fast_config(),
    ));

    manager.connect_to_agent("peer", "hb-peer-a").await.unwrap();
    manager.start();

    // Healthy phase: heartbeats keep last_seen fresh, status stays put.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(
        manager.get_connection_status("peer"),
        Some(ConnectionStatus::Connected)
    );
    assert!(!peer.sent_to_me().is_empty(), "heartbeats flowed");

    // Peer goes dark: within heartbeat_timeout + one supervisor period it
    // must leave CONNECTED.
    peer.set_online(false);
    tokio::time::sleep(Duration::from_millis(160)).await;
    let during_outage = manager.get_connection_status("peer").unwrap();
    assert_ne!(during_outage, ConnectionStatus::Connected);

    // Peer returns before the budget runs out (max_retries=3, one retry per
    // supervisor pass).
    peer.set_online(true);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(
        manager.get_connection_status("peer"),
        Some(ConnectionStatus::Connected),
        "re-dial succeeded after the peer came back"
    );
    manager.stop().await;
}

#[tokio::test]
async fn silent_peer_exhausts_retries_into_error() {
    let transport = MockTransport::register("hb-agent-b");
    let peer = MockTransport::register("hb-peer-b");
    let manager = Arc::new(ConnectionManager::with_config(
        transport as Arc<dyn Transport>,
        "hb-agent-b",
        None,
        fast_config(),
    ));

    manager.connect_to_agent("peer", "hb-peer-b").await.unwrap();
    peer.set_online(false);
    manager.start();

    // timeout (80ms) + 3 failed retries at ~25ms cadence, with margin.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let info = manager.get_connection_info("peer").unwrap();
    assert_eq!(info.status, ConnectionStatus::Error, "terminal after retries");
    assert_eq!(info.retry_count, info.max_retries);
    manager.stop().await;

    // ERROR is terminal until the operator re-dials.
    peer.set_online(true);
    manager.connect_to_agent("peer", "hb-peer-b").await.unwrap();
    assert_eq!(
        manager.get_connection_status("peer"),
        Some(ConnectionStatus::Connected)
    );
}

#[tokio::test]
async fn inbound_traffic_counts_as_liveness() {
    let transport = MockTransport::register("hb-agent-c");
    let peer_transport = MockTransport::register("hb-peer-c");

    let tokens = Arc::new(TokenManager::default());
    tokens.generate_token("hb-session");
    let handler = Arc::new(MessageHandler::with_config(
        "hb-agent-c",
        Arc::clone(&tokens),
        Arc::new(EncryptionHandler::new()),
        Arc::clone(&transport) as Arc<dyn Transport>,
        PipelineConfig {
            encrypt_by_default: false,
            ..PipelineConfig::default()
        },
    ));
    let manager = Arc::new(ConnectionManager::with_config(
        Arc::clone(&transport) as Arc<dyn Transport>,
        "hb-agent-c",
        None,
        fast_config(),
    ));
    wire_inbound(&handler, Some(&manager), false);

    manager
        .connect_to_agent("hb-peer-c", "hb-peer-c")
        .await
        .unwrap();
    let before = manager.get_connection_info("hb-peer-c").unwrap().last_seen;

    // The peer sends a normal message; the receive upcall bumps last_seen.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let msg = interlinq::protocol::Protocol::new("hb-peer-c").create_message(
        interlinq::protocol::MessageDraft::new(
            "hb-agent-c",
            interlinq::protocol::MessageType::Notification,
            "status_update",
            serde_json::json!({}),
            "hb-session",
        ),
    );
    let encoded = interlinq::protocol::encode_json(&msg).unwrap();
    peer_transport
        .send_message("hb-agent-c", &encoded)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    let after = manager.get_connection_info("hb-peer-c").unwrap().last_seen;
    assert!(after > before, "inbound message refreshed liveness");
}
