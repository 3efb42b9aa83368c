//! Message handler: queues, dispatch, and request/reply correlation.
//!
//! # Send path
//! token check → canonical JSON → optional encryption → route lookup →
//! transport send.
//!
//! # Receive path
//! optional decryption → decode → validation → per-session priority queue.
//! Decode and decrypt failures are counted, never fatal.  Validation
//! failures answer the sender with an ERROR response.
//!
//! # Processing
//! `process_messages` drains one session's queue in strict priority order
//! (CRITICAL before HIGH before NORMAL before LOW, FIFO within a lane).
//! RESPONSE messages complete their pending-reply waiter; everything else
//! dispatches to the handler registered for its command.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use il_crypto::{CryptoError, EncryptionHandler};
use il_protocol::{
    BROADCAST, Message, MessageType, Priority, Protocol, ProtocolError, error_codes,
};
use il_session::TokenManager;
use il_transport::{Transport, TransportError};

/// Registered handler for one command: receives the full message.
pub type CommandHandler = Arc<dyn Fn(Message) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`CommandHandler`].
pub fn command_fn<F, Fut>(f: F) -> CommandHandler
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |message| Box::pin(f(message)))
}

/// Errors surfaced by explicit pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no token known for session {0}")]
    UnknownSession(String),
    #[error("no route to agent {0}")]
    NoRoute(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Pipeline tuning knobs.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Per-session queue cap; overflow drops the lowest-priority entry.
    pub queue_bound: usize,
    /// Default encryption setting for `wire_inbound` callers.
    pub encrypt_by_default: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            queue_bound: 10_000,
            encrypt_by_default: true,
        }
    }
}

/// Counter snapshot plus queue gauges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_processed: u64,
    pub errors: u64,
    pub pending_responses: usize,
    pub queued_messages: usize,
}

// ---------------------------------------------------------------------------
// Priority lanes
// ---------------------------------------------------------------------------

/// Four FIFO lanes for one session.
#[derive(Default)]
struct Lanes {
    critical: VecDeque<Message>,
    high: VecDeque<Message>,
    normal: VecDeque<Message>,
    low: VecDeque<Message>,
}

impl Lanes {
    fn push(&mut self, message: Message) {
        match message.header.priority {
            Priority::Critical => self.critical.push_back(message),
            Priority::High => self.high.push_back(message),
            Priority::Normal => self.normal.push_back(message),
            Priority::Low => self.low.push_back(message),
        }
    }

    fn pop(&mut self) -> Option<Message> {
        self.critical
            .pop_front()
            .or_else(|| self.high.pop_front())
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }

    /// Evict the newest entry of the lowest-priority non-empty lane.
    fn drop_lowest(&mut self) -> Option<Message> {
        self.low
            .pop_back()
            .or_else(|| self.normal.pop_back())
            .or_else(|| self.high.pop_back())
            .or_else(|| self.critical.pop_back())
    }

    fn len(&self) -> usize {
        self.critical.len() + self.high.len() + self.normal.len() + self.low.len()
    }
}

// ---------------------------------------------------------------------------
// MessageHandler
// ---------------------------------------------------------------------------

type ActivityObserver = Arc<dyn Fn(&str) + Send + Sync>;

/// Processes, queues, and delivers messages for one agent.
pub struct MessageHandler {
    protocol: Protocol,
    tokens: Arc<TokenManager>,
    crypto: Arc<EncryptionHandler>,
    transport: Arc<dyn Transport>,
    config: PipelineConfig,

    /// agent_id → transport address
    routes: Mutex<HashMap<String, String>>,
    /// session_id → priority lanes
    queues: Mutex<HashMap<String, Lanes>>,
    commands: RwLock<HashMap<String, CommandHandler>>,
    /// request message_id → single-use reply waiter
    pending: Mutex<HashMap<String, oneshot::Sender<Message>>>,
    observer: RwLock<Option<ActivityObserver>>,

    sent: AtomicU64,
    received: AtomicU64,
    processed: AtomicU64,
    errors: AtomicU64,
}

impl MessageHandler {
    pub fn new(
        agent_id: impl Into<String>,
        tokens: Arc<TokenManager>,
        crypto: Arc<EncryptionHandler>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self::with_config(agent_id, tokens, crypto, transport, PipelineConfig::default())
    }

    pub fn with_config(
        agent_id: impl Into<String>,
        tokens: Arc<TokenManager>,
        crypto: Arc<EncryptionHandler>,
        transport: Arc<dyn Transport>,
        config: PipelineConfig,
    ) -> Self {
        MessageHandler {
            protocol: Protocol::new(agent_id),
            tokens,
            crypto,
            transport,
            config,
            routes: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            commands: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            observer: RwLock::new(None),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// The message factory for this agent; callers create outbound messages
    /// through it so IDs stay monotonic.
    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Register the handler invoked for messages carrying `command`.
    /// Replaces any previous registration.
    pub fn register_command_handler(&self, command: &str, handler: CommandHandler) {
        self.commands
            .write()
            .expect("command registry poisoned")
            .insert(command.to_owned(), handler);
    }

    /// Map an agent ID to a transport address for outbound routing.
    pub fn register_route(&self, agent_id: &str, address: &str) {
        self.routes
            .lock()
            .expect("route table poisoned")
            .insert(agent_id.to_owned(), address.to_owned());
    }

    pub fn route_for(&self, agent_id: &str) -> Option<String> {
        self.routes
            .lock()
            .expect("route table poisoned")
            .get(agent_id)
            .cloned()
    }

    /// Observer called with the sender ID of every successfully decoded
    /// inbound message (connection-manager liveness hook).
    pub fn set_activity_observer(&self, observer: ActivityObserver) {
        *self.observer.write().expect("observer slot poisoned") = Some(observer);
    }

    // -----------------------------------------------------------------------
    // Send path
    // -----------------------------------------------------------------------

    /// Send a message.  Requires a known token for the message's session,
    /// a route (or broadcast) for the recipient, and — when `encrypt` —
    /// a configured encryption key.
    pub async fn send_message(
        &self,
        message: &Message,
        encrypt: bool,
    ) -> Result<(), PipelineError> {
        let result = self.send_inner(message, encrypt).await;
        match &result {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                debug!(message_id = %message.header.message_id, "message sent");
            }
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    message_id = %message.header.message_id,
                    error = %e,
                    "send failed"
                );
            }
        }
        result
    }

    async fn send_inner(&self, message: &Message, encrypt: bool) -> Result<(), PipelineError> {
        let session_id = &message.header.session_id;
        if !session_id.is_empty() && self.tokens.get_token_info(session_id).is_none() {
            return Err(PipelineError::UnknownSession(session_id.clone()));
        }

        let serialized = il_protocol::encode_json(message)?;
        let payload = if encrypt {
            self.crypto.encrypt_message(&serialized)?
        } else {
            serialized
        };

        let recipient = &message.header.recipient_id;
        let address = if recipient == BROADCAST {
            BROADCAST.to_owned()
        } else {
            self.route_for(recipient)
                .ok_or_else(|| PipelineError::NoRoute(recipient.clone()))?
        };
        self.transport.send_message(&address, &payload).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Receive path
    // -----------------------------------------------------------------------

    /// Accept one inbound payload.  Returns true when the message was
    /// queued; failures are counted and logged but never propagate.
    pub async fn receive_message(&self, data: &str, encrypted: bool) -> bool {
        let serialized = if encrypted {
            match self.crypto.decrypt_message(data) {
                Ok(text) => text,
                Err(e) => {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "inbound decrypt failed");
                    return false;
                }
            }
        } else {
            data.to_owned()
        };

        let message = match il_protocol::decode(serialized.as_bytes(), il_protocol::WireFormat::Json)
        {
            Ok(message) => message,
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "inbound decode failed");
                return false;
            }
        };

        if let Some(observer) = self.observer.read().expect("observer slot poisoned").clone() {
            observer(&message.header.sender_id);
        }

        if let Err(e) = il_protocol::validate_message(&message) {
            self.errors.fetch_add(1, Ordering::Relaxed);
            warn!(
                message_id = %message.header.message_id,
                error = %e,
                "inbound message invalid"
            );
            self.emit_error_response(&message, error_codes::VALIDATION_FAILED, &e.to_string())
                .await;
            return false;
        }

        self.enqueue(message).await;
        self.received.fetch_add(1, Ordering::Relaxed);
        true
    }

    async fn enqueue(&self, message: Message) {
        let overflow_victim = {
            let mut queues = self.queues.lock().expect("queue table poisoned");
            let lanes = queues
                .entry(message.header.session_id.clone())
                .or_default();
            let victim = if lanes.len() >= self.config.queue_bound {
                lanes.drop_lowest()
            } else {
                None
            };
            lanes.push(message);
            victim
        };

        if let Some(victim) = overflow_victim {
            self.errors.fetch_add(1, Ordering::Relaxed);
            warn!(
                session_id = %victim.header.session_id,
                dropped = %victim.header.message_id,
                "queue overflow, lowest-priority message dropped"
            );
            if victim.header.message_type == MessageType::Request {
                self.emit_error_response(
                    &victim,
                    error_codes::QUEUE_OVERFLOW,
                    "session queue full, request dropped",
                )
                .await;
            }
        }
    }

    /// Best-effort ERROR response back at a message's sender, bypassing the
    /// session token check (the offending message may not carry a session
    /// we know).
    pub async fn emit_error_response(&self, original: &Message, code: &str, description: &str) {
        let response = self
            .protocol
            .create_error_response(original, code, description);
        let Some(address) = self.route_for(&original.header.sender_id) else {
            debug!(
                sender = %original.header.sender_id,
                "no route for error response, dropping"
            );
            return;
        };
        let outcome = async {
            let serialized = il_protocol::encode_json(&response)?;
            let payload = if self.config.encrypt_by_default && self.crypto.has_key() {
                self.crypto.encrypt_message(&serialized)?
            } else {
                serialized
            };
            self.transport.send_message(&address, &payload).await?;
            Ok::<(), PipelineError>(())
        }
        .await;
        if let Err(e) = outcome {
            debug!(error = %e, "error response delivery failed");
        }
    }

    // -----------------------------------------------------------------------
    // Processing
    // -----------------------------------------------------------------------

    /// Drain up to `max_messages` from the session's queue in strict
    /// priority order and dispatch each.  Returns the number processed.
    pub async fn process_messages(&self, session_id: &str, max_messages: usize) -> usize {
        let batch: Vec<Message> = {
            let mut queues = self.queues.lock().expect("queue table poisoned");
            let Some(lanes) = queues.get_mut(session_id) else {
                return 0;
            };
            std::iter::from_fn(|| lanes.pop()).take(max_messages).collect()
        };

        let mut processed = 0;
        for message in batch {
            self.process_single(message).await;
            processed += 1;
            self.processed.fetch_add(1, Ordering::Relaxed);
        }
        processed
    }

    async fn process_single(&self, message: Message) {
        // Responses complete their waiter and go no further.
        if message.header.message_type == MessageType::Response {
            let original_id = message.payload.data["original_message_id"]
                .as_str()
                .map(ToOwned::to_owned);
            if let Some(original_id) = original_id {
                let waiter = self
                    .pending
                    .lock()
                    .expect("pending table poisoned")
                    .remove(&original_id);
                if let Some(waiter) = waiter {
                    // A closed receiver means the requester already timed out.
                    let _ = waiter.send(message);
                } else {
                    debug!(%original_id, "late response dropped");
                }
            }
            return;
        }

        let command = message.payload.command.clone();
        let handler = self
            .commands
            .read()
            .expect("command registry poisoned")
            .get(&command)
            .cloned();
        match handler {
            Some(handler) => {
                let message_id = message.header.message_id.clone();
                if AssertUnwindSafe(handler(message))
                    .catch_unwind()
                    .await
                    .is_err()
                {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    error!(%message_id, command, "command handler panicked");
                }
            }
            None => warn!(command, "no handler registered for command"),
        }
    }

    // -----------------------------------------------------------------------
    // Request / reply
    // -----------------------------------------------------------------------

    /// Send a request and suspend until the matching RESPONSE arrives or
    /// `timeout` elapses.  Returns `None` on send failure or timeout; a
    /// response arriving after the timeout is dropped silently.
    pub async fn send_request_and_wait_response(
        &self,
        message: &Message,
        timeout: Duration,
    ) -> Option<Message> {
        let message_id = message.header.message_id.clone();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending table poisoned")
            .insert(message_id.clone(), tx);

        if self.send_message(message, self.config.encrypt_by_default).await.is_err() {
            self.pending
                .lock()
                .expect("pending table poisoned")
                .remove(&message_id);
            return None;
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Some(response),
            // Timeout, or the waiter was dropped (e.g. queue cleared).
            _ => {
                self.pending
                    .lock()
                    .expect("pending table poisoned")
                    .remove(&message_id);
                warn!(%message_id, "request timed out waiting for response");
                None
            }
        }
    }

    // -----------------------------------------------------------------------
    // Statistics and maintenance
    // -----------------------------------------------------------------------

    pub fn statistics(&self) -> HandlerStats {
        let queued_messages = self
            .queues
            .lock()
            .expect("queue table poisoned")
            .values()
            .map(Lanes::len)
            .sum();
        HandlerStats {
            messages_sent: self.sent.load(Ordering::Relaxed),
            messages_received: self.received.load(Ordering::Relaxed),
            messages_processed: self.processed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            pending_responses: self.pending.lock().expect("pending table poisoned").len(),
            queued_messages,
        }
    }

    /// Discard a terminated session's queue.
    pub fn clear_session_queue(&self, session_id: &str) {
        self.queues
            .lock()
            .expect("queue table poisoned")
            .remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use il_protocol::MessageDraft;
    use il_test_utils::MockTransport;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Rig {
        handler: Arc<MessageHandler>,
        tokens: Arc<TokenManager>,
        _transport: Arc<MockTransport>,
    }

    fn rig(agent_id: &str, config: PipelineConfig) -> Rig {
        let tokens = Arc::new(TokenManager::default());
        let crypto = Arc::new(EncryptionHandler::with_shared_key("test-key"));
        let transport = MockTransport::register(agent_id);
        let handler = Arc::new(MessageHandler::with_config(
            agent_id,
            Arc::clone(&tokens),
            crypto,
            transport.clone() as Arc<dyn Transport>,
            config,
        ));
        Rig {
            handler,
            tokens,
            _transport: transport,
        }
    }

    fn unencrypted_config() -> PipelineConfig {
        PipelineConfig {
            encrypt_by_default: false,
            ..PipelineConfig::default()
        }
    }

    fn request(rig: &Rig, session: &str, command: &str, priority: Priority) -> Message {
        rig.handler.protocol().create_message(
            MessageDraft::new("peer", MessageType::Request, command, json!({}), session)
                .priority(priority),
        )
    }

    #[tokio::test]
    async fn send_requires_known_session_token() {
        let rig = rig("send-token-a", unencrypted_config());
        let msg = request(&rig, "s1", "work", Priority::Normal);
        assert!(matches!(
            rig.handler.send_message(&msg, false).await,
            Err(PipelineError::UnknownSession(_))
        ));
        assert_eq!(rig.handler.statistics().errors, 1);
    }

    #[tokio::test]
    async fn send_requires_route_to_recipient() {
        let rig = rig("send-route-a", unencrypted_config());
        rig.tokens.generate_token("s1");
        let msg = request(&rig, "s1", "work", Priority::Normal);
        assert!(matches!(
            rig.handler.send_message(&msg, false).await,
            Err(PipelineError::NoRoute(_))
        ));
    }

    #[tokio::test]
    async fn receive_decode_failure_is_counted_not_fatal() {
        let rig = rig("recv-garbage-a", unencrypted_config());
        assert!(!rig.handler.receive_message("{definitely not json", false).await);
        let stats = rig.handler.statistics();
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.messages_received, 0);
    }

    #[tokio::test]
    async fn receive_decrypt_failure_is_counted_not_fatal() {
        let rig = rig("recv-undec-a", PipelineConfig::default());
        assert!(!rig.handler.receive_message("not-a-ciphertext", true).await);
        assert_eq!(rig.handler.statistics().errors, 1);
    }

    #[tokio::test]
    async fn strict_priority_order_within_session() {
        let rig = rig("prio-a", unencrypted_config());
        let mut ids = Vec::new();
        for p in [
            Priority::Low,
            Priority::Normal,
            Priority::Critical,
            Priority::High,
            Priority::Normal,
        ] {
            let msg = request(&rig, "s2", "work", p);
            ids.push(msg.header.message_id.clone());
            let encoded = il_protocol::encode_json(&msg).unwrap();
            assert!(rig.handler.receive_message(&encoded, false).await);
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        rig.handler.register_command_handler(
            "work",
            command_fn(move |message: Message| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(message.header.message_id.clone());
                }
            }),
        );
        assert_eq!(rig.handler.process_messages("s2", 5).await, 5);

        let mut order = Vec::new();
        while let Ok(id) = rx.try_recv() {
            order.push(id);
        }
        // critical, high, normal (FIFO), low
        assert_eq!(
            order,
            vec![
                ids[2].clone(),
                ids[3].clone(),
                ids[1].clone(),
                ids[4].clone(),
                ids[0].clone()
            ]
        );
    }

    #[tokio::test]
    async fn process_respects_max_messages() {
        let rig = rig("max-a", unencrypted_config());
        for _ in 0..4 {
            let msg = request(&rig, "s1", "work", Priority::Normal);
            let encoded = il_protocol::encode_json(&msg).unwrap();
            rig.handler.receive_message(&encoded, false).await;
        }
        assert_eq!(rig.handler.process_messages("s1", 3).await, 3);
        assert_eq!(rig.handler.statistics().queued_messages, 1);
        assert_eq!(rig.handler.process_messages("s1", 10).await, 1);
    }

    #[tokio::test]
    async fn queue_overflow_drops_lowest_priority_and_counts_error() {
        let rig = rig(
            "overflow-a",
            PipelineConfig {
                queue_bound: 2,
                encrypt_by_default: false,
            },
        );
        let low = request(&rig, "s1", "work", Priority::Low);
        let low_id = low.header.message_id.clone();
        for msg in [
            low,
            request(&rig, "s1", "work", Priority::Normal),
            request(&rig, "s1", "work", Priority::Critical),
        ] {
            let encoded = il_protocol::encode_json(&msg).unwrap();
            rig.handler.receive_message(&encoded, false).await;
        }
        let stats = rig.handler.statistics();
        assert_eq!(stats.queued_messages, 2, "bound enforced");
        assert_eq!(stats.errors, 1, "overflow recorded");

        let (tx, mut rx) = mpsc::unbounded_channel();
        rig.handler.register_command_handler(
            "work",
            command_fn(move |message: Message| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(message.header.message_id.clone());
                }
            }),
        );
        rig.handler.process_messages("s1", 10).await;
        let mut survivors = Vec::new();
        while let Ok(id) = rx.try_recv() {
            survivors.push(id);
        }
        assert!(!survivors.contains(&low_id), "low-priority entry was evicted");
    }

    #[tokio::test]
    async fn unknown_command_is_not_an_error() {
        let rig = rig("unknown-cmd-a", unencrypted_config());
        let msg = request(&rig, "s1", "nobody_handles_this", Priority::Normal);
        let encoded = il_protocol::encode_json(&msg).unwrap();
        rig.handler.receive_message(&encoded, false).await;
        assert_eq!(rig.handler.process_messages("s1", 10).await, 1);
        assert_eq!(rig.handler.statistics().errors, 0);
    }

    #[tokio::test]
    async fn handler_panic_is_caught_and_counted() {
        let rig = rig("panic-a", unencrypted_config());
        rig.handler.register_command_handler(
            "explode",
            command_fn(|_msg: Message| async { panic!("handler bug") }),
        );
        let msg = request(&rig, "s1", "explode", Priority::Normal);
        let encoded = il_protocol::encode_json(&msg).unwrap();
        rig.handler.receive_message(&encoded, false).await;
        assert_eq!(rig.handler.process_messages("s1", 10).await, 1);
        assert_eq!(rig.handler.statistics().errors, 1);
    }

    #[tokio::test]
    async fn response_completes_pending_waiter_once() {
        let rig = rig("reply-a", unencrypted_config());
        rig.tokens.generate_token("s1");
        // Loop the transport back to ourselves so send succeeds.
        rig.handler.register_route("peer", "reply-a");

        let request_msg = request(&rig, "s1", "ping", Priority::Normal);
        let request_id = request_msg.header.message_id.clone();

        let waiter = {
            let handler = Arc::clone(&rig.handler);
            let request_msg = request_msg.clone();
            tokio::spawn(async move {
                handler
                    .send_request_and_wait_response(&request_msg, Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Fabricate the peer's response and run it through the pipeline.
        let response = rig.handler.protocol().create_message(MessageDraft::new(
            "reply-a",
            MessageType::Response,
            "pong",
            json!({ "original_message_id": request_id, "pong": true }),
            "s1",
        ));
        let encoded = il_protocol::encode_json(&response).unwrap();
        rig.handler.receive_message(&encoded, false).await;
        rig.handler.process_messages("s1", 10).await;

        let got = waiter.await.unwrap().expect("response should arrive");
        assert_eq!(got.payload.data["pong"], true);
        assert_eq!(rig.handler.statistics().pending_responses, 0);
    }

    #[tokio::test]
    async fn timeout_removes_waiter_and_late_response_is_dropped() {
        let rig = rig("timeout-a", unencrypted_config());
        rig.tokens.generate_token("s1");
        rig.handler.register_route("peer", "timeout-a");

        let request_msg = request(&rig, "s1", "ping", Priority::Normal);
        let request_id = request_msg.header.message_id.clone();
        let got = rig
            .handler
            .send_request_and_wait_response(&request_msg, Duration::from_millis(30))
            .await;
        assert!(got.is_none());
        assert_eq!(rig.handler.statistics().pending_responses, 0);

        // Late response: must vanish without effect.
        let response = rig.handler.protocol().create_message(MessageDraft::new(
            "timeout-a",
            MessageType::Response,
            "pong",
            json!({ "original_message_id": request_id }),
            "s1",
        ));
        let encoded = il_protocol::encode_json(&response).unwrap();
        rig.handler.receive_message(&encoded, false).await;
        rig.handler.process_messages("s1", 10).await;
        assert_eq!(rig.handler.statistics().pending_responses, 0);
    }

    #[tokio::test]
    async fn send_failure_removes_waiter() {
        let rig = rig("sendfail-a", unencrypted_config());
        // No token for the session: send fails fast.
        let request_msg = request(&rig, "s-unknown", "ping", Priority::Normal);
        let got = rig
            .handler
            .send_request_and_wait_response(&request_msg, Duration::from_secs(5))
            .await;
        assert!(got.is_none());
        assert_eq!(rig.handler.statistics().pending_responses, 0);
    }

    #[tokio::test]
    async fn clear_session_queue_discards_messages() {
        let rig = rig("clear-a", unencrypted_config());
        let msg = request(&rig, "s1", "work", Priority::Normal);
        let encoded = il_protocol::encode_json(&msg).unwrap();
        rig.handler.receive_message(&encoded, false).await;
        rig.handler.clear_session_queue("s1");
        assert_eq!(rig.handler.process_messages("s1", 10).await, 0);
    }
}
