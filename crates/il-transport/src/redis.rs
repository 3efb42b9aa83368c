//! Redis pub/sub transport.
//!
//! Subscribes to `{prefix}:{agent_id}` and `{prefix}:broadcast`; sends
//! publish to `{prefix}:{target}` with a JSON envelope
//! `{sender, content, timestamp}`.  There are no peer connections:
//! `connect_to_peer` / `disconnect_from_peer` succeed without doing
//! anything, and liveness is the broker's concern.

use std::sync::{Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{InboundHandler, Transport, TransportError, deliver};

/// Redis-specific configuration.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub password: Option<String>,
    pub channel_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        RedisConfig {
            host: "127.0.0.1".to_owned(),
            port: 6379,
            db: 0,
            password: None,
            channel_prefix: "interlinq".to_owned(),
        }
    }
}

impl RedisConfig {
    fn url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

/// Channel envelope published for every message.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    sender: String,
    content: String,
    timestamp: f64,
}

fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Redis pub/sub transport bound to one agent identity.
pub struct RedisTransport {
    config: RedisConfig,
    agent_id: String,
    handler: std::sync::Arc<RwLock<Option<InboundHandler>>>,
    publisher: tokio::sync::Mutex<Option<redis::aio::MultiplexedConnection>>,
    listener: Mutex<Option<ListenerHandle>>,
}

struct ListenerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RedisTransport {
    pub fn new(config: RedisConfig, agent_id: impl Into<String>) -> Self {
        RedisTransport {
            config,
            agent_id: agent_id.into(),
            handler: std::sync::Arc::new(RwLock::new(None)),
            publisher: tokio::sync::Mutex::new(None),
            listener: Mutex::new(None),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Publish channel for a target agent (`"*"` maps to the broadcast
    /// channel).
    fn channel_for(&self, target: &str) -> String {
        if target == "*" {
            format!("{}:broadcast", self.config.channel_prefix)
        } else {
            format!("{}:{}", self.config.channel_prefix, target)
        }
    }
}

#[async_trait]
impl Transport for RedisTransport {
    async fn start_server(&self) -> Result<(), TransportError> {
        let client = redis::Client::open(self.config.url())
            .map_err(|e| TransportError::Backend(e.to_string()))?;

        let publisher = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| TransportError::Backend(e.to_string()))?;
        *self.publisher.lock().await = Some(publisher);

        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| TransportError::Backend(e.to_string()))?;
        let own_channel = self.channel_for(&self.agent_id);
        let broadcast_channel = self.channel_for("*");
        pubsub
            .subscribe(&[own_channel.as_str(), broadcast_channel.as_str()])
            .await
            .map_err(|e| TransportError::Backend(e.to_string()))?;
        info!(
            channel = %own_channel,
            broadcast = %broadcast_channel,
            "redis transport subscribed"
        );

        let handler = std::sync::Arc::clone(&self.handler);
        let (tx, mut rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            loop {
                let msg = tokio::select! {
                    m = stream.next() => m,
                    _ = rx.changed() => break,
                };
                let Some(msg) = msg else { break };
                let Ok(payload) = msg.get_payload::<String>() else {
                    warn!("non-text redis payload dropped");
                    continue;
                };
                match serde_json::from_str::<Envelope>(&payload) {
                    Ok(envelope) => {
                        deliver(&handler, envelope.content, envelope.sender).await;
                    }
                    Err(e) => warn!(error = %e, "malformed redis envelope dropped"),
                }
            }
            debug!("redis listener exited");
        });

        *self.listener.lock().expect("listener slot poisoned") = Some(ListenerHandle {
            shutdown: tx,
            task,
        });
        Ok(())
    }

    async fn stop_server(&self) -> Result<(), TransportError> {
        let Some(handle) = self.listener.lock().expect("listener slot poisoned").take() else {
            return Err(TransportError::NotRunning);
        };
        let _ = handle.shutdown.send(true);
        let _ = handle.task.await;
        *self.publisher.lock().await = None;
        info!("redis transport stopped");
        Ok(())
    }

    async fn send_message(&self, target: &str, message: &str) -> Result<(), TransportError> {
        let mut guard = self.publisher.lock().await;
        let publisher = guard.as_mut().ok_or(TransportError::NotRunning)?;

        let envelope = Envelope {
            sender: self.agent_id.clone(),
            content: message.to_owned(),
            timestamp: now_ts(),
        };
        let payload = serde_json::to_string(&envelope)
            .map_err(|e| TransportError::Backend(e.to_string()))?;
        let channel = self.channel_for(target);
        let _: () = publisher
            .publish(&channel, payload)
            .await
            .map_err(|e| TransportError::Write {
                target: target.to_owned(),
                reason: e.to_string(),
            })?;
        debug!(%channel, "redis publish");
        Ok(())
    }

    async fn connect_to_peer(&self, _target: &str) -> Result<(), TransportError> {
        // Pub/sub has no peer connections; the broker handles fan-out.
        Ok(())
    }

    async fn disconnect_from_peer(&self, _target: &str) -> Result<(), TransportError> {
        Ok(())
    }

    fn set_message_handler(&self, handler: InboundHandler) {
        *self.handler.write().expect("handler slot poisoned") = Some(handler);
    }
}
