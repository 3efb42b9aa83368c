// il-transport: Byte-stream transports for agent messaging.
//
// Every transport implements the same contract: a server side that accepts
// inbound traffic and hands each received payload to the registered upcall,
// and a client side that sends payloads to named targets.  Transports carry
// opaque strings — decryption and decoding are the receiver's concern.
//
// Framing by transport:
// - WebSocket: one text frame per message, peers keyed by `host:port`
// - TCP: 4-byte big-endian length prefix, then the UTF-8 payload
// - Redis: pub/sub channels `{prefix}:{agent}` and `{prefix}:broadcast`,
//   JSON envelope `{sender, content, timestamp}`

pub mod redis;
pub mod tcp;
pub mod ws;

pub use redis::{RedisConfig, RedisTransport};
pub use tcp::TcpTransport;
pub use ws::WsTransport;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use thiserror::Error;

/// Upcall for inbound payloads: `(message, sender)`.
///
/// The sender string is transport-specific (peer `host:port` for socket
/// transports, the envelope's `sender` field for Redis).
pub type InboundHandler = Arc<dyn Fn(String, String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Common transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
    pub max_connections: usize,
    pub buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            host: "127.0.0.1".to_owned(),
            port: 8080,
            timeout: Duration::from_secs(30),
            max_connections: 100,
            buffer_size: 8192,
        }
    }
}

/// Errors from transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("bind failed: {0}")]
    Bind(std::io::Error),
    #[error("dial failed for {target}: {reason}")]
    Dial { target: String, reason: String },
    #[error("write failed for {target}: {reason}")]
    Write { target: String, reason: String },
    #[error("peer not connected: {0}")]
    NotConnected(String),
    #[error("server not running")]
    NotRunning,
    #[error("broadcast not supported by this transport")]
    BroadcastUnsupported,
    #[error("frame too large ({size} > {max} bytes)")]
    FrameTooLarge { size: usize, max: usize },
    #[error("backend error: {0}")]
    Backend(String),
}

/// The uniform transport contract.
///
/// Implementations use interior mutability: all methods take `&self` so the
/// object can be shared behind an `Arc<dyn Transport>` between the message
/// pipeline and the connection manager.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Begin accepting inbound traffic.
    async fn start_server(&self) -> Result<(), TransportError>;

    /// Graceful shutdown: in-flight receives drain, in-flight sends may be
    /// aborted.
    async fn stop_server(&self) -> Result<(), TransportError>;

    /// Send one payload to a named target.
    async fn send_message(&self, target: &str, message: &str) -> Result<(), TransportError>;

    /// Establish a persistent connection to a peer (no-op for transports
    /// without peer semantics).
    async fn connect_to_peer(&self, target: &str) -> Result<(), TransportError>;

    /// Tear down a persistent peer connection (no-op where not applicable).
    async fn disconnect_from_peer(&self, target: &str) -> Result<(), TransportError>;

    /// Register the inbound upcall.  Replaces any previous handler.
    fn set_message_handler(&self, handler: InboundHandler);
}

/// Convenience: wrap an async closure as an [`InboundHandler`].
pub fn handler_fn<F, Fut>(f: F) -> InboundHandler
where
    F: Fn(String, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |message, sender| Box::pin(f(message, sender)))
}

/// Helper for transport implementations: pull the current handler out of
/// its slot and invoke it.  A missing handler drops the payload.
pub async fn deliver(
    slot: &std::sync::RwLock<Option<InboundHandler>>,
    message: String,
    sender: String,
) {
    let handler = slot.read().expect("handler slot poisoned").clone();
    if let Some(handler) = handler {
        handler(message, sender).await;
    }
}
