//! WebSocket transport.
//!
//! One text frame carries one message.  The server side accepts connections
//! and tracks clients keyed by peer `host:port`; the client side dials peers
//! with `connect_to_peer` and keeps a receive loop per connection.  Sends to
//! an unknown target fall back to a transient dial-send-close connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, accept_async, connect_async};
use tracing::{debug, info, warn};

use crate::{InboundHandler, Transport, TransportConfig, TransportError, deliver};

type HandlerSlot = Arc<RwLock<Option<InboundHandler>>>;
type PeerMap = Arc<tokio::sync::Mutex<HashMap<String, Peer>>>;

/// One live connection: an outbound frame queue plus its receive loop.
struct Peer {
    tx: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
}

struct ServerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// WebSocket transport (server + client in one object).
pub struct WsTransport {
    config: TransportConfig,
    handler: HandlerSlot,
    peers: PeerMap,
    server: Mutex<Option<ServerHandle>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl WsTransport {
    pub fn new(config: TransportConfig) -> Self {
        WsTransport {
            config,
            handler: Arc::new(RwLock::new(None)),
            peers: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            server: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// The bound server address (set after `start_server`).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().expect("addr slot poisoned")
    }

    /// Wire up a connected WebSocket stream: a writer task draining the
    /// frame queue and a reader loop feeding the upcall.  Registers the peer
    /// and removes it again when the reader exits.
    async fn adopt_stream<S>(
        peer_key: String,
        ws: WebSocketStream<S>,
        handler: HandlerSlot,
        peers: PeerMap,
        mut shutdown: watch::Receiver<bool>,
    ) where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (mut write, mut read) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if write.send(frame).await.is_err() {
                    break;
                }
            }
        });

        let reader_tx = tx.clone();
        let reader_key = peer_key.clone();
        let reader_peers = Arc::clone(&peers);
        let reader = tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    f = read.next() => f,
                    _ = shutdown.changed() => break,
                };
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        deliver(&handler, text.to_string(), reader_key.clone()).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = reader_tx.send(Message::Pong(data));
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(peer = %reader_key, error = %e, "ws read error");
                        break;
                    }
                }
            }
            reader_peers.lock().await.remove(&reader_key);
            debug!(peer = %reader_key, "ws peer gone");
        });

        peers.lock().await.insert(peer_key, Peer { tx, reader });
    }

    fn server_shutdown_rx(&self) -> Option<watch::Receiver<bool>> {
        self.server
            .lock()
            .expect("server slot poisoned")
            .as_ref()
            .map(|h| h.shutdown.subscribe())
    }

    /// Shutdown receiver for connections made outside a running server.
    /// The shared sender never fires, so these readers run until their
    /// socket closes or `disconnect_from_peer` aborts them.
    fn detached_shutdown() -> watch::Receiver<bool> {
        static DETACHED: std::sync::OnceLock<watch::Sender<bool>> = std::sync::OnceLock::new();
        DETACHED
            .get_or_init(|| watch::channel(false).0)
            .subscribe()
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn start_server(&self) -> Result<(), TransportError> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port))
            .await
            .map_err(TransportError::Bind)?;
        let addr = listener.local_addr().map_err(TransportError::Bind)?;
        *self.local_addr.lock().expect("addr slot poisoned") = Some(addr);

        let handler = Arc::clone(&self.handler);
        let peers = Arc::clone(&self.peers);
        let (tx, mut rx) = watch::channel(false);
        let conn_shutdown = tx.subscribe();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer_addr)) => {
                            let handler = Arc::clone(&handler);
                            let peers = Arc::clone(&peers);
                            let shutdown = conn_shutdown.clone();
                            tokio::spawn(async move {
                                match accept_async(stream).await {
                                    Ok(ws) => {
                                        debug!(peer = %peer_addr, "ws client connected");
                                        Self::adopt_stream(
                                            peer_addr.to_string(),
                                            ws,
                                            handler,
                                            peers,
                                            shutdown,
                                        )
                                        .await;
                                    }
                                    Err(e) => {
                                        warn!(peer = %peer_addr, error = %e, "ws handshake failed");
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "ws accept failed");
                            break;
                        }
                    },
                    _ = rx.changed() => break,
                }
            }
        });

        *self.server.lock().expect("server slot poisoned") = Some(ServerHandle {
            shutdown: tx,
            task,
        });
        info!(%addr, "ws server started");
        Ok(())
    }

    async fn stop_server(&self) -> Result<(), TransportError> {
        let Some(handle) = self.server.lock().expect("server slot poisoned").take() else {
            return Err(TransportError::NotRunning);
        };
        let _ = handle.shutdown.send(true);
        let _ = handle.task.await;
        // Readers observe the shutdown signal and unregister themselves;
        // drop any remaining outbound queues.
        self.peers.lock().await.clear();
        info!("ws server stopped");
        Ok(())
    }

    async fn send_message(&self, target: &str, message: &str) -> Result<(), TransportError> {
        if let Some(peer) = self.peers.lock().await.get(target) {
            return peer
                .tx
                .send(Message::Text(message.to_owned().into()))
                .map_err(|_| TransportError::NotConnected(target.to_owned()));
        }

        // Unknown target: transient dial, send, close.
        let url = format!("ws://{target}");
        let (mut ws, _response) =
            connect_async(&url)
                .await
                .map_err(|e| TransportError::Dial {
                    target: target.to_owned(),
                    reason: e.to_string(),
                })?;
        ws.send(Message::Text(message.to_owned().into()))
            .await
            .map_err(|e| TransportError::Write {
                target: target.to_owned(),
                reason: e.to_string(),
            })?;
        let _ = ws.close(None).await;
        debug!(target, "ws transient send");
        Ok(())
    }

    async fn connect_to_peer(&self, target: &str) -> Result<(), TransportError> {
        let url = format!("ws://{target}");
        let (ws, _response): (WebSocketStream<MaybeTlsStream<TcpStream>>, _) =
            connect_async(&url)
                .await
                .map_err(|e| TransportError::Dial {
                    target: target.to_owned(),
                    reason: e.to_string(),
                })?;
        let shutdown = self
            .server_shutdown_rx()
            .unwrap_or_else(Self::detached_shutdown);
        Self::adopt_stream(
            target.to_owned(),
            ws,
            Arc::clone(&self.handler),
            Arc::clone(&self.peers),
            shutdown,
        )
        .await;
        info!(target, "ws peer connected");
        Ok(())
    }

    async fn disconnect_from_peer(&self, target: &str) -> Result<(), TransportError> {
        match self.peers.lock().await.remove(target) {
            Some(peer) => {
                peer.reader.abort();
                info!(target, "ws peer disconnected");
                Ok(())
            }
            None => Err(TransportError::NotConnected(target.to_owned())),
        }
    }

    fn set_message_handler(&self, handler: InboundHandler) {
        *self.handler.write().expect("handler slot poisoned") = Some(handler);
    }
}
