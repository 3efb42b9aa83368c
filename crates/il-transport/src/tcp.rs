//! TCP transport with length-prefixed framing.
//!
//! Each frame is a 4-byte big-endian length followed by that many bytes of
//! UTF-8 payload.  Outbound sends open a fresh connection per message — no
//! pooling.  That keeps the sender stateless at the cost of per-message
//! connection setup.

use std::net::SocketAddr;
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{InboundHandler, Transport, TransportConfig, TransportError, deliver};

/// Upper bound on a single inbound frame; counterpart of the protocol's
/// 1 MiB message cap with headroom for encryption expansion.
const MAX_FRAME: usize = 4 * 1024 * 1024;

/// TCP transport: framed server plus connection-per-send client.
pub struct TcpTransport {
    config: TransportConfig,
    handler: std::sync::Arc<RwLock<Option<InboundHandler>>>,
    server: Mutex<Option<ServerHandle>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

struct ServerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TcpTransport {
    pub fn new(config: TransportConfig) -> Self {
        TcpTransport {
            config,
            handler: std::sync::Arc::new(RwLock::new(None)),
            server: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// The bound server address (set after `start_server`; useful with
    /// port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().expect("addr slot poisoned")
    }

    fn split_target(&self, target: &str) -> (String, u16) {
        match target.rsplit_once(':') {
            Some((host, port)) => match port.parse() {
                Ok(port) => (host.to_owned(), port),
                Err(_) => (target.to_owned(), self.config.port),
            },
            None => (target.to_owned(), self.config.port),
        }
    }

    async fn serve_connection(
        mut stream: TcpStream,
        peer: SocketAddr,
        handler: std::sync::Arc<RwLock<Option<InboundHandler>>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let sender = peer.to_string();
        loop {
            let mut len_buf = [0u8; 4];
            let read = tokio::select! {
                r = stream.read_exact(&mut len_buf) => r,
                _ = shutdown.changed() => break,
            };
            if read.is_err() {
                // Peer closed between frames; normal termination.
                debug!(peer = %sender, "tcp client disconnected");
                break;
            }
            let len = u32::from_be_bytes(len_buf) as usize;
            if len > MAX_FRAME {
                warn!(peer = %sender, len, "oversized tcp frame, dropping connection");
                break;
            }
            let mut payload = vec![0u8; len];
            if stream.read_exact(&mut payload).await.is_err() {
                warn!(peer = %sender, "truncated tcp frame");
                break;
            }
            match String::from_utf8(payload) {
                Ok(text) => deliver(&handler, text, sender.clone()).await,
                Err(_) => warn!(peer = %sender, "non-utf8 tcp frame dropped"),
            }
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn start_server(&self) -> Result<(), TransportError> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port))
            .await
            .map_err(TransportError::Bind)?;
        let addr = listener.local_addr().map_err(TransportError::Bind)?;
        *self.local_addr.lock().expect("addr slot poisoned") = Some(addr);

        let handler = std::sync::Arc::clone(&self.handler);
        let (tx, mut rx) = watch::channel(false);
        let conn_shutdown = tx.subscribe();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "tcp client connected");
                            tokio::spawn(Self::serve_connection(
                                stream,
                                peer,
                                std::sync::Arc::clone(&handler),
                                conn_shutdown.clone(),
                            ));
                        }
                        Err(e) => {
                            warn!(error = %e, "tcp accept failed");
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
        info!(%addr, "tcp server started");
        Ok(())
    }

    async fn stop_server(&self) -> Result<(), TransportError> {
        let Some(handle) = self.server.lock().expect("server slot poisoned").take() else {
            return Err(TransportError::NotRunning);
        };
        let _ = handle.shutdown.send(true);
        let _ = handle.task.await;
        info!("tcp server stopped");
        Ok(())
    }

    async fn send_message(&self, target: &str, message: &str) -> Result<(), TransportError> {
        let (host, port) = self.split_target(target);
        let mut stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| TransportError::Dial {
                target: target.to_owned(),
                reason: e.to_string(),
            })?;

        let bytes = message.as_bytes();
        #[allow(clippy::cast_possible_truncation)]
        let len = (bytes.len() as u32).to_be_bytes();
        let write = async {
            stream.write_all(&len).await?;
            stream.write_all(bytes).await?;
            stream.shutdown().await
        };
        write.await.map_err(|e| TransportError::Write {
            target: target.to_owned(),
            reason: e.to_string(),
        })?;
        debug!(target, bytes = bytes.len(), "tcp frame sent");
        Ok(())
    }

    async fn connect_to_peer(&self, _target: &str) -> Result<(), TransportError> {
        // Connections are opened per send; nothing to establish up front.
        Ok(())
    }

    async fn disconnect_from_peer(&self, _target: &str) -> Result<(), TransportError> {
        Ok(())
    }

    fn set_message_handler(&self, handler: InboundHandler) {
        *self.handler.write().expect("handler slot poisoned") = Some(handler);
    }
}
